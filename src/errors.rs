use crate::models::{OrderStatus, PaymentMethod, PaymentStatus};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// How a failure should be treated by callers
///
/// Validation, NotFound and Conflict are expected business outcomes and are
/// shown to the user. Provider and Integrity failures are logged in full and
/// shown generically unless the message is known to be safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Provider,
    Integrity,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Provider => StatusCode::BAD_GATEWAY,
            ErrorKind::Integrity => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    let body = Json(json!({
        "success": false,
        "errorMessage": message,
    }));
    (status, body).into_response()
}

/// Storage-level failures. Never shown to end users verbatim.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Row disappeared inside unit of work: {0}")]
    MissingRow(String),

    /// A write would push a column past what it can hold.
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Injected failure at {0}")]
    InjectedFailure(String),
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Storage failure");
        error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Storage operation failed".to_string(),
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Insufficient funds. Required: {required}, Available: {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_) => ErrorKind::Validation,
            LedgerError::AccountNotFound(_) => ErrorKind::NotFound,
            LedgerError::InsufficientFunds { .. } => ErrorKind::Conflict,
            LedgerError::Store(_) => ErrorKind::Integrity,
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let message = match self {
            LedgerError::Store(ref e) => {
                tracing::error!(error = %e, "Ledger operation failed");
                "Could not update the balance".to_string()
            }
            _ => self.to_string(),
        };
        error_body(kind.status_code(), message)
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Account {0} is disabled")]
    AccountInactive(Uuid),

    #[error("Item not found or unavailable: {0}")]
    ItemUnavailable(Uuid),

    #[error("Item is out of stock. Requested: {requested}, Available: {available}")]
    InsufficientStock {
        item_id: Uuid,
        requested: u32,
        available: i32,
    },

    #[error("Insufficient funds. Required: {required}, Available: {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order {order_number} is {status} and cannot be refunded")]
    OrderNotRefundable {
        order_number: String,
        status: OrderStatus,
    },

    /// Unexpected failure mid-transaction. Everything was rolled back.
    #[error("Purchase failed: {0}")]
    PurchaseFailed(String),
}

impl PurchaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PurchaseError::InvalidQuantity(_) | PurchaseError::InvalidAmount(_) => {
                ErrorKind::Validation
            }
            PurchaseError::AccountNotFound(_)
            | PurchaseError::ItemUnavailable(_)
            | PurchaseError::OrderNotFound(_) => ErrorKind::NotFound,
            PurchaseError::AccountInactive(_)
            | PurchaseError::InsufficientStock { .. }
            | PurchaseError::InsufficientFunds { .. }
            | PurchaseError::OrderNotRefundable { .. } => ErrorKind::Conflict,
            PurchaseError::PurchaseFailed(_) => ErrorKind::Integrity,
        }
    }

    /// Message safe to show to the buyer.
    pub fn user_message(&self) -> String {
        match self {
            PurchaseError::PurchaseFailed(_) => {
                "Could not complete the order, please try again".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl From<StoreError> for PurchaseError {
    fn from(e: StoreError) -> Self {
        PurchaseError::PurchaseFailed(e.to_string())
    }
}

impl From<LedgerError> for PurchaseError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(id) => PurchaseError::AccountNotFound(id),
            LedgerError::InsufficientFunds { required, available } => {
                PurchaseError::InsufficientFunds { required, available }
            }
            LedgerError::InvalidAmount(msg) => PurchaseError::InvalidAmount(msg),
            other => PurchaseError::PurchaseFailed(other.to_string()),
        }
    }
}

impl IntoResponse for PurchaseError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "errorMessage": self.user_message(),
        }));
        (self.kind().status_code(), body).into_response()
    }
}

pub type PurchaseResult<T> = Result<T, PurchaseError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Unknown payment method: {0}")]
    UnknownMethod(String),

    #[error("Payment method {0} is temporarily unavailable")]
    MethodUnavailable(PaymentMethod),

    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("Payment provider error: {message}")]
    ProviderError {
        message: String,
        code: Option<String>,
        /// Whether `message` may be shown to the end user as is.
        user_safe: bool,
    },

    #[error("Payment transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Payment cannot move from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Provider {0} does not support refunds")]
    RefundNotSupported(String),

    #[error("A refund of {0} is already in progress")]
    RefundInProgress(String),

    #[error("Insufficient funds. Required: {required}, Available: {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// Unexpected failure mid-transaction. Everything was rolled back.
    #[error("Payment processing failed: {0}")]
    PaymentFailed(String),
}

impl PaymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::InvalidAmount(_)
            | PaymentError::UnknownMethod(_) => ErrorKind::Validation,
            PaymentError::AccountNotFound(_)
            | PaymentError::UnknownProvider(_)
            | PaymentError::TransactionNotFound(_) => ErrorKind::NotFound,
            PaymentError::MethodUnavailable(_)
            | PaymentError::InvalidTransition { .. }
            | PaymentError::RefundNotSupported(_)
            | PaymentError::RefundInProgress(_)
            | PaymentError::InsufficientFunds { .. } => ErrorKind::Conflict,
            PaymentError::ProviderError { .. } => ErrorKind::Provider,
            PaymentError::PaymentFailed(_) => ErrorKind::Integrity,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ProviderError {
                message, user_safe, ..
            } => {
                if *user_safe {
                    message.clone()
                } else {
                    "The payment provider could not process the request".to_string()
                }
            }
            PaymentError::PaymentFailed(_) => {
                "Could not complete the payment operation".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl From<StoreError> for PaymentError {
    fn from(e: StoreError) -> Self {
        PaymentError::PaymentFailed(e.to_string())
    }
}

impl From<LedgerError> for PaymentError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(id) => PaymentError::AccountNotFound(id),
            LedgerError::InsufficientFunds { required, available } => {
                PaymentError::InsufficientFunds { required, available }
            }
            LedgerError::InvalidAmount(msg) => PaymentError::InvalidAmount(msg),
            LedgerError::Store(e) => PaymentError::PaymentFailed(e.to_string()),
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        match self {
            PaymentError::ProviderError {
                ref message,
                ref code,
                user_safe: false,
            } => {
                tracing::warn!(message = %message, code = ?code, "Provider error hidden from client");
            }
            PaymentError::PaymentFailed(ref e) => {
                tracing::error!(error = %e, "Payment operation failed");
            }
            _ => {}
        }
        error_body(self.kind().status_code(), self.user_message())
    }
}

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Failures of reads and admin seeding endpoints
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        match self {
            QueryError::InvalidInput(_) => error_body(StatusCode::BAD_REQUEST, self.to_string()),
            QueryError::NotFound(_) => error_body(StatusCode::NOT_FOUND, self.to_string()),
            QueryError::Store(e) => e.into_response(),
        }
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Kafka error: {0}")]
    KafkaError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}
