//! Payment provider abstraction and the payment orchestrator

mod factory;
mod service;
mod test_provider;

pub use factory::{ProviderFactory, ResolvedProvider, DEFAULT_PRIORITY};
pub use service::{DepositReceipt, DepositSettings, PaymentRefund, PaymentService, StatusChange};
pub use test_provider::{sign_webhook_body, TestProvider, TestProviderSettings, SIGNATURE_HEADER};

use crate::errors::PaymentError;
use crate::models::{PaymentMethod, PaymentStatus};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Request headers with lowercase names.
pub type WebhookHeaders = HashMap<String, String>;

/// Provider-agnostic payment request
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub account_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub order_id: Option<Uuid>,
    pub description: String,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
    pub client_ip: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A payment the provider accepted
#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub transaction_id: String,
    pub provider_transaction_id: Option<String>,
    pub redirect_url: Option<String>,
    pub status: PaymentStatus,
    pub provider_data: Option<serde_json::Value>,
}

/// A provider rejected or failed a call
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub message: String,
    pub code: Option<String>,
    /// Whether `message` may be shown to the end user verbatim.
    pub user_safe: bool,
}

impl ProviderFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            user_safe: false,
        }
    }

    /// A message meant for the payer, e.g. a limit violation.
    pub fn user_facing(message: impl Into<String>) -> Self {
        Self {
            user_safe: true,
            ..Self::new(message)
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<ProviderFailure> for PaymentError {
    fn from(failure: ProviderFailure) -> Self {
        PaymentError::ProviderError {
            message: failure.message,
            code: failure.code,
            user_safe: failure.user_safe,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentStatusResult {
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub amount: Option<Decimal>,
    pub message: Option<String>,
}

impl PaymentStatusResult {
    pub fn is_finalized(&self) -> bool {
        self.status.is_finalized()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookValidationResult {
    pub is_valid: bool,
    pub transaction_id: Option<String>,
    pub status: Option<PaymentStatus>,
    pub amount: Option<Decimal>,
    pub error: Option<String>,
}

impl WebhookValidationResult {
    pub fn valid(transaction_id: String, status: PaymentStatus, amount: Option<Decimal>) -> Self {
        Self {
            is_valid: true,
            transaction_id: Some(transaction_id),
            status: Some(status),
            amount,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            transaction_id: None,
            status: None,
            amount: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub amount: Option<Decimal>,
}

/// Money-in integration
///
/// Implementations own their wire protocol; callers only see this contract.
/// Calls may be cancelled by dropping the returned future.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Stable name used in URLs and stored on transactions.
    fn name(&self) -> &str;
    fn display_name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn supported_methods(&self) -> &[PaymentMethod];
    fn supports_refund(&self) -> bool;

    fn supports_method(&self, method: PaymentMethod) -> bool {
        self.supported_methods().contains(&method)
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment, ProviderFailure>;

    async fn payment_status(&self, transaction_id: &str) -> Result<PaymentStatusResult, ProviderFailure>;

    /// Checks authenticity and decodes the callback. Never mutates local state.
    async fn validate_webhook(&self, headers: &WebhookHeaders, body: &[u8]) -> WebhookValidationResult;

    /// `None` refunds the full amount.
    async fn refund(&self, transaction_id: &str, amount: Option<Decimal>) -> Result<RefundReceipt, ProviderFailure>;
}
