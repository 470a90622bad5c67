use crate::errors::{
    LedgerResult, PaymentError, PaymentResult, PurchaseResult, QueryError, QueryResult, StoreError,
};
use crate::events::EventPublisher;
use crate::ledger::Ledger;
use crate::models::*;
use crate::payments::{DepositSettings, PaymentService, PaymentStatusResult, ProviderFactory, WebhookHeaders};
use crate::purchase::{CheckoutLine, PurchaseReceipt, PurchaseService};
use crate::repository::Store;
use crate::webhooks::WebhookReconciler;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const DEFAULT_ORDER_PAGE_SIZE: u32 = 10;
const DEFAULT_LEDGER_PAGE_SIZE: u32 = 20;

/// Services shared across handlers
#[derive(Clone)]
pub struct AppState<S: Store> {
    pub store: S,
    pub ledger: Ledger<S>,
    pub purchases: PurchaseService<S>,
    pub payments: PaymentService<S>,
    pub webhooks: WebhookReconciler<S>,
}

impl<S: Store> AppState<S> {
    pub fn new(
        store: S,
        factory: ProviderFactory,
        events: Arc<dyn EventPublisher>,
        deposits: DepositSettings,
    ) -> Self {
        let payments = PaymentService::new(store.clone(), factory.clone(), events.clone(), deposits);
        Self {
            ledger: Ledger::new(store.clone(), events.clone()),
            purchases: PurchaseService::new(store.clone(), events),
            webhooks: WebhookReconciler::new(store.clone(), factory, payments.clone()),
            payments,
            store,
        }
    }
}

pub fn router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Account and catalog seeding
        .route("/accounts", post(create_account::<S>))
        .route("/accounts/:account_id", get(get_account::<S>))
        .route("/catalog", post(create_catalog_item::<S>))
        .route("/catalog/:item_id/restock", post(restock::<S>))
        // Buying
        .route("/accounts/:account_id/purchases", post(purchase::<S>))
        .route("/accounts/:account_id/checkout", post(checkout::<S>))
        .route("/accounts/:account_id/orders", get(list_orders::<S>))
        .route("/accounts/:account_id/orders/:order_number", get(get_order::<S>))
        .route("/accounts/:account_id/ledger", get(list_ledger::<S>))
        // Money in
        .route("/accounts/:account_id/deposits", post(create_deposit::<S>))
        .route("/payments/:transaction_id", get(get_payment::<S>))
        .route("/payments/:transaction_id/refresh", post(refresh_payment::<S>))
        .route("/payments/:transaction_id/refund", post(refund_payment::<S>))
        .route("/api/webhooks/:provider_name", post(webhook::<S>))
        // Back office
        .route("/admin/providers", post(upsert_provider_config::<S>))
        .route("/admin/payments/:transaction_id/status", post(set_payment_status::<S>))
        .route("/admin/orders/:order_number/refund", post(refund_order::<S>))
        .route("/admin/accounts/:account_id/adjust", post(adjust_balance::<S>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn create_account<S: Store>(
    State(state): State<AppState<S>>,
    Json(payload): Json<CreateAccountRequest>,
) -> QueryResult<Json<ApiResponse<AccountResponse>>> {
    let account = state.store.create_account(payload.email.as_deref()).await?;
    tracing::info!(account_id = %account.id, "Account created");
    Ok(Json(ApiResponse::success(AccountResponse::from(account))))
}

async fn get_account<S: Store>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<Uuid>,
) -> QueryResult<Json<ApiResponse<AccountResponse>>> {
    let account = state
        .store
        .find_account(account_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("account {}", account_id)))?;
    Ok(Json(ApiResponse::success(AccountResponse::from(account))))
}

async fn create_catalog_item<S: Store>(
    State(state): State<AppState<S>>,
    Json(payload): Json<CreateCatalogItemRequest>,
) -> QueryResult<Json<ApiResponse<CatalogItem>>> {
    if payload.name.trim().is_empty() {
        return Err(QueryError::InvalidInput("name must not be empty".to_string()));
    }
    if payload.price < Decimal::ZERO || payload.stock < 0 {
        return Err(QueryError::InvalidInput(
            "price and stock must not be negative".to_string(),
        ));
    }
    if payload.price > MAX_MONEY {
        return Err(QueryError::InvalidInput(format!(
            "price must not exceed {}",
            MAX_MONEY
        )));
    }

    let item = state
        .store
        .create_catalog_item(NewCatalogItem {
            name: payload.name,
            price: payload.price,
            stock: payload.stock,
            is_active: payload.is_active,
        })
        .await?;
    tracing::info!(item_id = %item.id, price = %item.price, stock = item.stock, "Catalog item created");
    Ok(Json(ApiResponse::success(item)))
}

async fn restock<S: Store>(
    State(state): State<AppState<S>>,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<RestockRequest>,
) -> QueryResult<Json<ApiResponse<CatalogItem>>> {
    if payload.quantity <= 0 {
        return Err(QueryError::InvalidInput("quantity must be positive".to_string()));
    }
    let item = state
        .store
        .restock(item_id, payload.quantity)
        .await
        .map_err(|e| match e {
            StoreError::OutOfRange(what) => QueryError::InvalidInput(format!("{} would overflow", what)),
            e => QueryError::Store(e),
        })?
        .ok_or_else(|| QueryError::NotFound(format!("catalog item {}", item_id)))?;
    tracing::info!(item_id = %item_id, stock = item.stock, "Catalog item restocked");
    Ok(Json(ApiResponse::success(item)))
}

fn purchase_response(receipt: PurchaseReceipt) -> PurchaseResponse {
    PurchaseResponse {
        success: true,
        order_number: Some(receipt.order_number),
        fulfillment_key: receipt.keys.first().cloned(),
        fulfillment_keys: receipt.keys,
        new_balance: Some(receipt.new_balance),
        error_message: None,
    }
}

async fn purchase<S: Store>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<Uuid>,
    Json(payload): Json<PurchaseRequest>,
) -> PurchaseResult<Json<PurchaseResponse>> {
    let receipt = state
        .purchases
        .purchase(
            account_id,
            payload.catalog_item_id,
            payload.quantity,
            payload.delivery_info,
        )
        .await?;
    Ok(Json(purchase_response(receipt)))
}

async fn checkout<S: Store>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<Uuid>,
    Json(payload): Json<CheckoutRequest>,
) -> PurchaseResult<Json<PurchaseResponse>> {
    let lines: Vec<CheckoutLine> = payload.lines.into_iter().map(CheckoutLine::from).collect();
    let receipt = state
        .purchases
        .checkout(account_id, &lines, payload.delivery_info)
        .await?;
    Ok(Json(purchase_response(receipt)))
}

async fn list_orders<S: Store>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> QueryResult<Json<ApiResponse<Paged<OrderSummary>>>> {
    let page = query.to_page(DEFAULT_ORDER_PAGE_SIZE);
    let orders = state.purchases.orders_for_account(account_id, page).await?;
    Ok(Json(ApiResponse::success(orders)))
}

async fn get_order<S: Store>(
    State(state): State<AppState<S>>,
    Path((account_id, order_number)): Path<(Uuid, String)>,
) -> QueryResult<Json<ApiResponse<OrderView>>> {
    let order = state.purchases.order_details(account_id, &order_number).await?;
    Ok(Json(ApiResponse::success(order)))
}

async fn list_ledger<S: Store>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> LedgerResult<Json<ApiResponse<Paged<LedgerEntryResponse>>>> {
    let page = query.to_page(DEFAULT_LEDGER_PAGE_SIZE);
    let entries = state.ledger.entries(account_id, page).await?;
    Ok(Json(ApiResponse::success(entries.map(LedgerEntryResponse::from))))
}

/// First address of `X-Forwarded-For`, if any.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

async fn create_deposit<S: Store>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<DepositRequest>,
) -> PaymentResult<Json<DepositResponse>> {
    let method: PaymentMethod = payload
        .method
        .parse()
        .map_err(|_| PaymentError::UnknownMethod(payload.method.clone()))?;

    let receipt = state
        .payments
        .create_deposit(account_id, payload.amount, method, client_ip(&headers))
        .await?;

    Ok(Json(DepositResponse {
        success: true,
        transaction_id: Some(receipt.transaction_id),
        redirect_url: receipt.redirect_url,
        status: Some(receipt.status),
        error_message: None,
    }))
}

#[derive(Debug, Serialize)]
struct PaymentStatusResponse {
    transaction_id: String,
    status: PaymentStatus,
    is_finalized: bool,
    amount: Option<Decimal>,
}

impl From<PaymentStatusResult> for PaymentStatusResponse {
    fn from(result: PaymentStatusResult) -> Self {
        Self {
            is_finalized: result.is_finalized(),
            transaction_id: result.transaction_id,
            status: result.status,
            amount: result.amount,
        }
    }
}

async fn get_payment<S: Store>(
    State(state): State<AppState<S>>,
    Path(transaction_id): Path<String>,
) -> PaymentResult<Json<ApiResponse<PaymentTransactionResponse>>> {
    let payment = state.payments.find_payment(&transaction_id).await?;
    Ok(Json(ApiResponse::success(PaymentTransactionResponse::from(payment))))
}

async fn refresh_payment<S: Store>(
    State(state): State<AppState<S>>,
    Path(transaction_id): Path<String>,
) -> PaymentResult<Json<ApiResponse<PaymentStatusResponse>>> {
    let status = state.payments.refresh_payment_status(&transaction_id).await?;
    Ok(Json(ApiResponse::success(PaymentStatusResponse::from(status))))
}

#[derive(Debug, Serialize)]
struct PaymentRefundResponse {
    transaction_id: String,
    refund_id: String,
    amount: Decimal,
    new_balance: Decimal,
}

async fn refund_payment<S: Store>(
    State(state): State<AppState<S>>,
    Path(transaction_id): Path<String>,
    Json(payload): Json<RefundPaymentRequest>,
) -> PaymentResult<Json<ApiResponse<PaymentRefundResponse>>> {
    let refund = state
        .payments
        .refund_payment(&transaction_id, payload.amount)
        .await?;
    Ok(Json(ApiResponse::success(PaymentRefundResponse {
        transaction_id: refund.payment.transaction_id,
        refund_id: refund.refund_id,
        amount: refund.amount,
        new_balance: refund.new_balance,
    })))
}

async fn set_payment_status<S: Store>(
    State(state): State<AppState<S>>,
    Path(transaction_id): Path<String>,
    Json(payload): Json<SetPaymentStatusRequest>,
) -> PaymentResult<Json<ApiResponse<PaymentTransactionResponse>>> {
    let change = state
        .payments
        .admin_set_payment_status(&transaction_id, payload.status)
        .await?;
    Ok(Json(ApiResponse::success(PaymentTransactionResponse::from(change.payment))))
}

/// Raw body and headers go to the reconciler untouched.
async fn webhook<S: Store>(
    State(state): State<AppState<S>>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let headers: WebhookHeaders = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let accepted = state.webhooks.handle(&provider_name, &headers, &body).await;
    let status = if accepted {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(json!({ "accepted": accepted })))
}

async fn upsert_provider_config<S: Store>(
    State(state): State<AppState<S>>,
    Json(payload): Json<NewProviderConfig>,
) -> QueryResult<Json<ApiResponse<ProviderConfig>>> {
    if payload.name.trim().is_empty() {
        return Err(QueryError::InvalidInput("name must not be empty".to_string()));
    }
    if let (Some(min), Some(max)) = (payload.min_amount, payload.max_amount) {
        if min > max {
            return Err(QueryError::InvalidInput(
                "min_amount must not exceed max_amount".to_string(),
            ));
        }
    }
    let config = state.store.upsert_provider_config(payload).await?;
    tracing::info!(
        provider = %config.name,
        enabled = config.is_enabled,
        priority = config.priority,
        "Provider configuration saved"
    );
    Ok(Json(ApiResponse::success(config)))
}

#[derive(Debug, Serialize)]
struct OrderRefundResponse {
    order: OrderSummary,
    new_balance: Decimal,
}

async fn refund_order<S: Store>(
    State(state): State<AppState<S>>,
    Path(order_number): Path<String>,
) -> PurchaseResult<Json<ApiResponse<OrderRefundResponse>>> {
    let refund = state.purchases.refund_order(&order_number).await?;
    Ok(Json(ApiResponse::success(OrderRefundResponse {
        order: OrderSummary::from(refund.order),
        new_balance: refund.new_balance,
    })))
}

async fn adjust_balance<S: Store>(
    State(state): State<AppState<S>>,
    Path(account_id): Path<Uuid>,
    Json(payload): Json<AdjustBalanceRequest>,
) -> LedgerResult<Json<ApiResponse<LedgerEntryResponse>>> {
    let entry = state
        .ledger
        .adjust_balance(account_id, payload.amount, &payload.reason)
        .await?;
    Ok(Json(ApiResponse::success(LedgerEntryResponse::from(entry))))
}
