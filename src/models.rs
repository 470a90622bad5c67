use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// Largest amount a `NUMERIC(19, 4)` money column holds:
/// 999 999 999 999 999.9999.
///
/// Prices, order totals, postings and balances are all kept at or below it,
/// so Decimal arithmetic on them cannot overflow and every value round-trips
/// through Postgres unchanged.
pub const MAX_MONEY: Decimal = Decimal::from_parts(0x89E7_FFFF, 0x8AC7_2304, 0, false, 4);

/// Account entity - a user's balance-holding identity
///
/// `balance` is denormalized: it must always equal the sum of the account's
/// ledger entries, and only the ledger module writes it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub email: Option<String>,
    pub balance: Decimal,
    pub is_active: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger entry - immutable record of one balance mutation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Signed: credits are positive, debits negative.
    pub amount: Decimal,
    pub kind: LedgerKind,
    pub order_id: Option<Uuid>,
    pub payment_transaction_id: Option<Uuid>,
    pub description: String,
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    Deposit,
    Purchase,
    Refund,
    Bonus,
    Withdrawal,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Deposit => "DEPOSIT",
            LedgerKind::Purchase => "PURCHASE",
            LedgerKind::Refund => "REFUND",
            LedgerKind::Bonus => "BONUS",
            LedgerKind::Withdrawal => "WITHDRAWAL",
        }
    }
}

impl std::fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog item - a purchasable SKU. `stock` never drops below zero.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub stock: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub account_id: Uuid,
    pub order_number: String,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    /// Free text supplied by the buyer, e.g. a game UID.
    pub delivery_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One purchased line. `unit_price` is a snapshot taken at purchase time.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub catalog_item_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Redemption token delivered to the buyer.
///
/// A used key always links to an order item; an unused key never does.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FulfillmentKey {
    pub id: Uuid,
    pub catalog_item_id: Uuid,
    pub key_value: String,
    pub is_used: bool,
    pub order_item_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Record of an external money-in attempt via a provider
///
/// `order_id == None` means a balance deposit.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub transaction_id: String,
    pub provider_transaction_id: Option<String>,
    pub account_id: Uuid,
    pub order_id: Option<Uuid>,
    pub provider_name: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub description: Option<String>,
    pub error_message: Option<String>,
    pub client_ip: Option<String>,
    pub provider_data: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Expired => "EXPIRED",
        }
    }

    /// True once the payment can no longer move, except Completed -> Refunded.
    pub fn is_finalized(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Failed
                | PaymentStatus::Cancelled
                | PaymentStatus::Refunded
                | PaymentStatus::Expired
        )
    }

    /// Allowed edges of the payment state machine.
    ///
    /// Pending may skip Processing: most providers report the outcome directly.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Pending | Processing, Completed | Failed | Cancelled | Expired) => true,
            (Completed, Refunded) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PROCESSING" => Ok(PaymentStatus::Processing),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            "EXPIRED" => Ok(PaymentStatus::Expired),
            other => Err(format!("Unknown payment status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Card,
    Sbp,
    SberPay,
    YooMoney,
    Qiwi,
    WebMoney,
    Crypto,
    PayPal,
    Balance,
    Mobile,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "CARD",
            PaymentMethod::Sbp => "SBP",
            PaymentMethod::SberPay => "SBER_PAY",
            PaymentMethod::YooMoney => "YOO_MONEY",
            PaymentMethod::Qiwi => "QIWI",
            PaymentMethod::WebMoney => "WEB_MONEY",
            PaymentMethod::Crypto => "CRYPTO",
            PaymentMethod::PayPal => "PAY_PAL",
            PaymentMethod::Balance => "BALANCE",
            PaymentMethod::Mobile => "MOBILE",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both the canonical names and the short lowercase forms checkout
/// forms submit ("card", "sbp", "yoomoney").
impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "card" => Ok(PaymentMethod::Card),
            "sbp" => Ok(PaymentMethod::Sbp),
            "sberpay" => Ok(PaymentMethod::SberPay),
            "yoomoney" => Ok(PaymentMethod::YooMoney),
            "qiwi" => Ok(PaymentMethod::Qiwi),
            "webmoney" => Ok(PaymentMethod::WebMoney),
            "crypto" => Ok(PaymentMethod::Crypto),
            "paypal" => Ok(PaymentMethod::PayPal),
            "balance" => Ok(PaymentMethod::Balance),
            "mobile" => Ok(PaymentMethod::Mobile),
            _ => Err(format!("Unknown payment method: {}", s)),
        }
    }
}

/// Admin-managed provider settings, re-read on every provider resolution
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub is_enabled: bool,
    /// Lower is preferred.
    pub priority: i32,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub merchant_id: Option<String>,
    pub is_test_mode: bool,
    pub settings: Option<serde_json::Value>,
    pub commission: Option<Decimal>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// === Insert models ===

#[derive(Debug, Clone)]
pub struct NewCatalogItem {
    pub name: String,
    pub price: Decimal,
    pub stock: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub account_id: Uuid,
    pub amount: Decimal,
    pub kind: LedgerKind,
    pub order_id: Option<Uuid>,
    pub payment_transaction_id: Option<Uuid>,
    pub description: String,
    pub balance_after: Decimal,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account_id: Uuid,
    pub order_number: String,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub delivery_info: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub order_id: Uuid,
    pub catalog_item_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone)]
pub struct NewFulfillmentKey {
    pub catalog_item_id: Uuid,
    pub key_value: String,
    pub order_item_id: Uuid,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentTransaction {
    pub transaction_id: String,
    pub provider_transaction_id: Option<String>,
    pub account_id: Uuid,
    pub order_id: Option<Uuid>,
    pub provider_name: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub description: Option<String>,
    pub client_ip: Option<String>,
    pub provider_data: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProviderConfig {
    pub name: String,
    pub display_name: String,
    pub is_enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub is_test_mode: bool,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
    #[serde(default)]
    pub commission: Option<Decimal>,
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
}

/// 1-based page request. Out-of-range values are clamped by [`Page::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    pub const MAX_SIZE: u32 = 100;

    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number: number.max(1),
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn first(size: u32) -> Self {
        Self::new(1, size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.number - 1) * i64::from(self.size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size)
    }

    pub fn total_pages(&self, total_items: i64) -> i64 {
        let size = i64::from(self.size);
        (total_items + size - 1) / size
    }
}

// === API Request/Response Models ===

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCatalogItemRequest {
    pub name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub stock: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RestockRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub catalog_item_id: Uuid,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub delivery_info: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutLineRequest {
    pub catalog_item_id: Uuid,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub lines: Vec<CheckoutLineRequest>,
    pub delivery_info: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub method: String,
}

#[derive(Debug, Deserialize)]
pub struct RefundPaymentRequest {
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct SetPaymentStatusRequest {
    pub status: PaymentStatus,
}

#[derive(Debug, Deserialize)]
pub struct AdjustBalanceRequest {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    pub fn to_page(&self, default_size: u32) -> Page {
        Page::new(self.page.unwrap_or(1), self.page_size.unwrap_or(default_size))
    }
}

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }
}

/// Checkout result consumed by the storefront UI
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    pub success: bool,
    pub order_number: Option<String>,
    pub fulfillment_key: Option<String>,
    pub fulfillment_keys: Vec<String>,
    pub new_balance: Option<Decimal>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositResponse {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub redirect_url: Option<String>,
    pub status: Option<PaymentStatus>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub email: Option<String>,
    pub balance: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            email: account.email,
            balance: account.balance,
            is_active: account.is_active,
            created_at: account.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerEntryResponse {
    pub id: Uuid,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub kind: LedgerKind,
    pub description: String,
    pub order_id: Option<Uuid>,
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for LedgerEntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id,
            amount: entry.amount,
            kind: entry.kind,
            description: entry.description,
            order_id: entry.order_id,
            balance_after: entry.balance_after,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total_items: i64,
    pub total_pages: i64,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, page: Page, total_items: i64) -> Self {
        Self {
            items,
            page: page.number,
            page_size: page.size,
            total_items,
            total_pages: page.total_pages(total_items),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paged<U> {
        Paged {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            page_size: self.page_size,
            total_items: self.total_items,
            total_pages: self.total_pages,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderLineView {
    pub catalog_item_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub keys: Vec<String>,
}

/// One order with its lines and issued keys
#[derive(Debug, Serialize)]
pub struct OrderView {
    pub id: Uuid,
    pub order_number: String,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub delivery_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderLineView>,
}

#[derive(Debug, Serialize)]
pub struct OrderSummary {
    pub id: Uuid,
    pub order_number: String,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Order> for OrderSummary {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            total_amount: order.total_amount,
            status: order.status,
            created_at: order.created_at,
            completed_at: order.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentTransactionResponse {
    pub transaction_id: String,
    pub provider_transaction_id: Option<String>,
    pub provider_name: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<PaymentTransaction> for PaymentTransactionResponse {
    fn from(payment: PaymentTransaction) -> Self {
        Self {
            transaction_id: payment.transaction_id,
            provider_transaction_id: payment.provider_transaction_id,
            provider_name: payment.provider_name,
            method: payment.method,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            error_message: payment.error_message,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
            completed_at: payment.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_statuses() {
        assert!(!PaymentStatus::Pending.is_finalized());
        assert!(!PaymentStatus::Processing.is_finalized());
        for status in [
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
            PaymentStatus::Refunded,
            PaymentStatus::Expired,
        ] {
            assert!(status.is_finalized(), "{} should be final", status);
        }
    }

    #[test]
    fn terminal_statuses_only_allow_refund_edge() {
        use PaymentStatus::*;
        assert!(Completed.can_transition_to(Refunded));
        for from in [Failed, Cancelled, Expired, Refunded] {
            for to in [Pending, Processing, Completed, Failed, Cancelled, Refunded, Expired] {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Refunded));
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Expired));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn payment_method_parses_checkout_form_values() {
        assert_eq!("card".parse::<PaymentMethod>(), Ok(PaymentMethod::Card));
        assert_eq!("SBP".parse::<PaymentMethod>(), Ok(PaymentMethod::Sbp));
        assert_eq!("yoomoney".parse::<PaymentMethod>(), Ok(PaymentMethod::YooMoney));
        assert_eq!("YOO_MONEY".parse::<PaymentMethod>(), Ok(PaymentMethod::YooMoney));
        assert!("cheque".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn page_clamps_and_counts() {
        let page = Page::new(0, 500);
        assert_eq!(page.number, 1);
        assert_eq!(page.size, Page::MAX_SIZE);

        let page = Page::new(3, 10);
        assert_eq!(page.offset(), 20);
        assert_eq!(page.total_pages(21), 3);
        assert_eq!(page.total_pages(0), 0);
    }
}
