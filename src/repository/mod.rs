//! Storage layer
//!
//! All SQL (and the in-memory arena used by tests and local runs) lives behind
//! two traits:
//! - [`Store`] for single-statement reads and admin-side writes that belong to
//!   collaborators (accounts, catalog, provider configs).
//! - [`UnitOfWork`] for every multi-row mutation. A unit of work is begun once,
//!   passed explicitly through the orchestrators and either committed exactly
//!   once or dropped, which rolls everything back.
//!
//! The `lock_*` methods re-read a row and hold it for the rest of the unit of
//! work, so balance, stock and payment status checks always see current state.

mod memory;
mod postgres;

pub use memory::{FailPoint, MemoryStore, MemoryUnitOfWork};
pub use postgres::{PgStore, PgUnitOfWork};

use crate::errors::StoreResult;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Narrow read interface over admin-managed provider configuration.
#[async_trait]
pub trait ProviderConfigSource: Send + Sync {
    async fn provider_configs(&self) -> StoreResult<Vec<ProviderConfig>>;
}

#[async_trait]
pub trait Store: ProviderConfigSource + Clone + Send + Sync + 'static {
    type Tx: UnitOfWork;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    // Account/identity collaborator
    async fn create_account(&self, email: Option<&str>) -> StoreResult<Account>;
    async fn find_account(&self, account_id: Uuid) -> StoreResult<Option<Account>>;
    async fn set_account_active(&self, account_id: Uuid, active: bool) -> StoreResult<Option<Account>>;

    // Catalog collaborator
    async fn create_catalog_item(&self, item: NewCatalogItem) -> StoreResult<CatalogItem>;
    async fn find_catalog_item(&self, item_id: Uuid) -> StoreResult<Option<CatalogItem>>;
    async fn restock(&self, item_id: Uuid, quantity: i32) -> StoreResult<Option<CatalogItem>>;

    // Provider configuration collaborator
    async fn upsert_provider_config(&self, config: NewProviderConfig) -> StoreResult<ProviderConfig>;

    // Ledger reads, newest first
    async fn ledger_entries(&self, account_id: Uuid, page: Page) -> StoreResult<Vec<LedgerEntry>>;
    async fn count_ledger_entries(&self, account_id: Uuid) -> StoreResult<i64>;
    async fn ledger_total(&self, account_id: Uuid) -> StoreResult<Decimal>;

    // Order reads, newest first
    async fn orders_for_account(&self, account_id: Uuid, page: Page) -> StoreResult<Vec<Order>>;
    async fn count_orders(&self, account_id: Uuid) -> StoreResult<i64>;
    async fn find_order_by_number(&self, order_number: &str) -> StoreResult<Option<Order>>;
    async fn order_items(&self, order_id: Uuid) -> StoreResult<Vec<OrderItem>>;
    async fn keys_for_order(&self, order_id: Uuid) -> StoreResult<Vec<FulfillmentKey>>;

    /// Looks a payment up by internal or provider-side transaction id.
    async fn find_payment(&self, transaction_id: &str) -> StoreResult<Option<PaymentTransaction>>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    async fn lock_account(&mut self, account_id: Uuid) -> StoreResult<Option<Account>>;
    async fn update_balance(&mut self, account_id: Uuid, balance: Decimal) -> StoreResult<()>;
    async fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry>;
    async fn ledger_entry_exists(&mut self, payment_id: Uuid, kind: LedgerKind) -> StoreResult<bool>;

    async fn lock_catalog_item(&mut self, item_id: Uuid) -> StoreResult<Option<CatalogItem>>;
    async fn update_stock(&mut self, item_id: Uuid, stock: i32) -> StoreResult<()>;

    async fn insert_order(&mut self, order: NewOrder) -> StoreResult<Order>;
    async fn lock_order_by_number(&mut self, order_number: &str) -> StoreResult<Option<Order>>;
    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Order>;
    async fn insert_order_item(&mut self, item: NewOrderItem) -> StoreResult<OrderItem>;
    async fn insert_fulfillment_key(&mut self, key: NewFulfillmentKey) -> StoreResult<FulfillmentKey>;

    async fn insert_payment(&mut self, payment: NewPaymentTransaction) -> StoreResult<PaymentTransaction>;
    /// Locks a payment found by internal or provider-side transaction id.
    async fn lock_payment(&mut self, transaction_id: &str) -> StoreResult<Option<PaymentTransaction>>;
    /// Persists status, provider id, error message and timestamps.
    async fn save_payment(&mut self, payment: &PaymentTransaction) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;
}
