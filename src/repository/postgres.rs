use super::{ProviderConfigSource, Store, UnitOfWork};
use crate::errors::{StoreError, StoreResult};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const ACCOUNT_COLUMNS: &str = "id, email, balance, is_active, version, created_at, updated_at";
const CATALOG_COLUMNS: &str = "id, name, price, stock, is_active, created_at, updated_at";
const ORDER_COLUMNS: &str =
    "id, account_id, order_number, total_amount, status, delivery_info, created_at, completed_at";
const ORDER_ITEM_COLUMNS: &str = "id, order_id, catalog_item_id, quantity, unit_price, line_total";
const KEY_COLUMNS: &str =
    "id, catalog_item_id, key_value, is_used, order_item_id, created_at, used_at";
const LEDGER_COLUMNS: &str = "id, account_id, amount, kind, order_id, payment_transaction_id, \
     description, balance_after, created_at";
const PAYMENT_COLUMNS: &str = "id, transaction_id, provider_transaction_id, account_id, order_id, \
     provider_name, method, amount, currency, status, description, error_message, client_ip, \
     provider_data, metadata, created_at, updated_at, completed_at";
const PROVIDER_CONFIG_COLUMNS: &str = "id, name, display_name, is_enabled, priority, api_key, \
     secret_key, merchant_id, is_test_mode, settings, commission, min_amount, max_amount, \
     created_at, updated_at";

/// PostgreSQL-backed store
///
/// Row locks (`SELECT ... FOR UPDATE`) serialize concurrent writers on the
/// same account, catalog item or payment. Lock order everywhere is
/// payment/order/catalog item first, account last.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// SQLSTATE 22003 (numeric_value_out_of_range) becomes `OutOfRange`.
fn map_range_error(e: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some("22003") {
            return StoreError::OutOfRange(what.to_string());
        }
    }
    StoreError::DatabaseError(e)
}

/// Maps unique-index violations so callers can tell them from other failures.
fn map_insert_error(e: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation(format!("{}: {}", what, db.message()));
        }
    }
    StoreError::DatabaseError(e)
}

#[async_trait]
impl ProviderConfigSource for PgStore {
    async fn provider_configs(&self) -> StoreResult<Vec<ProviderConfig>> {
        let configs = sqlx::query_as::<_, ProviderConfig>(&format!(
            "SELECT {} FROM payment_provider_configs ORDER BY priority, name",
            PROVIDER_CONFIG_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(configs)
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> StoreResult<PgUnitOfWork> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork { tx })
    }

    async fn create_account(&self, email: Option<&str>) -> StoreResult<Account> {
        let now = Utc::now();
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (id, email, balance, is_active, version, created_at, updated_at)
            VALUES ($1, $2, 0, TRUE, 0, $3, $3)
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_account(&self, account_id: Uuid) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn set_account_active(&self, account_id: Uuid, active: bool) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts
            SET is_active = $1, version = version + 1, updated_at = $2
            WHERE id = $3
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(active)
        .bind(Utc::now())
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn create_catalog_item(&self, item: NewCatalogItem) -> StoreResult<CatalogItem> {
        let now = Utc::now();
        let created = sqlx::query_as::<_, CatalogItem>(&format!(
            r#"
            INSERT INTO catalog_items (id, name, price, stock, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {}
            "#,
            CATALOG_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&item.name)
        .bind(item.price)
        .bind(item.stock)
        .bind(item.is_active)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn find_catalog_item(&self, item_id: Uuid) -> StoreResult<Option<CatalogItem>> {
        let item = sqlx::query_as::<_, CatalogItem>(&format!(
            "SELECT {} FROM catalog_items WHERE id = $1",
            CATALOG_COLUMNS
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn restock(&self, item_id: Uuid, quantity: i32) -> StoreResult<Option<CatalogItem>> {
        // Single statement: the row lock is taken and released by the UPDATE itself.
        let item = sqlx::query_as::<_, CatalogItem>(&format!(
            r#"
            UPDATE catalog_items
            SET stock = stock + $1, updated_at = $2
            WHERE id = $3
            RETURNING {}
            "#,
            CATALOG_COLUMNS
        ))
        .bind(quantity)
        .bind(Utc::now())
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_range_error(e, &format!("stock of catalog item {}", item_id)))?;

        Ok(item)
    }

    async fn upsert_provider_config(&self, config: NewProviderConfig) -> StoreResult<ProviderConfig> {
        let now = Utc::now();
        let saved = sqlx::query_as::<_, ProviderConfig>(&format!(
            r#"
            INSERT INTO payment_provider_configs
                (id, name, display_name, is_enabled, priority, api_key, secret_key, merchant_id,
                 is_test_mode, settings, commission, min_amount, max_amount, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            ON CONFLICT (name) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                is_enabled = EXCLUDED.is_enabled,
                priority = EXCLUDED.priority,
                api_key = EXCLUDED.api_key,
                secret_key = EXCLUDED.secret_key,
                merchant_id = EXCLUDED.merchant_id,
                is_test_mode = EXCLUDED.is_test_mode,
                settings = EXCLUDED.settings,
                commission = EXCLUDED.commission,
                min_amount = EXCLUDED.min_amount,
                max_amount = EXCLUDED.max_amount,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            PROVIDER_CONFIG_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&config.name)
        .bind(&config.display_name)
        .bind(config.is_enabled)
        .bind(config.priority)
        .bind(&config.api_key)
        .bind(&config.secret_key)
        .bind(&config.merchant_id)
        .bind(config.is_test_mode)
        .bind(&config.settings)
        .bind(config.commission)
        .bind(config.min_amount)
        .bind(config.max_amount)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(saved)
    }

    async fn ledger_entries(&self, account_id: Uuid, page: Page) -> StoreResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            SELECT {}
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2 OFFSET $3
            "#,
            LEDGER_COLUMNS
        ))
        .bind(account_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn count_ledger_entries(&self, account_id: Uuid) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM ledger_entries WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn ledger_total(&self, account_id: Uuid) -> StoreResult<Decimal> {
        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn orders_for_account(&self, account_id: Uuid, page: Page) -> StoreResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {}
            FROM orders
            WHERE account_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2 OFFSET $3
            "#,
            ORDER_COLUMNS
        ))
        .bind(account_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn count_orders(&self, account_id: Uuid) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM orders WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn find_order_by_number(&self, order_number: &str) -> StoreResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE order_number = $1",
            ORDER_COLUMNS
        ))
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn order_items(&self, order_id: Uuid) -> StoreResult<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(&format!(
            "SELECT {} FROM order_items WHERE order_id = $1 ORDER BY seq",
            ORDER_ITEM_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn keys_for_order(&self, order_id: Uuid) -> StoreResult<Vec<FulfillmentKey>> {
        let keys = sqlx::query_as::<_, FulfillmentKey>(&format!(
            r#"
            SELECT {}
            FROM fulfillment_keys
            WHERE order_item_id IN (SELECT id FROM order_items WHERE order_id = $1)
            ORDER BY created_at
            "#,
            KEY_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn find_payment(&self, transaction_id: &str) -> StoreResult<Option<PaymentTransaction>> {
        let payment = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            SELECT {}
            FROM payment_transactions
            WHERE transaction_id = $1 OR provider_transaction_id = $1
            ORDER BY (transaction_id = $1) DESC
            LIMIT 1
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }
}

/// One PostgreSQL transaction. Dropping it without [`UnitOfWork::commit`]
/// rolls back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_account(&mut self, account_id: Uuid) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(account)
    }

    async fn update_balance(&mut self, account_id: Uuid, balance: Decimal) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $1, version = version + 1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(balance)
        .bind(Utc::now())
        .bind(account_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::MissingRow(format!("account {}", account_id)));
        }
        Ok(())
    }

    async fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry> {
        let inserted = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            INSERT INTO ledger_entries
                (id, account_id, amount, kind, order_id, payment_transaction_id, description,
                 balance_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            LEDGER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entry.account_id)
        .bind(entry.amount)
        .bind(entry.kind.to_string())
        .bind(entry.order_id)
        .bind(entry.payment_transaction_id)
        .bind(&entry.description)
        .bind(entry.balance_after)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_insert_error(e, "ledger entry"))?;

        Ok(inserted)
    }

    async fn ledger_entry_exists(&mut self, payment_id: Uuid, kind: LedgerKind) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM ledger_entries
                WHERE payment_transaction_id = $1 AND kind = $2
            )
            "#,
        )
        .bind(payment_id)
        .bind(kind.to_string())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn lock_catalog_item(&mut self, item_id: Uuid) -> StoreResult<Option<CatalogItem>> {
        let item = sqlx::query_as::<_, CatalogItem>(&format!(
            "SELECT {} FROM catalog_items WHERE id = $1 FOR UPDATE",
            CATALOG_COLUMNS
        ))
        .bind(item_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(item)
    }

    async fn update_stock(&mut self, item_id: Uuid, stock: i32) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            "UPDATE catalog_items SET stock = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(stock)
        .bind(Utc::now())
        .bind(item_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::MissingRow(format!("catalog item {}", item_id)));
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: NewOrder) -> StoreResult<Order> {
        let inserted = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders
                (id, account_id, order_number, total_amount, status, delivery_info, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(order.account_id)
        .bind(&order.order_number)
        .bind(order.total_amount)
        .bind(order.status.to_string())
        .bind(&order.delivery_info)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_insert_error(e, "order"))?;

        Ok(inserted)
    }

    async fn lock_order_by_number(&mut self, order_number: &str) -> StoreResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE order_number = $1 FOR UPDATE",
            ORDER_COLUMNS
        ))
        .bind(order_number)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(order)
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Order> {
        let order = sqlx::query_as::<_, Order>(&format!(
            r#"
            UPDATE orders
            SET status = $1, completed_at = COALESCE($2, completed_at)
            WHERE id = $3
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(status.to_string())
        .bind(completed_at)
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::MissingRow(format!("order {}", order_id)))?;

        Ok(order)
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> StoreResult<OrderItem> {
        let inserted = sqlx::query_as::<_, OrderItem>(&format!(
            r#"
            INSERT INTO order_items (id, order_id, catalog_item_id, quantity, unit_price, line_total)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            ORDER_ITEM_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(item.order_id)
        .bind(item.catalog_item_id)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.line_total)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(inserted)
    }

    async fn insert_fulfillment_key(&mut self, key: NewFulfillmentKey) -> StoreResult<FulfillmentKey> {
        let inserted = sqlx::query_as::<_, FulfillmentKey>(&format!(
            r#"
            INSERT INTO fulfillment_keys
                (id, catalog_item_id, key_value, is_used, order_item_id, created_at, used_at)
            VALUES ($1, $2, $3, TRUE, $4, $5, $5)
            RETURNING {}
            "#,
            KEY_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(key.catalog_item_id)
        .bind(&key.key_value)
        .bind(key.order_item_id)
        .bind(key.used_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_insert_error(e, "fulfillment key"))?;

        Ok(inserted)
    }

    async fn insert_payment(&mut self, payment: NewPaymentTransaction) -> StoreResult<PaymentTransaction> {
        let now = Utc::now();
        let completed_at = if payment.status.is_finalized() { Some(now) } else { None };
        let inserted = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            INSERT INTO payment_transactions
                (id, transaction_id, provider_transaction_id, account_id, order_id, provider_name,
                 method, amount, currency, status, description, client_ip, provider_data, metadata,
                 created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15, $16)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&payment.transaction_id)
        .bind(&payment.provider_transaction_id)
        .bind(payment.account_id)
        .bind(payment.order_id)
        .bind(&payment.provider_name)
        .bind(payment.method.to_string())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status.to_string())
        .bind(&payment.description)
        .bind(&payment.client_ip)
        .bind(&payment.provider_data)
        .bind(&payment.metadata)
        .bind(now)
        .bind(completed_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_insert_error(e, "payment transaction"))?;

        Ok(inserted)
    }

    async fn lock_payment(&mut self, transaction_id: &str) -> StoreResult<Option<PaymentTransaction>> {
        let payment = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            SELECT {}
            FROM payment_transactions
            WHERE transaction_id = $1 OR provider_transaction_id = $1
            ORDER BY (transaction_id = $1) DESC
            LIMIT 1
            FOR UPDATE
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(payment)
    }

    async fn save_payment(&mut self, payment: &PaymentTransaction) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $1, provider_transaction_id = $2, error_message = $3,
                updated_at = $4, completed_at = $5
            WHERE id = $6
            "#,
        )
        .bind(payment.status.to_string())
        .bind(&payment.provider_transaction_id)
        .bind(&payment.error_message)
        .bind(payment.updated_at)
        .bind(payment.completed_at)
        .bind(payment.id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::MissingRow(format!("payment {}", payment.transaction_id)));
        }
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
