use super::{ProviderConfigSource, Store, UnitOfWork};
use crate::errors::{StoreError, StoreResult};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Operations that can be made to fail once, for rollback tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertLedgerEntry,
    InsertOrder,
    InsertOrderItem,
    InsertFulfillmentKey,
    UpdateStock,
    SavePayment,
    Commit,
}

/// Arena of rows keyed by id, plus the secondary indexes the queries need.
///
/// Rows reference each other only through id fields.
#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    catalog: HashMap<Uuid, CatalogItem>,
    // Append-only, oldest first
    ledger: Vec<LedgerEntry>,
    orders: HashMap<Uuid, Order>,
    // Insertion order per account, oldest first
    orders_by_account: HashMap<Uuid, Vec<Uuid>>,
    order_numbers: HashMap<String, Uuid>,
    order_items: Vec<OrderItem>,
    keys: Vec<FulfillmentKey>,
    key_values: HashSet<String>,
    payments: HashMap<Uuid, PaymentTransaction>,
    payment_ids: HashMap<String, Uuid>,
    provider_payment_ids: HashMap<String, Uuid>,
    provider_configs: Vec<ProviderConfig>,
}

impl Tables {
    fn find_payment(&self, transaction_id: &str) -> Option<&PaymentTransaction> {
        self.payment_ids
            .get(transaction_id)
            .or_else(|| self.provider_payment_ids.get(transaction_id))
            .and_then(|id| self.payments.get(id))
    }
}

/// In-process store with the same transactional contract as [`PgStore`].
///
/// A unit of work takes the single table lock for its whole lifetime and
/// records its writes in a change set, which is applied to the shared tables
/// on commit. Dropping the unit of work discards the change set.
///
/// [`PgStore`]: super::PgStore
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<HashSet<FailPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `point` fail with [`StoreError::InjectedFailure`].
    pub async fn fail_next(&self, point: FailPoint) {
        self.faults.lock().await.insert(point);
    }

    /// Every ledger entry of an account, oldest first.
    pub async fn all_ledger_entries(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        let tables = self.tables.lock().await;
        tables
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn all_orders(&self) -> Vec<Order> {
        self.tables.lock().await.orders.values().cloned().collect()
    }

    pub async fn all_order_items(&self) -> Vec<OrderItem> {
        self.tables.lock().await.order_items.clone()
    }

    pub async fn all_keys(&self) -> Vec<FulfillmentKey> {
        self.tables.lock().await.keys.clone()
    }

    pub async fn all_payments(&self) -> Vec<PaymentTransaction> {
        self.tables.lock().await.payments.values().cloned().collect()
    }
}

#[async_trait]
impl ProviderConfigSource for MemoryStore {
    async fn provider_configs(&self) -> StoreResult<Vec<ProviderConfig>> {
        let tables = self.tables.lock().await;
        let mut configs = tables.provider_configs.clone();
        configs.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(configs)
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryUnitOfWork;

    async fn begin(&self) -> StoreResult<MemoryUnitOfWork> {
        let guard = self.tables.clone().lock_owned().await;
        Ok(MemoryUnitOfWork {
            guard,
            changes: Changes::default(),
            faults: self.faults.clone(),
        })
    }

    async fn create_account(&self, email: Option<&str>) -> StoreResult<Account> {
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            email: email.map(str::to_string),
            balance: Decimal::ZERO,
            is_active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .lock()
            .await
            .accounts
            .insert(account.id, account.clone());
        Ok(account)
    }

    async fn find_account(&self, account_id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.tables.lock().await.accounts.get(&account_id).cloned())
    }

    async fn set_account_active(&self, account_id: Uuid, active: bool) -> StoreResult<Option<Account>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.accounts.get_mut(&account_id).map(|account| {
            account.is_active = active;
            account.version += 1;
            account.updated_at = Utc::now();
            account.clone()
        }))
    }

    async fn create_catalog_item(&self, item: NewCatalogItem) -> StoreResult<CatalogItem> {
        let now = Utc::now();
        let created = CatalogItem {
            id: Uuid::new_v4(),
            name: item.name,
            price: item.price,
            stock: item.stock,
            is_active: item.is_active,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .lock()
            .await
            .catalog
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_catalog_item(&self, item_id: Uuid) -> StoreResult<Option<CatalogItem>> {
        Ok(self.tables.lock().await.catalog.get(&item_id).cloned())
    }

    async fn restock(&self, item_id: Uuid, quantity: i32) -> StoreResult<Option<CatalogItem>> {
        let mut tables = self.tables.lock().await;
        let Some(item) = tables.catalog.get_mut(&item_id) else {
            return Ok(None);
        };
        item.stock = item
            .stock
            .checked_add(quantity)
            .filter(|stock| *stock >= 0)
            .ok_or_else(|| StoreError::OutOfRange(format!("stock of catalog item {}", item_id)))?;
        item.updated_at = Utc::now();
        Ok(Some(item.clone()))
    }

    async fn upsert_provider_config(&self, config: NewProviderConfig) -> StoreResult<ProviderConfig> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let existing = tables
            .provider_configs
            .iter()
            .position(|c| c.name == config.name);
        let (id, created_at) = match existing {
            Some(idx) => (tables.provider_configs[idx].id, tables.provider_configs[idx].created_at),
            None => (Uuid::new_v4(), now),
        };
        let saved = ProviderConfig {
            id,
            name: config.name,
            display_name: config.display_name,
            is_enabled: config.is_enabled,
            priority: config.priority,
            api_key: config.api_key,
            secret_key: config.secret_key,
            merchant_id: config.merchant_id,
            is_test_mode: config.is_test_mode,
            settings: config.settings,
            commission: config.commission,
            min_amount: config.min_amount,
            max_amount: config.max_amount,
            created_at,
            updated_at: now,
        };
        match existing {
            Some(idx) => tables.provider_configs[idx] = saved.clone(),
            None => tables.provider_configs.push(saved.clone()),
        }
        Ok(saved)
    }

    async fn ledger_entries(&self, account_id: Uuid, page: Page) -> StoreResult<Vec<LedgerEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ledger
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect())
    }

    async fn count_ledger_entries(&self, account_id: Uuid) -> StoreResult<i64> {
        let tables = self.tables.lock().await;
        Ok(tables.ledger.iter().filter(|e| e.account_id == account_id).count() as i64)
    }

    async fn ledger_total(&self, account_id: Uuid) -> StoreResult<Decimal> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.amount)
            .sum())
    }

    async fn orders_for_account(&self, account_id: Uuid, page: Page) -> StoreResult<Vec<Order>> {
        let tables = self.tables.lock().await;
        let Some(ids) = tables.orders_by_account.get(&account_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .rev()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .filter_map(|id| tables.orders.get(id).cloned())
            .collect())
    }

    async fn count_orders(&self, account_id: Uuid) -> StoreResult<i64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders_by_account
            .get(&account_id)
            .map_or(0, |ids| ids.len() as i64))
    }

    async fn find_order_by_number(&self, order_number: &str) -> StoreResult<Option<Order>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .order_numbers
            .get(order_number)
            .and_then(|id| tables.orders.get(id))
            .cloned())
    }

    async fn order_items(&self, order_id: Uuid) -> StoreResult<Vec<OrderItem>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn keys_for_order(&self, order_id: Uuid) -> StoreResult<Vec<FulfillmentKey>> {
        let tables = self.tables.lock().await;
        let item_ids: HashSet<Uuid> = tables
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .map(|i| i.id)
            .collect();
        Ok(tables
            .keys
            .iter()
            .filter(|k| k.order_item_id.map_or(false, |id| item_ids.contains(&id)))
            .cloned()
            .collect())
    }

    async fn find_payment(&self, transaction_id: &str) -> StoreResult<Option<PaymentTransaction>> {
        Ok(self.tables.lock().await.find_payment(transaction_id).cloned())
    }
}

/// Rows written by one unit of work, kept apart from the shared tables until
/// commit.
///
/// Reads look here first and fall back to the tables, so a unit of work sees
/// its own writes. Work done per operation is proportional to what the unit
/// of work touches, not to the size of the store.
#[derive(Debug, Default)]
struct Changes {
    accounts: HashMap<Uuid, Account>,
    catalog: HashMap<Uuid, CatalogItem>,
    ledger: Vec<LedgerEntry>,
    orders: HashMap<Uuid, Order>,
    // (account id, order id) in insertion order
    new_orders: Vec<(Uuid, Uuid)>,
    order_numbers: HashMap<String, Uuid>,
    order_items: Vec<OrderItem>,
    keys: Vec<FulfillmentKey>,
    key_values: HashSet<String>,
    payments: HashMap<Uuid, PaymentTransaction>,
    payment_ids: HashMap<String, Uuid>,
    provider_payment_ids: HashMap<String, Uuid>,
}

/// Exclusive handle over the in-memory tables for one unit of work.
pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<Tables>,
    changes: Changes,
    faults: Arc<Mutex<HashSet<FailPoint>>>,
}

impl MemoryUnitOfWork {
    async fn check(&self, point: FailPoint) -> StoreResult<()> {
        if self.faults.lock().await.remove(&point) {
            return Err(StoreError::InjectedFailure(format!("{:?}", point)));
        }
        Ok(())
    }

    fn account(&self, account_id: Uuid) -> Option<&Account> {
        self.changes
            .accounts
            .get(&account_id)
            .or_else(|| self.guard.accounts.get(&account_id))
    }

    fn catalog_item(&self, item_id: Uuid) -> Option<&CatalogItem> {
        self.changes
            .catalog
            .get(&item_id)
            .or_else(|| self.guard.catalog.get(&item_id))
    }

    fn order(&self, order_id: Uuid) -> Option<&Order> {
        self.changes
            .orders
            .get(&order_id)
            .or_else(|| self.guard.orders.get(&order_id))
    }

    fn payment_id(&self, transaction_id: &str) -> Option<Uuid> {
        self.changes
            .payment_ids
            .get(transaction_id)
            .or_else(|| self.guard.payment_ids.get(transaction_id))
            .or_else(|| self.changes.provider_payment_ids.get(transaction_id))
            .or_else(|| self.guard.provider_payment_ids.get(transaction_id))
            .copied()
    }

    fn payment(&self, payment_id: Uuid) -> Option<&PaymentTransaction> {
        self.changes
            .payments
            .get(&payment_id)
            .or_else(|| self.guard.payments.get(&payment_id))
    }

    fn has_payment_entry(&self, payment_id: Uuid, kind: LedgerKind) -> bool {
        self.changes
            .ledger
            .iter()
            .chain(self.guard.ledger.iter())
            .any(|e| e.kind == kind && e.payment_transaction_id == Some(payment_id))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_account(&mut self, account_id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.account(account_id).cloned())
    }

    async fn update_balance(&mut self, account_id: Uuid, balance: Decimal) -> StoreResult<()> {
        let mut account = self
            .account(account_id)
            .cloned()
            .ok_or_else(|| StoreError::MissingRow(format!("account {}", account_id)))?;
        account.balance = balance;
        account.version += 1;
        account.updated_at = Utc::now();
        self.changes.accounts.insert(account_id, account);
        Ok(())
    }

    async fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry> {
        self.check(FailPoint::InsertLedgerEntry).await?;
        if let (LedgerKind::Deposit, Some(payment_id)) = (entry.kind, entry.payment_transaction_id) {
            if self.has_payment_entry(payment_id, LedgerKind::Deposit) {
                return Err(StoreError::UniqueViolation(format!(
                    "ledger entry: deposit for payment {} already recorded",
                    payment_id
                )));
            }
        }
        let inserted = LedgerEntry {
            id: Uuid::new_v4(),
            account_id: entry.account_id,
            amount: entry.amount,
            kind: entry.kind,
            order_id: entry.order_id,
            payment_transaction_id: entry.payment_transaction_id,
            description: entry.description,
            balance_after: entry.balance_after,
            created_at: Utc::now(),
        };
        self.changes.ledger.push(inserted.clone());
        Ok(inserted)
    }

    async fn ledger_entry_exists(&mut self, payment_id: Uuid, kind: LedgerKind) -> StoreResult<bool> {
        Ok(self.has_payment_entry(payment_id, kind))
    }

    async fn lock_catalog_item(&mut self, item_id: Uuid) -> StoreResult<Option<CatalogItem>> {
        Ok(self.catalog_item(item_id).cloned())
    }

    async fn update_stock(&mut self, item_id: Uuid, stock: i32) -> StoreResult<()> {
        self.check(FailPoint::UpdateStock).await?;
        let mut item = self
            .catalog_item(item_id)
            .cloned()
            .ok_or_else(|| StoreError::MissingRow(format!("catalog item {}", item_id)))?;
        item.stock = stock;
        item.updated_at = Utc::now();
        self.changes.catalog.insert(item_id, item);
        Ok(())
    }

    async fn insert_order(&mut self, order: NewOrder) -> StoreResult<Order> {
        self.check(FailPoint::InsertOrder).await?;
        if self.changes.order_numbers.contains_key(&order.order_number)
            || self.guard.order_numbers.contains_key(&order.order_number)
        {
            return Err(StoreError::UniqueViolation(format!(
                "order: number {} already exists",
                order.order_number
            )));
        }
        let inserted = Order {
            id: Uuid::new_v4(),
            account_id: order.account_id,
            order_number: order.order_number,
            total_amount: order.total_amount,
            status: order.status,
            delivery_info: order.delivery_info,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.changes
            .order_numbers
            .insert(inserted.order_number.clone(), inserted.id);
        self.changes
            .new_orders
            .push((inserted.account_id, inserted.id));
        self.changes.orders.insert(inserted.id, inserted.clone());
        Ok(inserted)
    }

    async fn lock_order_by_number(&mut self, order_number: &str) -> StoreResult<Option<Order>> {
        let id = self
            .changes
            .order_numbers
            .get(order_number)
            .or_else(|| self.guard.order_numbers.get(order_number))
            .copied();
        Ok(id.and_then(|id| self.order(id)).cloned())
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Order> {
        let mut order = self
            .order(order_id)
            .cloned()
            .ok_or_else(|| StoreError::MissingRow(format!("order {}", order_id)))?;
        order.status = status;
        if completed_at.is_some() {
            order.completed_at = completed_at;
        }
        self.changes.orders.insert(order_id, order.clone());
        Ok(order)
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> StoreResult<OrderItem> {
        self.check(FailPoint::InsertOrderItem).await?;
        let inserted = OrderItem {
            id: Uuid::new_v4(),
            order_id: item.order_id,
            catalog_item_id: item.catalog_item_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
            line_total: item.line_total,
        };
        self.changes.order_items.push(inserted.clone());
        Ok(inserted)
    }

    async fn insert_fulfillment_key(&mut self, key: NewFulfillmentKey) -> StoreResult<FulfillmentKey> {
        self.check(FailPoint::InsertFulfillmentKey).await?;
        if self.guard.key_values.contains(&key.key_value)
            || !self.changes.key_values.insert(key.key_value.clone())
        {
            return Err(StoreError::UniqueViolation(format!(
                "fulfillment key: value {} already issued",
                key.key_value
            )));
        }
        let inserted = FulfillmentKey {
            id: Uuid::new_v4(),
            catalog_item_id: key.catalog_item_id,
            key_value: key.key_value,
            is_used: true,
            order_item_id: Some(key.order_item_id),
            created_at: key.used_at,
            used_at: Some(key.used_at),
        };
        self.changes.keys.push(inserted.clone());
        Ok(inserted)
    }

    async fn insert_payment(&mut self, payment: NewPaymentTransaction) -> StoreResult<PaymentTransaction> {
        if self.changes.payment_ids.contains_key(&payment.transaction_id)
            || self.guard.payment_ids.contains_key(&payment.transaction_id)
        {
            return Err(StoreError::UniqueViolation(format!(
                "payment transaction: id {} already exists",
                payment.transaction_id
            )));
        }
        let now = Utc::now();
        let inserted = PaymentTransaction {
            id: Uuid::new_v4(),
            transaction_id: payment.transaction_id,
            provider_transaction_id: payment.provider_transaction_id,
            account_id: payment.account_id,
            order_id: payment.order_id,
            provider_name: payment.provider_name,
            method: payment.method,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            description: payment.description,
            error_message: None,
            client_ip: payment.client_ip,
            provider_data: payment.provider_data,
            metadata: payment.metadata,
            created_at: now,
            updated_at: now,
            completed_at: payment.status.is_finalized().then_some(now),
        };
        self.changes
            .payment_ids
            .insert(inserted.transaction_id.clone(), inserted.id);
        if let Some(provider_id) = &inserted.provider_transaction_id {
            self.changes
                .provider_payment_ids
                .insert(provider_id.clone(), inserted.id);
        }
        self.changes.payments.insert(inserted.id, inserted.clone());
        Ok(inserted)
    }

    async fn lock_payment(&mut self, transaction_id: &str) -> StoreResult<Option<PaymentTransaction>> {
        Ok(self
            .payment_id(transaction_id)
            .and_then(|id| self.payment(id))
            .cloned())
    }

    async fn save_payment(&mut self, payment: &PaymentTransaction) -> StoreResult<()> {
        self.check(FailPoint::SavePayment).await?;
        if self.payment(payment.id).is_none() {
            return Err(StoreError::MissingRow(format!("payment {}", payment.transaction_id)));
        }
        if let Some(provider_id) = &payment.provider_transaction_id {
            self.changes
                .provider_payment_ids
                .insert(provider_id.clone(), payment.id);
        }
        self.changes.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.check(FailPoint::Commit).await?;
        let MemoryUnitOfWork {
            mut guard, changes, ..
        } = self;
        let tables = &mut *guard;

        tables.accounts.extend(changes.accounts);
        tables.catalog.extend(changes.catalog);
        tables.ledger.extend(changes.ledger);
        tables.orders.extend(changes.orders);
        for (account_id, order_id) in changes.new_orders {
            tables
                .orders_by_account
                .entry(account_id)
                .or_default()
                .push(order_id);
        }
        tables.order_numbers.extend(changes.order_numbers);
        tables.order_items.extend(changes.order_items);
        tables.keys.extend(changes.keys);
        tables.key_values.extend(changes.key_values);
        tables.payments.extend(changes.payments);
        tables.payment_ids.extend(changes.payment_ids);
        tables.provider_payment_ids.extend(changes.provider_payment_ids);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_order(account_id: Uuid, number: &str) -> NewOrder {
        NewOrder {
            account_id,
            order_number: number.to_string(),
            total_amount: dec!(10),
            status: OrderStatus::Processing,
            delivery_info: None,
        }
    }

    #[tokio::test]
    async fn unit_of_work_reads_its_own_writes() {
        let store = MemoryStore::new();
        let account = store.create_account(None).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.update_balance(account.id, dec!(42)).await.unwrap();
        let locked = uow.lock_account(account.id).await.unwrap().unwrap();
        assert_eq!(locked.balance, dec!(42));
        assert_eq!(locked.version, 1);

        let order = uow.insert_order(new_order(account.id, "SF-1")).await.unwrap();
        let found = uow.lock_order_by_number("SF-1").await.unwrap().unwrap();
        assert_eq!(found.id, order.id);
        assert!(matches!(
            uow.insert_order(new_order(account.id, "SF-1")).await,
            Err(StoreError::UniqueViolation(_))
        ));
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_tables_untouched() {
        let store = MemoryStore::new();
        let account = store.create_account(None).await.unwrap();

        {
            let mut uow = store.begin().await.unwrap();
            uow.update_balance(account.id, dec!(42)).await.unwrap();
            uow.insert_order(new_order(account.id, "SF-2")).await.unwrap();
        }

        assert_eq!(store.find_account(account.id).await.unwrap().unwrap().balance, dec!(0));
        assert!(store.find_order_by_number("SF-2").await.unwrap().is_none());
        assert_eq!(store.count_orders(account.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_applies_rows_and_indexes() {
        let store = MemoryStore::new();
        let account = store.create_account(None).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.update_balance(account.id, dec!(7)).await.unwrap();
        let first = uow.insert_order(new_order(account.id, "SF-3")).await.unwrap();
        uow.update_order_status(first.id, OrderStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let second = uow.insert_order(new_order(account.id, "SF-4")).await.unwrap();
        // Committed rows are visible to the next unit of work.
        assert!(matches!(
            uow.insert_order(new_order(account.id, "SF-3")).await,
            Err(StoreError::UniqueViolation(_))
        ));
        uow.commit().await.unwrap();

        assert_eq!(store.find_account(account.id).await.unwrap().unwrap().balance, dec!(7));
        let stored = store.find_order_by_number("SF-3").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Completed);
        let newest = store
            .orders_for_account(account.id, Page::first(10))
            .await
            .unwrap();
        assert_eq!(newest.iter().map(|o| o.id).collect::<Vec<_>>(), vec![second.id, first.id]);
    }
}
