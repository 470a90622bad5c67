//! Integration tests against PostgreSQL
//!
//! These need a database reachable through `TEST_DATABASE_URL`
//! (use docker-compose up postgres). Without it every test returns early.
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test --test postgres_store
//!
//! Every test works on its own account and catalog rows, so they can run in
//! parallel against one database.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use std::sync::Arc;
use storefront_service::errors::PurchaseError;
use storefront_service::events::LogPublisher;
use storefront_service::ledger::Ledger;
use storefront_service::models::*;
use storefront_service::payments::{
    DepositSettings, PaymentService, ProviderFactory, TestProvider, TestProviderSettings,
};
use storefront_service::purchase::PurchaseService;
use storefront_service::repository::{PgStore, Store};
use uuid::Uuid;

async fn setup_test_db() -> Option<PgPool> {
    let database_url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return None;
        }
    };

    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(pool)
}

/// Removes everything the test created for `account_id`.
async fn cleanup_account(pool: &PgPool, account_id: Uuid) {
    for statement in [
        "DELETE FROM ledger_entries WHERE account_id = $1",
        "DELETE FROM payment_transactions WHERE account_id = $1",
        "DELETE FROM fulfillment_keys WHERE order_item_id IN \
         (SELECT oi.id FROM order_items oi JOIN orders o ON o.id = oi.order_id WHERE o.account_id = $1)",
        "DELETE FROM orders WHERE account_id = $1",
        "DELETE FROM accounts WHERE id = $1",
    ] {
        sqlx::query(statement)
            .bind(account_id)
            .execute(pool)
            .await
            .expect("Failed to clean up test data");
    }
}

async fn funded_account(store: &PgStore, amount: Decimal) -> Account {
    let ledger = Ledger::new(store.clone(), Arc::new(LogPublisher));
    let account = store.create_account(None).await.expect("Failed to create account");
    ledger
        .credit(account.id, amount, "Initial funding", None)
        .await
        .expect("Failed to fund account");
    account
}

async fn catalog_item(store: &PgStore, price: Decimal, stock: i32) -> CatalogItem {
    store
        .create_catalog_item(NewCatalogItem {
            name: "Gift Card".to_string(),
            price,
            stock,
            is_active: true,
        })
        .await
        .expect("Failed to create catalog item")
}

#[tokio::test]
async fn test_purchase_commits_everything() {
    let Some(pool) = setup_test_db().await else { return };
    let store = PgStore::new(pool.clone());
    let purchases = PurchaseService::new(store.clone(), Arc::new(LogPublisher));

    let account = funded_account(&store, dec!(100.00)).await;
    let item = catalog_item(&store, dec!(30.00), 5).await;

    let receipt = purchases
        .purchase(account.id, item.id, 2, None)
        .await
        .expect("Purchase failed");

    assert_eq!(receipt.new_balance, dec!(40.00));
    let account_now = store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(account_now.balance, dec!(40.00));
    assert_eq!(store.ledger_total(account.id).await.unwrap(), dec!(40.00));
    assert_eq!(store.find_catalog_item(item.id).await.unwrap().unwrap().stock, 3);

    let order = store
        .find_order_by_number(&receipt.order_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
    let keys = store.keys_for_order(order.id).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].is_used);

    cleanup_account(&pool, account.id).await;
}

#[tokio::test]
async fn test_rejected_purchase_leaves_no_rows() {
    let Some(pool) = setup_test_db().await else { return };
    let store = PgStore::new(pool.clone());
    let purchases = PurchaseService::new(store.clone(), Arc::new(LogPublisher));

    let account = funded_account(&store, dec!(10.00)).await;
    let item = catalog_item(&store, dec!(30.00), 5).await;

    let result = purchases.purchase(account.id, item.id, 1, None).await;
    match result.unwrap_err() {
        PurchaseError::InsufficientFunds { .. } => {}
        e => panic!("Expected InsufficientFunds error, got {:?}", e),
    }

    assert_eq!(store.count_orders(account.id).await.unwrap(), 0);
    assert_eq!(store.count_ledger_entries(account.id).await.unwrap(), 1);
    assert_eq!(store.find_catalog_item(item.id).await.unwrap().unwrap().stock, 5);

    cleanup_account(&pool, account.id).await;
}

#[tokio::test]
async fn test_concurrent_purchases_of_last_unit() {
    let Some(pool) = setup_test_db().await else { return };
    let store = PgStore::new(pool.clone());
    let purchases = PurchaseService::new(store.clone(), Arc::new(LogPublisher));

    let item = catalog_item(&store, dec!(10.00), 1).await;
    let mut accounts = Vec::new();
    for _ in 0..5 {
        accounts.push(funded_account(&store, dec!(50.00)).await);
    }

    let handles: Vec<_> = accounts
        .iter()
        .map(|account| {
            let purchases = purchases.clone();
            let account_id = account.id;
            let item_id = item.id;
            tokio::spawn(async move { purchases.purchase(account_id, item_id, 1, None).await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    let successes = results
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(store.find_catalog_item(item.id).await.unwrap().unwrap().stock, 0);

    for account in &accounts {
        let balance = store.find_account(account.id).await.unwrap().unwrap().balance;
        assert_eq!(balance, store.ledger_total(account.id).await.unwrap());
        cleanup_account(&pool, account.id).await;
    }
}

#[tokio::test]
async fn test_deposit_completion_is_idempotent() {
    let Some(pool) = setup_test_db().await else { return };
    let store = PgStore::new(pool.clone());
    let factory = ProviderFactory::new(Arc::new(store.clone())).register(Arc::new(TestProvider::new(
        TestProviderSettings {
            auto_complete: false,
            ..TestProviderSettings::default()
        },
    )));
    let payments = PaymentService::new(
        store.clone(),
        factory,
        Arc::new(LogPublisher),
        DepositSettings::default(),
    );

    let account = store.create_account(None).await.unwrap();
    let receipt = payments
        .create_deposit(account.id, dec!(120.00), PaymentMethod::Card, None)
        .await
        .expect("Deposit failed");
    assert_eq!(receipt.status, PaymentStatus::Pending);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let payments = payments.clone();
            let transaction_id = receipt.transaction_id.clone();
            tokio::spawn(async move { payments.complete_payment(&transaction_id).await })
        })
        .collect();
    let credits = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().expect("Completion failed"))
        .filter(|change| change.credit.is_some())
        .count();
    assert_eq!(credits, 1);

    let account_now = store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(account_now.balance, dec!(120.00));
    assert_eq!(store.count_ledger_entries(account.id).await.unwrap(), 1);

    cleanup_account(&pool, account.id).await;
}
