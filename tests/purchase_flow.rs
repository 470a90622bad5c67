mod common;

use common::Harness;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use storefront_service::errors::{LedgerError, PurchaseError, QueryError, StoreError};
use storefront_service::events::StoreEvent;
use storefront_service::models::*;
use storefront_service::purchase::CheckoutLine;
use storefront_service::repository::{FailPoint, Store};
use uuid::Uuid;

#[tokio::test]
async fn test_successful_purchase() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(100.00)).await;
    let item = h.item(dec!(30.00), 5).await;

    let receipt = h
        .purchases
        .purchase(account.id, item.id, 2, Some("buyer@example.com".to_string()))
        .await
        .unwrap();

    assert_eq!(receipt.total_amount, dec!(60.00));
    assert_eq!(receipt.new_balance, dec!(40.00));
    assert_eq!(receipt.keys.len(), 1);
    assert!(receipt.order_number.starts_with("SF-"));

    assert_eq!(h.balance(account.id).await, dec!(40.00));
    assert_eq!(h.stock(item.id).await, 3);

    let orders = h.store.all_orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Completed);
    assert!(orders[0].completed_at.is_some());
    assert_eq!(orders[0].delivery_info.as_deref(), Some("buyer@example.com"));

    let entries = h.store.all_ledger_entries(account.id).await;
    let purchase = entries.last().unwrap();
    assert_eq!(purchase.kind, LedgerKind::Purchase);
    assert_eq!(purchase.amount, dec!(-60.00));
    assert_eq!(purchase.balance_after, dec!(40.00));
    assert_eq!(purchase.order_id, Some(receipt.order_id));
    assert!(purchase.description.contains(&receipt.order_number));

    h.assert_balance_matches_ledger(account.id).await;

    let events = h.events.events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        StoreEvent::PurchaseCompleted { order_number, key_count: 1, .. } if *order_number == receipt.order_number
    )));
}

#[tokio::test]
async fn test_purchase_insufficient_funds() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(10.00)).await;
    let item = h.item(dec!(30.00), 5).await;
    let entries_before = h.ledger_count(account.id).await;

    let result = h.purchases.purchase(account.id, item.id, 1, None).await;

    match result.unwrap_err() {
        PurchaseError::InsufficientFunds {
            required,
            available,
        } => {
            assert_eq!(required, dec!(30.00));
            assert_eq!(available, dec!(10.00));
        }
        e => panic!("Expected InsufficientFunds error, got {:?}", e),
    }

    assert_eq!(h.balance(account.id).await, dec!(10.00));
    assert_eq!(h.stock(item.id).await, 5);
    assert!(h.store.all_orders().await.is_empty());
    assert!(h.store.all_keys().await.is_empty());
    assert_eq!(h.ledger_count(account.id).await, entries_before);
}

#[tokio::test]
async fn test_purchase_insufficient_stock() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(1000.00)).await;
    let item = h.item(dec!(30.00), 1).await;

    let result = h.purchases.purchase(account.id, item.id, 2, None).await;

    match result.unwrap_err() {
        PurchaseError::InsufficientStock {
            item_id,
            requested,
            available,
        } => {
            assert_eq!(item_id, item.id);
            assert_eq!(requested, 2);
            assert_eq!(available, 1);
        }
        e => panic!("Expected InsufficientStock error, got {:?}", e),
    }

    assert_eq!(h.balance(account.id).await, dec!(1000.00));
    assert_eq!(h.stock(item.id).await, 1);
    assert!(h.store.all_orders().await.is_empty());
}

#[tokio::test]
async fn test_purchase_sold_out_item() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(500.00)).await;
    let item = h.item(dec!(100.00), 0).await;

    assert!(matches!(
        h.purchases.purchase(account.id, item.id, 1, None).await,
        Err(PurchaseError::InsufficientStock { available: 0, .. })
    ));
    assert_eq!(h.balance(account.id).await, dec!(500.00));
    assert_eq!(h.stock(item.id).await, 0);
    assert!(h.store.all_orders().await.is_empty());
    assert!(h.store.all_keys().await.is_empty());
}

#[tokio::test]
async fn test_purchase_rejects_bad_input() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(100.00)).await;
    let item = h.item(dec!(30.00), 5).await;

    assert!(matches!(
        h.purchases.purchase(account.id, item.id, 0, None).await,
        Err(PurchaseError::InvalidQuantity(_))
    ));
    assert!(matches!(
        h.purchases.purchase(Uuid::new_v4(), item.id, 1, None).await,
        Err(PurchaseError::AccountNotFound(_))
    ));
    assert!(matches!(
        h.purchases.purchase(account.id, Uuid::new_v4(), 1, None).await,
        Err(PurchaseError::ItemUnavailable(_))
    ));

    let hidden = h
        .store
        .create_catalog_item(NewCatalogItem {
            name: "Retired".to_string(),
            price: dec!(1.00),
            stock: 10,
            is_active: false,
        })
        .await
        .unwrap();
    assert!(matches!(
        h.purchases.purchase(account.id, hidden.id, 1, None).await,
        Err(PurchaseError::ItemUnavailable(_))
    ));

    h.store.set_account_active(account.id, false).await.unwrap();
    assert!(matches!(
        h.purchases.purchase(account.id, item.id, 1, None).await,
        Err(PurchaseError::AccountInactive(_))
    ));

    assert_eq!(h.balance(account.id).await, dec!(100.00));
    assert_eq!(h.stock(item.id).await, 5);
    assert!(h.store.all_orders().await.is_empty());
}

async fn assert_purchase_rolls_back(point: FailPoint) {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(100.00)).await;
    let item = h.item(dec!(25.00), 4).await;
    let entries_before = h.ledger_count(account.id).await;

    h.store.fail_next(point).await;
    let result = h.purchases.purchase(account.id, item.id, 1, None).await;

    match result.unwrap_err() {
        PurchaseError::PurchaseFailed(_) => {}
        e => panic!("Expected PurchaseFailed at {:?}, got {:?}", point, e),
    }

    assert_eq!(h.balance(account.id).await, dec!(100.00), "{:?}", point);
    assert_eq!(h.stock(item.id).await, 4, "{:?}", point);
    assert!(h.store.all_orders().await.is_empty(), "{:?}", point);
    assert!(h.store.all_order_items().await.is_empty(), "{:?}", point);
    assert!(h.store.all_keys().await.is_empty(), "{:?}", point);
    assert_eq!(h.ledger_count(account.id).await, entries_before, "{:?}", point);
    assert!(h
        .events
        .events()
        .await
        .iter()
        .all(|e| !matches!(e, StoreEvent::PurchaseCompleted { .. })));

    // The store is usable again once the fault has fired.
    h.purchases.purchase(account.id, item.id, 1, None).await.unwrap();
    assert_eq!(h.stock(item.id).await, 3);
    h.assert_balance_matches_ledger(account.id).await;
}

#[tokio::test]
async fn test_purchase_rolls_back_when_key_insert_fails() {
    assert_purchase_rolls_back(FailPoint::InsertFulfillmentKey).await;
}

#[tokio::test]
async fn test_purchase_rolls_back_when_stock_update_fails() {
    assert_purchase_rolls_back(FailPoint::UpdateStock).await;
}

#[tokio::test]
async fn test_purchase_rolls_back_when_ledger_append_fails() {
    assert_purchase_rolls_back(FailPoint::InsertLedgerEntry).await;
}

#[tokio::test]
async fn test_purchase_rolls_back_when_commit_fails() {
    assert_purchase_rolls_back(FailPoint::Commit).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchases_of_last_unit() {
    let h = Harness::new();
    let item = h.item(dec!(10.00), 1).await;
    let a = h.account_with_balance(dec!(50.00)).await;
    let b = h.account_with_balance(dec!(50.00)).await;
    let item_id = item.id;

    let handles: Vec<_> = [a.id, b.id]
        .into_iter()
        .map(|account_id| {
            let purchases = h.purchases.clone();
            tokio::spawn(async move { purchases.purchase(account_id, item_id, 1, None).await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    let mut successes = 0;
    let mut out_of_stock = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => successes += 1,
            Err(PurchaseError::InsufficientStock { .. }) => out_of_stock += 1,
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(out_of_stock, 1);

    assert_eq!(h.stock(item.id).await, 0);
    assert_eq!(h.store.all_orders().await.len(), 1);
    assert_eq!(h.store.all_keys().await.len(), 1);

    let total = h.balance(a.id).await + h.balance(b.id).await;
    assert_eq!(total, dec!(90.00));
    h.assert_balance_matches_ledger(a.id).await;
    h.assert_balance_matches_ledger(b.id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchases_cannot_overdraw() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(100.00)).await;
    let item = h.item(dec!(30.00), 50).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let purchases = h.purchases.clone();
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
    assert_eq!(successes, 3);

    assert_eq!(h.balance(account.id).await, dec!(10.00));
    assert_eq!(h.stock(item.id).await, 47);
    h.assert_balance_matches_ledger(account.id).await;
}

#[tokio::test]
async fn test_checkout_merges_lines_and_issues_unique_keys() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(500.00)).await;
    let cheap = h.item(dec!(10.00), 10).await;
    let pricey = h.item(dec!(100.00), 10).await;

    let lines = [
        CheckoutLine {
            catalog_item_id: cheap.id,
            quantity: 1,
        },
        CheckoutLine {
            catalog_item_id: pricey.id,
            quantity: 2,
        },
        CheckoutLine {
            catalog_item_id: cheap.id,
            quantity: 2,
        },
    ];
    let receipt = h.purchases.checkout(account.id, &lines, None).await.unwrap();

    assert_eq!(receipt.total_amount, dec!(230.00));
    assert_eq!(receipt.new_balance, dec!(270.00));
    assert_eq!(receipt.keys.len(), 2);
    assert_eq!(h.stock(cheap.id).await, 7);
    assert_eq!(h.stock(pricey.id).await, 8);

    let items = h.store.all_order_items().await;
    assert_eq!(items.len(), 2);
    for item in &items {
        assert_eq!(item.order_id, receipt.order_id);
        assert_eq!(item.line_total, item.unit_price * Decimal::from(item.quantity));
    }

    let keys = h.store.all_keys().await;
    let values: HashSet<&str> = keys.iter().map(|k| k.key_value.as_str()).collect();
    assert_eq!(values.len(), keys.len());
    for key in &keys {
        assert!(key.is_used);
        assert!(key.used_at.is_some());
        let owner = key.order_item_id.unwrap();
        let line = items.iter().find(|i| i.id == owner).unwrap();
        assert_eq!(line.catalog_item_id, key.catalog_item_id);
    }

    h.assert_balance_matches_ledger(account.id).await;
}

#[tokio::test]
async fn test_free_item_skips_ledger() {
    let h = Harness::new();
    let account = h.account_with_balance(Decimal::ZERO).await;
    let item = h.item(Decimal::ZERO, 3).await;

    let receipt = h.purchases.purchase(account.id, item.id, 1, None).await.unwrap();

    assert_eq!(receipt.total_amount, Decimal::ZERO);
    assert_eq!(receipt.new_balance, Decimal::ZERO);
    assert_eq!(receipt.keys.len(), 1);
    assert_eq!(h.ledger_count(account.id).await, 0);
    assert_eq!(h.stock(item.id).await, 2);
}

#[tokio::test]
async fn test_order_details_and_paging() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(100.00)).await;
    let other = h.account_with_balance(dec!(100.00)).await;
    let item = h.item(dec!(5.00), 20).await;

    let mut numbers = Vec::new();
    for _ in 0..3 {
        numbers.push(
            h.purchases
                .purchase(account.id, item.id, 1, None)
                .await
                .unwrap()
                .order_number,
        );
    }

    let page = h
        .purchases
        .orders_for_account(account.id, Page::new(1, 2))
        .await
        .unwrap();
    assert_eq!(page.total_items, 3);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].order_number, numbers[2]);
    assert_eq!(page.items[1].order_number, numbers[1]);

    let second = h
        .purchases
        .orders_for_account(account.id, Page::new(2, 2))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].order_number, numbers[0]);

    let view = h.purchases.order_details(account.id, &numbers[0]).await.unwrap();
    assert_eq!(view.status, OrderStatus::Completed);
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].keys.len(), 1);

    // Orders are only visible to their owner.
    assert!(matches!(
        h.purchases.order_details(other.id, &numbers[0]).await,
        Err(QueryError::NotFound(_))
    ));
    assert!(matches!(
        h.purchases.orders_for_account(Uuid::new_v4(), Page::first(10)).await,
        Err(QueryError::NotFound(_))
    ));

    let ledger = h.ledger.entries(account.id, Page::new(1, 2)).await.unwrap();
    assert_eq!(ledger.total_items, 4);
    assert_eq!(ledger.items[0].kind, LedgerKind::Purchase);
    assert_eq!(ledger.items[0].balance_after, dec!(85.00));
}

#[tokio::test]
async fn test_refund_order() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(100.00)).await;
    let item = h.item(dec!(40.00), 2).await;
    let receipt = h.purchases.purchase(account.id, item.id, 1, None).await.unwrap();

    let refund = h.purchases.refund_order(&receipt.order_number).await.unwrap();

    assert_eq!(refund.order.status, OrderStatus::Refunded);
    assert_eq!(refund.new_balance, dec!(100.00));
    assert_eq!(h.balance(account.id).await, dec!(100.00));
    // Keys stay issued and stock is not restored.
    assert_eq!(h.stock(item.id).await, 1);
    assert!(h.store.all_keys().await.iter().all(|k| k.is_used));

    let last = h.store.all_ledger_entries(account.id).await.pop().unwrap();
    assert_eq!(last.kind, LedgerKind::Refund);
    assert_eq!(last.amount, dec!(40.00));
    assert_eq!(last.order_id, Some(receipt.order_id));
    h.assert_balance_matches_ledger(account.id).await;

    match h.purchases.refund_order(&receipt.order_number).await.unwrap_err() {
        PurchaseError::OrderNotRefundable { status, .. } => {
            assert_eq!(status, OrderStatus::Refunded)
        }
        e => panic!("Expected OrderNotRefundable error, got {:?}", e),
    }
    assert!(matches!(
        h.purchases.refund_order("SF-19700101-00000000").await,
        Err(PurchaseError::OrderNotFound(_))
    ));
    assert_eq!(h.balance(account.id).await, dec!(100.00));
}

#[tokio::test]
async fn test_ledger_debit_credit_and_adjustments() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(50.00)).await;

    assert_eq!(
        h.ledger.debit(account.id, dec!(20.00), "Manual debit", None).await.unwrap(),
        dec!(30.00)
    );
    assert_eq!(
        h.ledger.refund(account.id, dec!(5.00), "Goodwill", None).await.unwrap(),
        dec!(35.00)
    );

    match h
        .ledger
        .debit(account.id, dec!(100.00), "Too much", None)
        .await
        .unwrap_err()
    {
        LedgerError::InsufficientFunds {
            required,
            available,
        } => {
            assert_eq!(required, dec!(100.00));
            assert_eq!(available, dec!(35.00));
        }
        e => panic!("Expected InsufficientFunds error, got {:?}", e),
    }
    assert!(matches!(
        h.ledger.credit(account.id, dec!(-1.00), "Negative", None).await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        h.ledger.credit(Uuid::new_v4(), dec!(1.00), "Nobody", None).await,
        Err(LedgerError::AccountNotFound(_))
    ));

    let bonus = h
        .ledger
        .adjust_balance(account.id, dec!(15.00), "Support compensation")
        .await
        .unwrap();
    assert_eq!(bonus.kind, LedgerKind::Bonus);
    assert_eq!(bonus.balance_after, dec!(50.00));

    let correction = h
        .ledger
        .adjust_balance(account.id, dec!(-10.00), "Duplicate bonus")
        .await
        .unwrap();
    assert_eq!(correction.kind, LedgerKind::Withdrawal);
    assert_eq!(correction.amount, dec!(-10.00));
    assert_eq!(correction.balance_after, dec!(40.00));

    assert!(matches!(
        h.ledger.adjust_balance(account.id, Decimal::ZERO, "Nothing").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        h.ledger.adjust_balance(account.id, dec!(1.00), "   ").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        h.ledger.adjust_balance(account.id, dec!(-500.00), "Overdraw").await,
        Err(LedgerError::InsufficientFunds { .. })
    ));

    let history = h.ledger.history(account.id, 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, correction.id);
    assert_eq!(history[1].id, bonus.id);

    assert_eq!(h.balance(account.id).await, dec!(40.00));
    h.assert_balance_matches_ledger(account.id).await;

    let adjusted = h
        .events
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::BalanceAdjusted { .. }))
        .count();
    assert_eq!(adjusted, 2);
}

#[tokio::test]
async fn test_purchase_total_overflow_is_rejected() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(100.00)).await;
    let priciest = h.item(MAX_MONEY, 5).await;
    let other = h.item(dec!(1.00), 5).await;

    match h
        .purchases
        .purchase(account.id, priciest.id, 2, None)
        .await
        .unwrap_err()
    {
        PurchaseError::InvalidAmount(_) => {}
        e => panic!("Expected InvalidAmount error, got {:?}", e),
    }

    let lines = [
        CheckoutLine {
            catalog_item_id: priciest.id,
            quantity: 1,
        },
        CheckoutLine {
            catalog_item_id: other.id,
            quantity: 1,
        },
    ];
    assert!(matches!(
        h.purchases.checkout(account.id, &lines, None).await,
        Err(PurchaseError::InvalidAmount(_))
    ));

    let huge = h.item(Decimal::MAX, 5).await;
    assert!(matches!(
        h.purchases.purchase(account.id, huge.id, 3, None).await,
        Err(PurchaseError::InvalidAmount(_))
    ));

    assert_eq!(h.stock(priciest.id).await, 5);
    assert_eq!(h.stock(other.id).await, 5);
    assert_eq!(h.balance(account.id).await, dec!(100.00));
    assert_eq!(h.store.count_orders(account.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_ledger_rejects_amounts_beyond_money_range() {
    let h = Harness::new();
    let account = h.account_with_balance(dec!(1.00)).await;

    assert!(matches!(
        h.ledger.adjust_balance(account.id, Decimal::MAX, "Typo").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        h.ledger.adjust_balance(account.id, Decimal::MIN, "Typo").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    // Fits as an amount but the resulting balance would not.
    assert!(matches!(
        h.ledger.credit(account.id, MAX_MONEY, "Top-up", None).await,
        Err(LedgerError::InvalidAmount(_))
    ));

    assert_eq!(h.balance(account.id).await, dec!(1.00));
    assert_eq!(h.ledger_count(account.id).await, 1);
    h.assert_balance_matches_ledger(account.id).await;
}

#[tokio::test]
async fn test_restock_overflow_is_rejected() {
    let h = Harness::new();
    let item = h.item(dec!(5.00), 10).await;

    assert!(matches!(
        h.store.restock(item.id, i32::MAX).await,
        Err(StoreError::OutOfRange(_))
    ));
    assert_eq!(h.stock(item.id).await, 10);

    let restocked = h.store.restock(item.id, 5).await.unwrap().unwrap();
    assert_eq!(restocked.stock, 15);
    assert!(h.store.restock(Uuid::new_v4(), 5).await.unwrap().is_none());
}
