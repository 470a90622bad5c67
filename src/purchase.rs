//! Purchase orchestrator
//!
//! A checkout runs as one unit of work: lock every catalog item (ascending id),
//! lock the account, create the order with its lines, mint one key per line,
//! decrement stock, debit the total and mark the order completed. Any error
//! drops the unit of work, so nothing from a failed attempt is persisted.

use crate::catalog::{decrement_stock, generate_order_number, issue_key, reserve_stock};
use crate::errors::{PurchaseError, PurchaseResult, QueryError, QueryResult};
use crate::events::{publish_committed, EventPublisher, StoreEvent};
use crate::ledger::{post_in, Posting};
use crate::models::*;
use crate::repository::{Store, UnitOfWork};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutLine {
    pub catalog_item_id: Uuid,
    pub quantity: u32,
}

impl From<CheckoutLineRequest> for CheckoutLine {
    fn from(line: CheckoutLineRequest) -> Self {
        Self {
            catalog_item_id: line.catalog_item_id,
            quantity: line.quantity,
        }
    }
}

/// Outcome of a committed checkout
#[derive(Debug, Clone)]
pub struct PurchaseReceipt {
    pub order_id: Uuid,
    pub order_number: String,
    pub total_amount: Decimal,
    /// One per order line, in line order.
    pub keys: Vec<String>,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderRefund {
    pub order: Order,
    pub new_balance: Decimal,
}

/// Merges duplicate items and orders lines by item id, which is also the lock
/// order.
fn normalize_lines(lines: &[CheckoutLine]) -> PurchaseResult<BTreeMap<Uuid, u32>> {
    if lines.is_empty() {
        return Err(PurchaseError::InvalidQuantity(
            "Order must contain at least one item".to_string(),
        ));
    }

    let mut merged: BTreeMap<Uuid, u32> = BTreeMap::new();
    for line in lines {
        if line.quantity == 0 {
            return Err(PurchaseError::InvalidQuantity(
                "Quantity must be at least 1".to_string(),
            ));
        }
        let quantity = merged.entry(line.catalog_item_id).or_insert(0);
        *quantity = quantity
            .checked_add(line.quantity)
            .filter(|q| i32::try_from(*q).is_ok())
            .ok_or_else(|| PurchaseError::InvalidQuantity("Quantity is too large".to_string()))?;
    }
    Ok(merged)
}

/// Rejects money values that overflowed or no longer fit a money column.
fn checked_money(value: Option<Decimal>) -> PurchaseResult<Decimal> {
    value.filter(|v| *v <= MAX_MONEY).ok_or_else(|| {
        PurchaseError::InvalidAmount(format!("Order total must not exceed {}", MAX_MONEY))
    })
}

fn line_amount(price: Decimal, quantity: u32) -> PurchaseResult<Decimal> {
    checked_money(price.checked_mul(Decimal::from(quantity)))
}

/// Purchase orchestrator
///
/// Lock order, shared with every other writer:
/// 1. catalog items, ascending by id
/// 2. the buyer's account
///
/// Two checkouts touching overlapping items always take their locks in the
/// same order and cannot deadlock. Stock is checked against the locked rows,
/// so two buyers racing for the last unit cannot both get it.
#[derive(Clone)]
pub struct PurchaseService<S: Store> {
    store: S,
    events: Arc<dyn EventPublisher>,
}

impl<S: Store> PurchaseService<S> {
    pub fn new(store: S, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    /// Buys `quantity` units of one item.
    pub async fn purchase(
        &self,
        account_id: Uuid,
        catalog_item_id: Uuid,
        quantity: u32,
        delivery_info: Option<String>,
    ) -> PurchaseResult<PurchaseReceipt> {
        self.checkout(
            account_id,
            &[CheckoutLine {
                catalog_item_id,
                quantity,
            }],
            delivery_info,
        )
        .await
    }

    pub async fn checkout(
        &self,
        account_id: Uuid,
        lines: &[CheckoutLine],
        delivery_info: Option<String>,
    ) -> PurchaseResult<PurchaseReceipt> {
        let lines = normalize_lines(lines)?;

        tracing::info!(
            account_id = %account_id,
            lines = lines.len(),
            "Processing checkout"
        );

        let receipt = match self.checkout_atomic(account_id, &lines, delivery_info).await {
            Ok(receipt) => receipt,
            Err(PurchaseError::PurchaseFailed(detail)) => {
                tracing::error!(
                    account_id = %account_id,
                    lines = ?lines,
                    error = %detail,
                    "Checkout failed and was rolled back"
                );
                return Err(PurchaseError::PurchaseFailed(detail));
            }
            Err(e) => {
                tracing::info!(account_id = %account_id, reason = %e, "Checkout rejected");
                return Err(e);
            }
        };

        tracing::info!(
            account_id = %account_id,
            order_number = %receipt.order_number,
            total = %receipt.total_amount,
            new_balance = %receipt.new_balance,
            "Purchase completed"
        );

        publish_committed(
            self.events.as_ref(),
            StoreEvent::PurchaseCompleted {
                account_id,
                order_id: receipt.order_id,
                order_number: receipt.order_number.clone(),
                total_amount: receipt.total_amount,
                new_balance: receipt.new_balance,
                key_count: receipt.keys.len(),
                timestamp: Utc::now(),
            },
        )
        .await;

        Ok(receipt)
    }

    async fn checkout_atomic(
        &self,
        account_id: Uuid,
        lines: &BTreeMap<Uuid, u32>,
        delivery_info: Option<String>,
    ) -> PurchaseResult<PurchaseReceipt> {
        let mut uow = self.store.begin().await?;

        // Stock is checked against the locked rows, not a pre-fetched snapshot.
        let mut reserved = Vec::with_capacity(lines.len());
        let mut total = Decimal::ZERO;
        for (&item_id, &quantity) in lines {
            let item = reserve_stock(&mut uow, item_id, quantity).await?;
            let line_total = line_amount(item.price, quantity)?;
            total = checked_money(total.checked_add(line_total))?;
            reserved.push((item, quantity, line_total));
        }

        let account = uow
            .lock_account(account_id)
            .await?
            .ok_or(PurchaseError::AccountNotFound(account_id))?;
        if !account.is_active {
            return Err(PurchaseError::AccountInactive(account_id));
        }
        if account.balance < total {
            return Err(PurchaseError::InsufficientFunds {
                required: total,
                available: account.balance,
            });
        }

        let now = Utc::now();
        let order = uow
            .insert_order(NewOrder {
                account_id,
                order_number: generate_order_number(now),
                total_amount: total,
                status: OrderStatus::Processing,
                delivery_info,
            })
            .await?;

        let mut keys = Vec::with_capacity(reserved.len());
        let mut names = Vec::with_capacity(reserved.len());
        for (item, quantity, line_total) in &reserved {
            // Validated by normalize_lines.
            let quantity = *quantity as i32;
            let line_total = *line_total;
            let order_item = uow
                .insert_order_item(NewOrderItem {
                    order_id: order.id,
                    catalog_item_id: item.id,
                    quantity,
                    unit_price: item.price,
                    line_total,
                })
                .await?;
            let key = issue_key(&mut uow, item.id, order_item.id, now).await?;
            decrement_stock(&mut uow, item, quantity).await?;

            keys.push(key.key_value);
            names.push(if quantity > 1 {
                format!("{} x{}", item.name, quantity)
            } else {
                item.name.clone()
            });
        }

        let new_balance = if total > Decimal::ZERO {
            let description = format!("Purchase {}: {}", order.order_number, names.join(", "));
            let posting = Posting::new(account_id, total, LedgerKind::Purchase, description)
                .order(Some(order.id));
            post_in(&mut uow, posting).await?.balance_after
        } else {
            account.balance
        };

        let order = uow
            .update_order_status(order.id, OrderStatus::Completed, Some(now))
            .await?;

        uow.commit().await?;

        Ok(PurchaseReceipt {
            order_id: order.id,
            order_number: order.order_number,
            total_amount: total,
            keys,
            new_balance,
        })
    }

    /// Operator refund of a completed order. Keys stay used and stock is not
    /// restored.
    pub async fn refund_order(&self, order_number: &str) -> PurchaseResult<OrderRefund> {
        let mut uow = self.store.begin().await?;

        let order = uow
            .lock_order_by_number(order_number)
            .await?
            .ok_or_else(|| PurchaseError::OrderNotFound(order_number.to_string()))?;
        if order.status != OrderStatus::Completed {
            return Err(PurchaseError::OrderNotRefundable {
                order_number: order.order_number,
                status: order.status,
            });
        }

        let order = uow
            .update_order_status(order.id, OrderStatus::Refunded, None)
            .await?;
        let new_balance = if order.total_amount > Decimal::ZERO {
            let posting = Posting::new(
                order.account_id,
                order.total_amount,
                LedgerKind::Refund,
                format!("Refund for order {}", order.order_number),
            )
            .order(Some(order.id));
            post_in(&mut uow, posting).await?.balance_after
        } else {
            uow.lock_account(order.account_id)
                .await?
                .ok_or(PurchaseError::AccountNotFound(order.account_id))?
                .balance
        };

        uow.commit().await?;

        tracing::info!(
            order_number = %order.order_number,
            account_id = %order.account_id,
            amount = %order.total_amount,
            "Order refunded"
        );

        publish_committed(
            self.events.as_ref(),
            StoreEvent::OrderRefunded {
                account_id: order.account_id,
                order_number: order.order_number.clone(),
                amount: order.total_amount,
                new_balance,
                timestamp: Utc::now(),
            },
        )
        .await;

        Ok(OrderRefund { order, new_balance })
    }

    /// Newest first.
    pub async fn orders_for_account(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> QueryResult<Paged<OrderSummary>> {
        if self.store.find_account(account_id).await?.is_none() {
            return Err(QueryError::NotFound(format!("account {}", account_id)));
        }
        let total = self.store.count_orders(account_id).await?;
        let orders = self.store.orders_for_account(account_id, page).await?;
        Ok(Paged::new(orders, page, total).map(OrderSummary::from))
    }

    /// One order of `account_id` with its lines and issued keys.
    pub async fn order_details(&self, account_id: Uuid, order_number: &str) -> QueryResult<OrderView> {
        let order = self
            .store
            .find_order_by_number(order_number)
            .await?
            .filter(|order| order.account_id == account_id)
            .ok_or_else(|| QueryError::NotFound(format!("order {}", order_number)))?;

        let items = self.store.order_items(order.id).await?;
        let mut keys_by_item: HashMap<Uuid, Vec<String>> = HashMap::new();
        for key in self.store.keys_for_order(order.id).await? {
            if let Some(order_item_id) = key.order_item_id {
                keys_by_item
                    .entry(order_item_id)
                    .or_default()
                    .push(key.key_value);
            }
        }

        Ok(OrderView {
            id: order.id,
            order_number: order.order_number,
            total_amount: order.total_amount,
            status: order.status,
            delivery_info: order.delivery_info,
            created_at: order.created_at,
            completed_at: order.completed_at,
            items: items
                .into_iter()
                .map(|item| OrderLineView {
                    keys: keys_by_item.remove(&item.id).unwrap_or_default(),
                    catalog_item_id: item.catalog_item_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    line_total: item.line_total,
                })
                .collect(),
        })
    }
}
