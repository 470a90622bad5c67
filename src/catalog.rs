//! Catalog stock and fulfillment key issuing

use crate::errors::{PurchaseError, PurchaseResult};
use crate::models::{CatalogItem, FulfillmentKey, NewFulfillmentKey};
use crate::repository::UnitOfWork;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// `SF-YYYYMMDD-XXXXXXXX`, UTC date plus 8 uppercase hex characters.
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
    format!("SF-{}-{}", now.format("%Y%m%d"), suffix)
}

/// Uppercase hyphenated v4 UUID.
pub fn generate_key_value() -> String {
    Uuid::new_v4().hyphenated().to_string().to_ascii_uppercase()
}

/// Mints a key already marked used and linked to `order_item_id`.
pub async fn issue_key<U: UnitOfWork>(
    uow: &mut U,
    catalog_item_id: Uuid,
    order_item_id: Uuid,
    now: DateTime<Utc>,
) -> PurchaseResult<FulfillmentKey> {
    let key = uow
        .insert_fulfillment_key(NewFulfillmentKey {
            catalog_item_id,
            key_value: generate_key_value(),
            order_item_id,
            used_at: now,
        })
        .await?;
    Ok(key)
}

/// Locks an item and checks it can cover `quantity` units.
pub async fn reserve_stock<U: UnitOfWork>(
    uow: &mut U,
    item_id: Uuid,
    quantity: u32,
) -> PurchaseResult<CatalogItem> {
    let item = uow
        .lock_catalog_item(item_id)
        .await?
        .filter(|item| item.is_active)
        .ok_or(PurchaseError::ItemUnavailable(item_id))?;

    if i64::from(item.stock) < i64::from(quantity) {
        return Err(PurchaseError::InsufficientStock {
            item_id,
            requested: quantity,
            available: item.stock,
        });
    }
    Ok(item)
}

/// Writes the decremented stock for an item returned by [`reserve_stock`].
pub async fn decrement_stock<U: UnitOfWork>(
    uow: &mut U,
    item: &CatalogItem,
    quantity: i32,
) -> PurchaseResult<i32> {
    let remaining = item.stock - quantity;
    if remaining < 0 {
        return Err(PurchaseError::InsufficientStock {
            item_id: item.id,
            requested: quantity.unsigned_abs(),
            available: item.stock,
        });
    }
    uow.update_stock(item.id, remaining).await?;
    Ok(remaining)
}
