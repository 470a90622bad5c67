//! Ledger / balance store
//!
//! The account balance is a denormalized running total of the account's
//! ledger entries. Every mutation goes through [`post_in`], which locks the
//! account row, computes the new balance, refuses anything that would go
//! negative and appends exactly one entry carrying `balance_after`, all inside
//! the caller's unit of work.

use crate::errors::{LedgerError, LedgerResult};
use crate::events::{publish_committed, EventPublisher, StoreEvent};
use crate::models::*;
use crate::repository::{Store, UnitOfWork};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// One balance mutation before it is applied.
#[derive(Debug, Clone)]
pub struct Posting {
    pub account_id: Uuid,
    /// Always positive; direction comes from `kind`.
    pub amount: Decimal,
    pub kind: LedgerKind,
    pub description: String,
    pub order_id: Option<Uuid>,
    pub payment_transaction_id: Option<Uuid>,
}

impl Posting {
    pub fn new(account_id: Uuid, amount: Decimal, kind: LedgerKind, description: impl Into<String>) -> Self {
        Self {
            account_id,
            amount,
            kind,
            description: description.into(),
            order_id: None,
            payment_transaction_id: None,
        }
    }

    pub fn order(mut self, order_id: Option<Uuid>) -> Self {
        self.order_id = order_id;
        self
    }

    pub fn payment(mut self, payment_id: Option<Uuid>) -> Self {
        self.payment_transaction_id = payment_id;
        self
    }

    fn is_debit(&self) -> bool {
        matches!(self.kind, LedgerKind::Purchase | LedgerKind::Withdrawal)
    }
}

fn validate_amount(amount: Decimal) -> LedgerResult<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }
    if amount > MAX_MONEY {
        return Err(LedgerError::InvalidAmount(format!(
            "Amount must not exceed {}",
            MAX_MONEY
        )));
    }
    Ok(())
}

/// Applies a posting inside an open unit of work and returns the new entry.
///
/// Purchase and Withdrawal postings debit; everything else credits.
///
/// Invariants kept here:
/// - the account row is locked before its balance is read, so two postings
///   to one account serialize instead of both reading the same old balance
/// - the balance update and the entry are written in the same unit of work,
///   so `balance == sum(entries)` holds after every commit and no rollback
///   can leave one without the other
/// - `balance_after` is stored on the entry, giving an audit trail that can
///   be checked without replaying the whole history
/// - balances never go below zero and never above [`MAX_MONEY`]
pub async fn post_in<U: UnitOfWork>(uow: &mut U, posting: Posting) -> LedgerResult<LedgerEntry> {
    validate_amount(posting.amount)?;

    let account = uow
        .lock_account(posting.account_id)
        .await?
        .ok_or(LedgerError::AccountNotFound(posting.account_id))?;

    let signed = if posting.is_debit() {
        -posting.amount
    } else {
        posting.amount
    };
    let new_balance = account
        .balance
        .checked_add(signed)
        .filter(|balance| *balance <= MAX_MONEY)
        .ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "Balance would exceed {}",
                MAX_MONEY
            ))
        })?;
    if new_balance < Decimal::ZERO {
        return Err(LedgerError::InsufficientFunds {
            required: posting.amount,
            available: account.balance,
        });
    }

    uow.update_balance(account.id, new_balance).await?;
    let entry = uow
        .insert_ledger_entry(NewLedgerEntry {
            account_id: account.id,
            amount: signed,
            kind: posting.kind,
            order_id: posting.order_id,
            payment_transaction_id: posting.payment_transaction_id,
            description: posting.description,
            balance_after: new_balance,
        })
        .await?;

    tracing::debug!(
        account_id = %account.id,
        kind = %entry.kind,
        amount = %entry.amount,
        balance_after = %new_balance,
        "Ledger entry appended"
    );

    Ok(entry)
}

/// Standalone ledger operations, each in its own unit of work
///
/// Used by operators and for seeding. Services that change other rows along
/// with the balance call [`post_in`] inside their own unit of work instead,
/// so the ledger entry commits or rolls back together with those rows.
#[derive(Clone)]
pub struct Ledger<S: Store> {
    store: S,
    events: Arc<dyn EventPublisher>,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: S, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    async fn post(&self, posting: Posting) -> LedgerResult<LedgerEntry> {
        let mut uow = self.store.begin().await?;
        let entry = post_in(&mut uow, posting).await?;
        uow.commit().await?;
        Ok(entry)
    }

    /// Debits the account; refused without any change if it would go negative.
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
        order_ref: Option<Uuid>,
    ) -> LedgerResult<Decimal> {
        let posting = Posting::new(account_id, amount, LedgerKind::Withdrawal, description).order(order_ref);
        Ok(self.post(posting).await?.balance_after)
    }

    /// Credits as a Deposit, optionally linked to the payment it came from.
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
        source_ref: Option<Uuid>,
    ) -> LedgerResult<Decimal> {
        let posting = Posting::new(account_id, amount, LedgerKind::Deposit, description).payment(source_ref);
        Ok(self.post(posting).await?.balance_after)
    }

    pub async fn refund(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
        order_ref: Option<Uuid>,
    ) -> LedgerResult<Decimal> {
        let posting = Posting::new(account_id, amount, LedgerKind::Refund, description).order(order_ref);
        Ok(self.post(posting).await?.balance_after)
    }

    /// Operator correction: positive amounts are a Bonus credit, negative a
    /// Withdrawal debit.
    pub async fn adjust_balance(
        &self,
        account_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> LedgerResult<LedgerEntry> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount(
                "Adjustment amount must not be zero".to_string(),
            ));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::InvalidAmount(
                "Adjustment requires a reason".to_string(),
            ));
        }

        let kind = if amount > Decimal::ZERO {
            LedgerKind::Bonus
        } else {
            LedgerKind::Withdrawal
        };
        let description = format!("Manual adjustment: {}", reason);
        let entry = self
            .post(Posting::new(account_id, amount.abs(), kind, description))
            .await?;

        tracing::info!(
            account_id = %account_id,
            amount = %amount,
            new_balance = %entry.balance_after,
            "Balance adjusted"
        );

        publish_committed(
            self.events.as_ref(),
            StoreEvent::BalanceAdjusted {
                account_id,
                amount: entry.amount,
                kind,
                reason: reason.to_string(),
                new_balance: entry.balance_after,
                timestamp: Utc::now(),
            },
        )
        .await;

        Ok(entry)
    }

    /// Newest first.
    pub async fn history(&self, account_id: Uuid, limit: u32) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .store
            .ledger_entries(account_id, Page::first(limit))
            .await?)
    }

    pub async fn entries(&self, account_id: Uuid, page: Page) -> LedgerResult<Paged<LedgerEntry>> {
        if self.store.find_account(account_id).await?.is_none() {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        let total = self.store.count_ledger_entries(account_id).await?;
        let items = self.store.ledger_entries(account_id, page).await?;
        Ok(Paged::new(items, page, total))
    }

    /// True when the stored balance equals the sum of the account's entries.
    pub async fn verify_balance(&self, account_id: Uuid) -> LedgerResult<bool> {
        let account = self
            .store
            .find_account(account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        let total = self.store.ledger_total(account_id).await?;
        if total != account.balance {
            tracing::error!(
                account_id = %account_id,
                balance = %account.balance,
                ledger_total = %total,
                "Balance diverged from ledger"
            );
        }
        Ok(total == account.balance)
    }
}
