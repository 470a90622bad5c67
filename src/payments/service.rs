use super::{PaymentProvider, PaymentRequest, PaymentStatusResult, ProviderFactory, ProviderFailure};
use crate::errors::{PaymentError, PaymentResult};
use crate::events::{publish_committed, EventPublisher, StoreEvent};
use crate::ledger::{post_in, Posting};
use crate::models::*;
use crate::repository::{Store, UnitOfWork};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DepositSettings {
    /// Deposits above this are rejected before any provider call.
    pub max_amount: Decimal,
    pub currency: String,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
    pub provider_timeout: Duration,
}

impl Default for DepositSettings {
    fn default() -> Self {
        Self {
            max_amount: Decimal::from(100_000),
            currency: "RUB".to_string(),
            success_url: Some("/account/deposit?success=true".to_string()),
            cancel_url: Some("/account/deposit?cancelled=true".to_string()),
            provider_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepositReceipt {
    pub transaction_id: String,
    pub redirect_url: Option<String>,
    pub status: PaymentStatus,
    /// Set when the deposit was credited synchronously.
    pub new_balance: Option<Decimal>,
}

/// Result of applying a status to a payment
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub payment: PaymentTransaction,
    pub previous: PaymentStatus,
    /// The deposit credit written by this call, if any.
    pub credit: Option<LedgerEntry>,
}

#[derive(Debug, Clone)]
pub struct PaymentRefund {
    pub payment: PaymentTransaction,
    pub refund_id: String,
    pub amount: Decimal,
    pub new_balance: Decimal,
}

fn deposit_description(transaction_id: &str) -> String {
    format!("Balance top-up [{}]", transaction_id)
}

/// Moves a locked payment to Completed and credits it exactly once.
///
/// A payment already Completed with its deposit entry present is left alone;
/// one Completed without the entry gets credited now.
async fn complete_locked<U: UnitOfWork>(
    uow: &mut U,
    mut payment: PaymentTransaction,
) -> PaymentResult<(PaymentTransaction, Option<LedgerEntry>)> {
    match payment.status {
        PaymentStatus::Completed => {
            if uow
                .ledger_entry_exists(payment.id, LedgerKind::Deposit)
                .await?
            {
                return Ok((payment, None));
            }
            tracing::warn!(
                transaction_id = %payment.transaction_id,
                "Completed payment had no deposit entry, crediting now"
            );
        }
        PaymentStatus::Pending | PaymentStatus::Processing => {
            let now = Utc::now();
            payment.status = PaymentStatus::Completed;
            payment.completed_at = Some(now);
            payment.updated_at = now;
            uow.save_payment(&payment).await?;
        }
        from => {
            return Err(PaymentError::InvalidTransition {
                from,
                to: PaymentStatus::Completed,
            })
        }
    }

    let posting = Posting::new(
        payment.account_id,
        payment.amount,
        LedgerKind::Deposit,
        deposit_description(&payment.transaction_id),
    )
    .payment(Some(payment.id))
    .order(payment.order_id);
    let entry = post_in(uow, posting).await?;

    Ok((payment, Some(entry)))
}

/// Locks the payment and its account and checks that `amount` can be
/// refunded: the payment is Completed, the amount is within it, and the
/// account still holds it. Lock order is payment, then account.
async fn check_refundable<U: UnitOfWork>(
    uow: &mut U,
    transaction_id: &str,
    amount: Decimal,
) -> PaymentResult<PaymentTransaction> {
    let payment = uow
        .lock_payment(transaction_id)
        .await?
        .ok_or_else(|| PaymentError::TransactionNotFound(transaction_id.to_string()))?;
    if !payment.status.can_transition_to(PaymentStatus::Refunded) {
        return Err(PaymentError::InvalidTransition {
            from: payment.status,
            to: PaymentStatus::Refunded,
        });
    }
    if amount <= Decimal::ZERO || amount > payment.amount {
        return Err(PaymentError::InvalidAmount(format!(
            "Refund amount must be greater than 0 and at most {}",
            payment.amount
        )));
    }

    let account = uow
        .lock_account(payment.account_id)
        .await?
        .ok_or(PaymentError::AccountNotFound(payment.account_id))?;
    if account.balance < amount {
        return Err(PaymentError::InsufficientFunds {
            required: amount,
            available: account.balance,
        });
    }
    Ok(payment)
}

async fn finish_refund<U: UnitOfWork>(
    mut uow: U,
    posting: Posting,
    payment: &PaymentTransaction,
) -> PaymentResult<LedgerEntry> {
    let entry = post_in(&mut uow, posting).await?;
    uow.save_payment(payment).await?;
    uow.commit().await?;
    Ok(entry)
}

/// Payment orchestrator: deposits, completion, status changes and refunds
///
/// Key design decisions:
/// - provider calls never run inside a unit of work; a slow provider must not
///   hold row locks (or the whole in-memory store) while it answers
/// - every status change goes through [`apply_status`](Self::apply_status),
///   which locks the payment row first, so webhooks, polling and operators
///   see one consistent state machine
/// - the deposit credit is keyed by payment id, so completion is idempotent
///   however many times a callback is replayed
/// - lock order is payment, then account
#[derive(Clone)]
pub struct PaymentService<S: Store> {
    store: S,
    factory: ProviderFactory,
    events: Arc<dyn EventPublisher>,
    settings: DepositSettings,
    /// Transaction ids with a provider refund call outstanding.
    refunds_in_flight: Arc<Mutex<HashSet<String>>>,
}

impl<S: Store> PaymentService<S> {
    pub fn new(
        store: S,
        factory: ProviderFactory,
        events: Arc<dyn EventPublisher>,
        settings: DepositSettings,
    ) -> Self {
        Self {
            store,
            factory,
            events,
            settings,
            refunds_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn factory(&self) -> &ProviderFactory {
        &self.factory
    }

    /// Runs a provider call under the configured timeout.
    async fn call_provider<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderFailure>>,
    ) -> PaymentResult<T> {
        match tokio::time::timeout(self.settings.provider_timeout, call).await {
            Ok(result) => result.map_err(PaymentError::from),
            Err(_) => Err(PaymentError::ProviderError {
                message: format!(
                    "Provider did not answer within {}s",
                    self.settings.provider_timeout.as_secs()
                ),
                code: Some("timeout".to_string()),
                user_safe: false,
            }),
        }
    }

    pub async fn create_deposit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        method: PaymentMethod,
        client_ip: Option<String>,
    ) -> PaymentResult<DepositReceipt> {
        if amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(
                "Deposit amount must be greater than 0".to_string(),
            ));
        }
        if amount > self.settings.max_amount {
            return Err(PaymentError::InvalidAmount(format!(
                "Deposit amount must not exceed {}",
                self.settings.max_amount
            )));
        }

        if self.store.find_account(account_id).await?.is_none() {
            return Err(PaymentError::AccountNotFound(account_id));
        }

        let resolved = self
            .factory
            .provider_for_method(method)
            .await?
            .ok_or(PaymentError::MethodUnavailable(method))?;
        if !resolved.amount_in_range(amount) {
            return Err(PaymentError::InvalidAmount(format!(
                "Amount {} is outside the limits of the selected payment method",
                amount
            )));
        }
        let provider = resolved.provider;

        tracing::info!(
            account_id = %account_id,
            amount = %amount,
            method = %method,
            provider = provider.name(),
            "Creating deposit"
        );

        let request = PaymentRequest {
            account_id,
            amount,
            currency: self.settings.currency.clone(),
            method,
            order_id: None,
            description: "Balance top-up".to_string(),
            success_url: self.settings.success_url.clone(),
            cancel_url: self.settings.cancel_url.clone(),
            client_ip: client_ip.clone(),
            metadata: None,
        };
        let created = self.call_provider(provider.create_payment(&request)).await?;

        let mut uow = self.store.begin().await?;
        let payment = uow
            .insert_payment(NewPaymentTransaction {
                transaction_id: created.transaction_id.clone(),
                provider_transaction_id: created.provider_transaction_id.clone(),
                account_id,
                order_id: None,
                provider_name: provider.name().to_string(),
                method,
                amount,
                currency: request.currency.clone(),
                status: created.status,
                description: Some(request.description.clone()),
                client_ip,
                provider_data: created.provider_data.clone(),
                metadata: None,
            })
            .await?;

        let (payment, credit) = if created.status == PaymentStatus::Completed {
            complete_locked(&mut uow, payment).await?
        } else {
            (payment, None)
        };
        uow.commit().await?;

        tracing::info!(
            transaction_id = %payment.transaction_id,
            status = %payment.status,
            "Deposit created"
        );

        if let Some(entry) = &credit {
            self.announce_credit(&payment, entry).await;
        }

        Ok(DepositReceipt {
            transaction_id: payment.transaction_id,
            redirect_url: created.redirect_url,
            status: payment.status,
            new_balance: credit.map(|entry| entry.balance_after),
        })
    }

    /// Idempotent: a completed payment is credited exactly once no matter how
    /// often this runs.
    pub async fn complete_payment(&self, transaction_id: &str) -> PaymentResult<StatusChange> {
        self.apply_status(transaction_id, PaymentStatus::Completed, "completion")
            .await
    }

    /// Single entry point for status changes from webhooks, polling and
    /// operators.
    ///
    /// Re-applying the current status is a no-op. Refunded is only reachable
    /// through [`refund_payment`](Self::refund_payment).
    pub async fn apply_status(
        &self,
        transaction_id: &str,
        status: PaymentStatus,
        source: &str,
    ) -> PaymentResult<StatusChange> {
        let mut uow = self.store.begin().await?;
        let payment = uow
            .lock_payment(transaction_id)
            .await?
            .ok_or_else(|| PaymentError::TransactionNotFound(transaction_id.to_string()))?;
        let previous = payment.status;

        let (payment, credit) = if status == PaymentStatus::Completed {
            complete_locked(&mut uow, payment).await?
        } else if status == previous {
            (payment, None)
        } else if status == PaymentStatus::Refunded || !previous.can_transition_to(status) {
            return Err(PaymentError::InvalidTransition {
                from: previous,
                to: status,
            });
        } else {
            let mut payment = payment;
            let now = Utc::now();
            payment.status = status;
            payment.updated_at = now;
            if status.is_finalized() {
                payment.completed_at = Some(now);
            }
            uow.save_payment(&payment).await?;
            (payment, None)
        };

        uow.commit().await?;

        if previous != payment.status {
            tracing::info!(
                transaction_id = %payment.transaction_id,
                from = %previous,
                to = %payment.status,
                source = source,
                "Payment status changed"
            );
            publish_committed(
                self.events.as_ref(),
                StoreEvent::PaymentStatusChanged {
                    account_id: payment.account_id,
                    transaction_id: payment.transaction_id.clone(),
                    from: previous,
                    to: payment.status,
                    timestamp: Utc::now(),
                },
            )
            .await;
        } else {
            tracing::debug!(
                transaction_id = %payment.transaction_id,
                status = %payment.status,
                source = source,
                "Payment status unchanged"
            );
        }
        if let Some(entry) = &credit {
            self.announce_credit(&payment, entry).await;
        }

        Ok(StatusChange {
            payment,
            previous,
            credit,
        })
    }

    async fn announce_credit(&self, payment: &PaymentTransaction, entry: &LedgerEntry) {
        tracing::info!(
            transaction_id = %payment.transaction_id,
            account_id = %payment.account_id,
            amount = %payment.amount,
            new_balance = %entry.balance_after,
            "Deposit credited"
        );
        publish_committed(
            self.events.as_ref(),
            StoreEvent::DepositCompleted {
                account_id: payment.account_id,
                transaction_id: payment.transaction_id.clone(),
                amount: payment.amount,
                new_balance: entry.balance_after,
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Locally persisted status.
    pub async fn payment_status(&self, transaction_id: &str) -> PaymentResult<PaymentStatusResult> {
        let payment = self
            .store
            .find_payment(transaction_id)
            .await?
            .ok_or_else(|| PaymentError::TransactionNotFound(transaction_id.to_string()))?;
        Ok(PaymentStatusResult {
            transaction_id: payment.transaction_id,
            status: payment.status,
            amount: Some(payment.amount),
            message: payment.error_message,
        })
    }

    pub async fn find_payment(&self, transaction_id: &str) -> PaymentResult<PaymentTransaction> {
        self.store
            .find_payment(transaction_id)
            .await?
            .ok_or_else(|| PaymentError::TransactionNotFound(transaction_id.to_string()))
    }

    /// Polls the provider and applies what it reports.
    pub async fn refresh_payment_status(&self, transaction_id: &str) -> PaymentResult<PaymentStatusResult> {
        let payment = self.find_payment(transaction_id).await?;
        let provider = self
            .factory
            .provider(&payment.provider_name)
            .ok_or_else(|| PaymentError::UnknownProvider(payment.provider_name.clone()))?;

        let remote = self
            .call_provider(provider.payment_status(&payment.transaction_id))
            .await?;
        if let Some(amount) = remote.amount {
            if amount != payment.amount {
                tracing::warn!(
                    transaction_id = %payment.transaction_id,
                    reported = %amount,
                    expected = %payment.amount,
                    "Provider status amount mismatch, keeping local status"
                );
                return self.payment_status(&payment.transaction_id).await;
            }
        }
        // A webhook may have moved the payment ahead of what the provider
        // reports; only forward transitions are applied. Refunded is left to
        // refund_payment, which also debits the account.
        if remote.status != payment.status
            && remote.status != PaymentStatus::Refunded
            && payment.status.can_transition_to(remote.status)
        {
            self.apply_status(&payment.transaction_id, remote.status, "refresh")
                .await?;
        } else if remote.status != payment.status {
            tracing::debug!(
                transaction_id = %payment.transaction_id,
                local = %payment.status,
                remote = %remote.status,
                "Provider status not applied, keeping local status"
            );
        }

        self.payment_status(&payment.transaction_id).await
    }

    /// Operator override through the regular transition rules.
    pub async fn admin_set_payment_status(
        &self,
        transaction_id: &str,
        status: PaymentStatus,
    ) -> PaymentResult<StatusChange> {
        tracing::info!(
            transaction_id = %transaction_id,
            status = %status,
            "Operator payment status change"
        );
        self.apply_status(transaction_id, status, "admin").await
    }

    /// Refunds a completed payment through its provider and debits the
    /// refunded amount back from the account.
    ///
    /// The provider is called with no store lock held. Preconditions are
    /// checked in a short read-only unit of work, then checked again under
    /// fresh locks before the debit is posted. Only one refund per payment
    /// may be in flight in this process at a time.
    pub async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Option<Decimal>,
    ) -> PaymentResult<PaymentRefund> {
        let snapshot = self.find_payment(transaction_id).await?;
        let provider = self
            .factory
            .provider(&snapshot.provider_name)
            .ok_or_else(|| PaymentError::UnknownProvider(snapshot.provider_name.clone()))?;
        if !provider.supports_refund() {
            return Err(PaymentError::RefundNotSupported(snapshot.provider_name));
        }

        let key = snapshot.transaction_id.clone();
        if !self.refunds_in_flight.lock().await.insert(key.clone()) {
            return Err(PaymentError::RefundInProgress(key));
        }
        let result = self.refund_unlocked(snapshot, provider, amount).await;
        self.refunds_in_flight.lock().await.remove(&key);
        result
    }

    async fn refund_unlocked(
        &self,
        snapshot: PaymentTransaction,
        provider: Arc<dyn PaymentProvider>,
        amount: Option<Decimal>,
    ) -> PaymentResult<PaymentRefund> {
        let refund_amount = amount.unwrap_or(snapshot.amount);
        {
            // Dropped without commit: nothing is written here.
            let mut uow = self.store.begin().await?;
            check_refundable(&mut uow, &snapshot.transaction_id, refund_amount).await?;
        }

        let receipt = self
            .call_provider(provider.refund(&snapshot.transaction_id, Some(refund_amount)))
            .await?;

        let result = async {
            let mut uow = self.store.begin().await?;
            let mut payment =
                check_refundable(&mut uow, &snapshot.transaction_id, refund_amount).await?;
            let posting = Posting::new(
                payment.account_id,
                refund_amount,
                LedgerKind::Withdrawal,
                format!(
                    "Refund of top-up [{}] ({})",
                    payment.transaction_id, receipt.refund_id
                ),
            )
            .payment(Some(payment.id));
            payment.status = PaymentStatus::Refunded;
            payment.updated_at = Utc::now();
            let entry = finish_refund(uow, posting, &payment).await?;
            Ok::<_, PaymentError>((payment, entry))
        }
        .await;

        let (payment, entry) = match result {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(
                    transaction_id = %snapshot.transaction_id,
                    refund_id = %receipt.refund_id,
                    amount = %refund_amount,
                    error = %e,
                    "Provider refunded but the local refund was rolled back"
                );
                return Err(e);
            }
        };

        tracing::info!(
            transaction_id = %payment.transaction_id,
            refund_id = %receipt.refund_id,
            amount = %refund_amount,
            new_balance = %entry.balance_after,
            "Payment refunded"
        );

        publish_committed(
            self.events.as_ref(),
            StoreEvent::PaymentRefunded {
                account_id: payment.account_id,
                transaction_id: payment.transaction_id.clone(),
                amount: refund_amount,
                new_balance: entry.balance_after,
                timestamp: payment.updated_at,
            },
        )
        .await;

        Ok(PaymentRefund {
            payment,
            refund_id: receipt.refund_id,
            amount: refund_amount,
            new_balance: entry.balance_after,
        })
    }
}
