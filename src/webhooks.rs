//! Webhook reconciler
//!
//! Turns provider callbacks into payment status changes. Nothing is written
//! unless the provider vouches for the callback and it matches a known
//! transaction of that provider with the same amount. Replays are harmless:
//! completion credits at most once.

use crate::errors::PaymentError;
use crate::payments::{PaymentService, ProviderFactory, WebhookHeaders};
use crate::repository::Store;

#[derive(Clone)]
pub struct WebhookReconciler<S: Store> {
    store: S,
    factory: ProviderFactory,
    payments: PaymentService<S>,
}

impl<S: Store> WebhookReconciler<S> {
    pub fn new(store: S, factory: ProviderFactory, payments: PaymentService<S>) -> Self {
        Self {
            store,
            factory,
            payments,
        }
    }

    /// Returns whether the callback was accepted.
    pub async fn handle(&self, provider_name: &str, headers: &WebhookHeaders, body: &[u8]) -> bool {
        let Some(provider) = self.factory.provider(provider_name) else {
            tracing::warn!(provider = %provider_name, "Webhook for unknown provider");
            return false;
        };

        let validation = provider.validate_webhook(headers, body).await;
        if !validation.is_valid {
            tracing::warn!(
                provider = %provider_name,
                error = ?validation.error,
                "Webhook failed validation"
            );
            return false;
        }
        let (Some(transaction_id), Some(status)) = (validation.transaction_id, validation.status) else {
            tracing::warn!(provider = %provider_name, "Webhook without transaction id or status");
            return false;
        };

        let payment = match self.store.find_payment(&transaction_id).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                tracing::warn!(
                    provider = %provider_name,
                    transaction_id = %transaction_id,
                    "Webhook for unknown transaction"
                );
                return false;
            }
            Err(e) => {
                tracing::error!(error = %e, transaction_id = %transaction_id, "Webhook lookup failed");
                return false;
            }
        };

        if !payment.provider_name.eq_ignore_ascii_case(provider.name()) {
            tracing::warn!(
                provider = %provider_name,
                transaction_id = %transaction_id,
                owner = %payment.provider_name,
                "Webhook provider does not own the transaction"
            );
            return false;
        }
        if let Some(amount) = validation.amount {
            if amount != payment.amount {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    reported = %amount,
                    expected = %payment.amount,
                    "Webhook amount mismatch"
                );
                return false;
            }
        }

        match self
            .payments
            .apply_status(&payment.transaction_id, status, "webhook")
            .await
        {
            Ok(change) => {
                tracing::info!(
                    transaction_id = %change.payment.transaction_id,
                    status = %change.payment.status,
                    credited = change.credit.is_some(),
                    "Webhook applied"
                );
                true
            }
            Err(e @ PaymentError::InvalidTransition { .. }) => {
                tracing::warn!(transaction_id = %transaction_id, error = %e, "Webhook rejected");
                false
            }
            Err(e) => {
                tracing::error!(transaction_id = %transaction_id, error = %e, "Webhook processing failed");
                false
            }
        }
    }
}
