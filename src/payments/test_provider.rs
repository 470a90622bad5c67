use super::{
    CreatedPayment, PaymentProvider, PaymentRequest, PaymentStatusResult, ProviderFailure,
    RefundReceipt, WebhookHeaders, WebhookValidationResult,
};
use crate::models::{PaymentMethod, PaymentStatus};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase header carrying the hex HMAC-SHA256 of the raw webhook body.
pub const SIGNATURE_HEADER: &str = "x-test-signature";

const SUPPORTED_METHODS: [PaymentMethod; 4] = [
    PaymentMethod::Card,
    PaymentMethod::Sbp,
    PaymentMethod::YooMoney,
    PaymentMethod::Balance,
];

#[derive(Debug, Clone)]
pub struct TestProviderSettings {
    pub enabled: bool,
    /// Report payments as Completed right away instead of waiting for a webhook.
    pub auto_complete: bool,
    pub webhook_secret: Option<String>,
}

impl Default for TestProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_complete: true,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TestWebhookBody {
    transaction_id: String,
    status: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    amount: Option<Decimal>,
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_webhook_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// In-process provider for development and tests
///
/// Keeps the status of every payment it created so status polling works.
pub struct TestProvider {
    settings: TestProviderSettings,
    payments: Mutex<HashMap<String, (PaymentStatus, Decimal)>>,
}

impl TestProvider {
    pub fn new(settings: TestProviderSettings) -> Self {
        Self {
            settings,
            payments: Mutex::new(HashMap::new()),
        }
    }

    /// Simulates the provider moving a payment to `status` on its side.
    ///
    /// Webhooks never change what this provider reports; only this and
    /// [`refund`](PaymentProvider::refund) do.
    pub async fn settle(&self, transaction_id: &str, status: PaymentStatus) -> bool {
        match self.payments.lock().await.get_mut(transaction_id) {
            Some(entry) => {
                entry.0 = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PaymentProvider for TestProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn display_name(&self) -> &str {
        "Test provider"
    }

    fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn supported_methods(&self) -> &[PaymentMethod] {
        &SUPPORTED_METHODS
    }

    fn supports_refund(&self) -> bool {
        true
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment, ProviderFailure> {
        tracing::info!(
            account_id = %request.account_id,
            amount = %request.amount,
            currency = %request.currency,
            "Test provider: creating payment"
        );

        if request.amount <= Decimal::ZERO {
            return Err(ProviderFailure::user_facing("Amount must be greater than 0").with_code("amount"));
        }

        let now = Utc::now();
        let transaction_id: String = format!(
            "TEST-{}-{}",
            now.format("%Y%m%d%H%M%S"),
            Uuid::new_v4().simple()
        )
        .chars()
        .take(32)
        .collect();
        let provider_transaction_id: String = format!("PROV-{}", Uuid::new_v4().simple())
            .chars()
            .take(20)
            .collect();

        let status = if self.settings.auto_complete {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Pending
        };
        self.payments
            .lock()
            .await
            .insert(transaction_id.clone(), (status, request.amount));

        Ok(CreatedPayment {
            transaction_id,
            provider_transaction_id: Some(provider_transaction_id),
            redirect_url: request.success_url.clone(),
            status,
            provider_data: Some(json!({
                "test_mode": true,
                "auto_approved": self.settings.auto_complete,
            })),
        })
    }

    async fn payment_status(&self, transaction_id: &str) -> Result<PaymentStatusResult, ProviderFailure> {
        let payments = self.payments.lock().await;
        let (status, amount) = payments
            .get(transaction_id)
            .copied()
            .ok_or_else(|| ProviderFailure::new(format!("Unknown transaction {}", transaction_id)).with_code("not_found"))?;

        Ok(PaymentStatusResult {
            transaction_id: transaction_id.to_string(),
            status,
            amount: Some(amount),
            message: Some("Test payment".to_string()),
        })
    }

    async fn validate_webhook(&self, headers: &WebhookHeaders, body: &[u8]) -> WebhookValidationResult {
        if let Some(secret) = &self.settings.webhook_secret {
            let Some(signature) = headers.get(SIGNATURE_HEADER) else {
                tracing::warn!("Test provider: webhook without signature");
                return WebhookValidationResult::invalid("Missing signature");
            };
            if !verify_signature(secret, body, signature) {
                tracing::warn!("Test provider: invalid webhook signature");
                return WebhookValidationResult::invalid("Invalid signature");
            }
        }

        let parsed: TestWebhookBody = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(e) => return WebhookValidationResult::invalid(format!("Malformed body: {}", e)),
        };
        let status = match parsed.status.parse::<PaymentStatus>() {
            Ok(status) => status,
            Err(e) => return WebhookValidationResult::invalid(e),
        };

        WebhookValidationResult::valid(parsed.transaction_id, status, parsed.amount)
    }

    async fn refund(&self, transaction_id: &str, amount: Option<Decimal>) -> Result<RefundReceipt, ProviderFailure> {
        tracing::info!(
            transaction_id = %transaction_id,
            amount = ?amount,
            "Test provider: refunding"
        );

        if let Some(entry) = self.payments.lock().await.get_mut(transaction_id) {
            entry.0 = PaymentStatus::Refunded;
        }

        let refund_id: String = format!(
            "REFUND-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            Uuid::new_v4().simple()
        )
        .chars()
        .take(32)
        .collect();

        Ok(RefundReceipt { refund_id, amount })
    }
}
