//! Shared fixtures for the in-memory integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storefront_service::errors::EventError;
use storefront_service::events::{EventPublisher, StoreEvent};
use storefront_service::ledger::Ledger;
use storefront_service::models::*;
use storefront_service::payments::{
    CreatedPayment, DepositSettings, PaymentProvider, PaymentRequest, PaymentService,
    PaymentStatusResult, ProviderFactory, ProviderFailure, RefundReceipt, TestProvider,
    TestProviderSettings, WebhookHeaders, WebhookValidationResult,
};
use storefront_service::purchase::PurchaseService;
use storefront_service::repository::{MemoryStore, Store};
use storefront_service::webhooks::WebhookReconciler;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Keeps every published event for assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<StoreEvent>>,
}

impl RecordingPublisher {
    pub async fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: StoreEvent) -> Result<(), EventError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Wraps the test provider and counts calls made to it.
pub struct SpyProvider {
    pub inner: TestProvider,
    pub create_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
    /// Milliseconds each refund call sleeps before answering.
    pub refund_delay_ms: AtomicU64,
}

impl SpyProvider {
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    pub fn slow_refunds(&self, delay: Duration) {
        self.refund_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentProvider for SpyProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn display_name(&self) -> &str {
        self.inner.display_name()
    }
    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }
    fn supported_methods(&self) -> &[PaymentMethod] {
        self.inner.supported_methods()
    }
    fn supports_refund(&self) -> bool {
        self.inner.supports_refund()
    }
    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment, ProviderFailure> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_payment(request).await
    }
    async fn payment_status(&self, transaction_id: &str) -> Result<PaymentStatusResult, ProviderFailure> {
        self.inner.payment_status(transaction_id).await
    }
    async fn validate_webhook(&self, headers: &WebhookHeaders, body: &[u8]) -> WebhookValidationResult {
        self.inner.validate_webhook(headers, body).await
    }
    async fn refund(&self, transaction_id: &str, amount: Option<Decimal>) -> Result<RefundReceipt, ProviderFailure> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.refund_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.refund(transaction_id, amount).await
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub events: Arc<RecordingPublisher>,
    pub provider: Arc<SpyProvider>,
    pub factory: ProviderFactory,
    pub ledger: Ledger<MemoryStore>,
    pub purchases: PurchaseService<MemoryStore>,
    pub payments: PaymentService<MemoryStore>,
    pub webhooks: WebhookReconciler<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(TestProviderSettings::default())
    }

    /// Deposits stay Pending until a webhook arrives.
    pub fn pending_deposits() -> Self {
        Self::with_provider(TestProviderSettings {
            auto_complete: false,
            ..TestProviderSettings::default()
        })
    }

    pub fn with_provider(settings: TestProviderSettings) -> Self {
        let store = MemoryStore::new();
        let events = Arc::new(RecordingPublisher::default());
        let provider = Arc::new(SpyProvider {
            inner: TestProvider::new(settings),
            create_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
            refund_delay_ms: AtomicU64::new(0),
        });
        let factory = ProviderFactory::new(Arc::new(store.clone())).register(provider.clone());
        let payments = PaymentService::new(
            store.clone(),
            factory.clone(),
            events.clone(),
            DepositSettings::default(),
        );

        Self {
            ledger: Ledger::new(store.clone(), events.clone()),
            purchases: PurchaseService::new(store.clone(), events.clone()),
            webhooks: WebhookReconciler::new(store.clone(), factory.clone(), payments.clone()),
            payments,
            factory,
            provider,
            events,
            store,
        }
    }

    /// Active account funded through a ledger credit, so balance and ledger agree.
    pub async fn account_with_balance(&self, balance: Decimal) -> Account {
        let account = self.store.create_account(Some("buyer@example.com")).await.unwrap();
        if balance > Decimal::ZERO {
            self.ledger
                .credit(account.id, balance, "Initial funding", None)
                .await
                .unwrap();
        }
        self.store.find_account(account.id).await.unwrap().unwrap()
    }

    pub async fn item(&self, price: Decimal, stock: i32) -> CatalogItem {
        self.store
            .create_catalog_item(NewCatalogItem {
                name: "Steam Gift Card".to_string(),
                price,
                stock,
                is_active: true,
            })
            .await
            .unwrap()
    }

    pub async fn balance(&self, account_id: Uuid) -> Decimal {
        self.store.find_account(account_id).await.unwrap().unwrap().balance
    }

    pub async fn stock(&self, item_id: Uuid) -> i32 {
        self.store.find_catalog_item(item_id).await.unwrap().unwrap().stock
    }

    pub async fn ledger_count(&self, account_id: Uuid) -> usize {
        self.store.all_ledger_entries(account_id).await.len()
    }

    /// Balance equals the sum of the account's ledger entries.
    pub async fn assert_balance_matches_ledger(&self, account_id: Uuid) {
        let sum: Decimal = self
            .store
            .all_ledger_entries(account_id)
            .await
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(self.balance(account_id).await, sum, "balance diverged from ledger");
        assert!(self.ledger.verify_balance(account_id).await.unwrap());
    }
}
