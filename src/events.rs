use crate::errors::EventError;
use crate::models::{LedgerKind, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Storefront events announced after a unit of work commits
///
/// Events are past tense and self-contained; `account_id` is the partition key
/// so all events of one account stay ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum StoreEvent {
    #[serde(rename = "PURCHASE_COMPLETED")]
    PurchaseCompleted {
        account_id: Uuid,
        order_id: Uuid,
        order_number: String,
        total_amount: Decimal,
        new_balance: Decimal,
        key_count: usize,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "DEPOSIT_COMPLETED")]
    DepositCompleted {
        account_id: Uuid,
        transaction_id: String,
        amount: Decimal,
        new_balance: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "PAYMENT_STATUS_CHANGED")]
    PaymentStatusChanged {
        account_id: Uuid,
        transaction_id: String,
        from: PaymentStatus,
        to: PaymentStatus,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "PAYMENT_REFUNDED")]
    PaymentRefunded {
        account_id: Uuid,
        transaction_id: String,
        amount: Decimal,
        new_balance: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "ORDER_REFUNDED")]
    OrderRefunded {
        account_id: Uuid,
        order_number: String,
        amount: Decimal,
        new_balance: Decimal,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "BALANCE_ADJUSTED")]
    BalanceAdjusted {
        account_id: Uuid,
        amount: Decimal,
        kind: LedgerKind,
        reason: String,
        new_balance: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl StoreEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StoreEvent::PurchaseCompleted { .. } => "PURCHASE_COMPLETED",
            StoreEvent::DepositCompleted { .. } => "DEPOSIT_COMPLETED",
            StoreEvent::PaymentStatusChanged { .. } => "PAYMENT_STATUS_CHANGED",
            StoreEvent::PaymentRefunded { .. } => "PAYMENT_REFUNDED",
            StoreEvent::OrderRefunded { .. } => "ORDER_REFUNDED",
            StoreEvent::BalanceAdjusted { .. } => "BALANCE_ADJUSTED",
        }
    }

    pub fn account_id(&self) -> Uuid {
        match self {
            StoreEvent::PurchaseCompleted { account_id, .. }
            | StoreEvent::DepositCompleted { account_id, .. }
            | StoreEvent::PaymentStatusChanged { account_id, .. }
            | StoreEvent::PaymentRefunded { account_id, .. }
            | StoreEvent::OrderRefunded { account_id, .. }
            | StoreEvent::BalanceAdjusted { account_id, .. } => *account_id,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: StoreEvent) -> Result<(), EventError>;
}

/// Publishes after commit. The state change already happened, so a failed
/// publish is logged and swallowed.
pub async fn publish_committed(publisher: &dyn EventPublisher, event: StoreEvent) {
    let event_type = event.event_type();
    let account_id = event.account_id();
    if let Err(e) = publisher.publish(event).await {
        tracing::error!(
            error = %e,
            event_type = event_type,
            account_id = %account_id,
            "Failed to publish event after commit"
        );
    }
}

/// Kafka producer wrapper
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    pub fn new(brokers: &str, topic: String) -> Result<Self, EventError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", "snappy")
            .set("batch.size", "16384")
            .set("linger.ms", "10")
            .create()
            .map_err(|e| EventError::KafkaError(format!("Failed to create producer: {}", e)))?;

        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn publish(&self, event: StoreEvent) -> Result<(), EventError> {
        let key = event.account_id().to_string();
        let payload = serde_json::to_string(&event)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;

        tracing::info!(
            event_type = event.event_type(),
            account_id = %key,
            "Publishing event to Kafka"
        );

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok((partition, offset)) => {
                tracing::debug!(partition = partition, offset = offset, "Event published");
                Ok(())
            }
            Err((e, _)) => Err(EventError::KafkaError(format!(
                "Failed to publish event: {}",
                e
            ))),
        }
    }
}

/// Used when no brokers are configured.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: StoreEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(&event)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;
        tracing::info!(
            event_type = event.event_type(),
            account_id = %event.account_id(),
            payload = %payload,
            "Event"
        );
        Ok(())
    }
}
