use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use storefront_service::config::AppConfig;
use storefront_service::events::{EventPublisher, KafkaProducer, LogPublisher};
use storefront_service::handlers::{router, AppState};
use storefront_service::payments::{ProviderFactory, TestProvider};
use storefront_service::repository::{MemoryStore, PgStore, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn build_app<S: Store>(store: S, config: &AppConfig, events: Arc<dyn EventPublisher>) -> Router {
    // Enabled flags and priorities are re-read from the store on every resolution.
    let factory = ProviderFactory::new(Arc::new(store.clone()))
        .register(Arc::new(TestProvider::new(config.test_provider.clone())));

    router(AppState::new(store, factory, events, config.deposits.clone()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    tracing::info!("Starting Storefront Service");
    for warning in config.insecure_settings() {
        tracing::warn!("{}", warning);
    }

    let events: Arc<dyn EventPublisher> = match &config.kafka_brokers {
        Some(brokers) => {
            tracing::info!(brokers = %brokers, topic = %config.kafka_topic, "Initializing Kafka producer");
            Arc::new(KafkaProducer::new(brokers, config.kafka_topic.clone())?)
        }
        None => {
            tracing::warn!("KAFKA_BROKERS not set, events will only be logged");
            Arc::new(LogPublisher)
        }
    };

    let app = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(database_url)
                .await?;

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Migrations completed successfully");

            build_app(PgStore::new(pool), &config, events)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store; data is lost on exit");
            build_app(MemoryStore::new(), &config, events)
        }
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Storefront Service listening on {}", addr);
    tracing::info!("  POST   /accounts/:account_id/purchases  - Buy one item");
    tracing::info!("  POST   /accounts/:account_id/checkout   - Buy several items");
    tracing::info!("  POST   /accounts/:account_id/deposits   - Top up balance");
    tracing::info!("  POST   /api/webhooks/:provider_name     - Provider callbacks");
    tracing::info!("  GET    /health                          - Health check");

    axum::serve(listener, app).await?;

    Ok(())
}
