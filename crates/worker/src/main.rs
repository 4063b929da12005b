use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use docevents_engine::{
    DocumentEventRepository, EntityChangeEvent, EventTypeRegistry, PostgresDocumentEventStore,
    StringEvent,
};
use docevents_worker::{LoggingPublisher, PublishWorker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG: Log filter (takes precedence)
    // - LOG_LEVEL: Level for the docevents crates (default: "info")
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!(
            "docevents_worker={log_level},docevents_engine={log_level}"
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("docevents-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid configuration")?;

    tracing::info!(
        worker_id = %config.worker_id,
        batch_size = config.repository.batch_size,
        max_events = config.repository.max_events_per_retrieval,
        lease_ttl_ms = config.repository.lease.ttl.as_millis() as u64,
        "Starting publish worker"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = Arc::new(PostgresDocumentEventStore::new(pool));
    store.migrate().await.context("Failed to apply migrations")?;

    let registry = EventTypeRegistry::new()
        .with::<StringEvent>()
        .with::<EntityChangeEvent>();
    let repository = Arc::new(DocumentEventRepository::new(
        store.clone(),
        store,
        Arc::new(registry),
        config.repository.clone(),
    ));

    let mut worker = PublishWorker::new(&config, repository, Arc::new(LoggingPublisher));

    // Run the worker (blocks until shutdown)
    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            worker.shutdown();
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
