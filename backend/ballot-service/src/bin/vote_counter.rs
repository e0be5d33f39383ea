//! vote-counter: Kafka `votes` topic -> in-memory aggregate -> Postgres

use anyhow::{Context, Result};
use ballot_service::config::Config;
use ballot_service::consumers::VoteConsumer;
use ballot_service::logging::init_tracing;
use ballot_service::repository::{PollRepository, PollStore};
use ballot_service::services::AggregateCounter;
use ballot_service::shutdown::{coordinate_consumption, shutdown_signal};
use ballot_service::workers::Flusher;
use db_pool::{create_pool, DbConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SERVICE_NAME: &str = "vote-counter";

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded .env"),
        Err(e) => debug!(error = %e, "No .env loaded, using process environment"),
    }

    info!("Starting {}", SERVICE_NAME);

    let config = Config::from_env().context("Failed to load configuration")?;
    debug!(?config, "Configuration loaded");

    let db_config = DbConfig::for_service(SERVICE_NAME)
        .map_err(anyhow::Error::msg)
        .context("Invalid database configuration")?;
    db_config.log_config();
    let pool = create_pool(db_config)
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let store: Arc<dyn PollStore> = Arc::new(PollRepository::new(pool.clone(), SERVICE_NAME));
    let counter = Arc::new(AggregateCounter::new());

    let consumer = VoteConsumer::connect(&config.kafka, Arc::clone(&counter))
        .await
        .context("Failed to connect to Kafka")?;

    let flusher = Flusher::new(Arc::clone(&counter), store, config.flusher.clone()).spawn();
    let consumer = consumer.spawn();
    info!("{} running", SERVICE_NAME);

    let outcome = coordinate_consumption(
        shutdown_signal(),
        flusher,
        consumer,
        config.flusher.final_flush,
    )
    .await;

    if let Some(report) = &outcome.final_flush {
        info!(
            persisted = report.persisted,
            votes = report.votes_persisted,
            settled = report.settled,
            "Final flush complete"
        );
    }
    let unpersisted = counter.pending().await;
    if !unpersisted.is_empty() {
        warn!(?unpersisted, "Exiting with votes that were never persisted");
    }

    pool.close().await;
    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
