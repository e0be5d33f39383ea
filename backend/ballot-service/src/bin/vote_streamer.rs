//! vote-streamer: Mastodon public timeline -> matched votes -> Kafka `votes` topic

use anyhow::{Context, Result};
use ballot_service::config::{Config, MastodonConfig};
use ballot_service::logging::init_tracing;
use ballot_service::repository::{PollRepository, PollStore};
use ballot_service::services::{KafkaVoteSink, MastodonClient, StreamFilter, VotePublisher};
use ballot_service::shutdown::{coordinate_production, shutdown_signal};
use db_pool::{create_pool, DbConfig};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

const SERVICE_NAME: &str = "vote-streamer";

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
    let mastodon = MastodonConfig::from_env().context("Failed to load Mastodon configuration")?;
    debug!(?config, ?mastodon, "Configuration loaded");

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

    let sink = KafkaVoteSink::connect(&config.kafka, &config.publisher)
        .await
        .context("Failed to connect to Kafka")?;
    let client = MastodonClient::connect(&mastodon)
        .await
        .context("Failed to connect to Mastodon")?;

    let (votes_tx, votes_rx) = mpsc::channel(config.publisher.channel_capacity);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let publisher_done = VotePublisher::new(Arc::new(sink), &config.publisher).spawn(votes_rx);
    let filter_done = StreamFilter::new(store, Arc::new(client)).spawn(votes_tx, cancel_rx);
    info!("{} running", SERVICE_NAME);

    let outcome =
        coordinate_production(shutdown_signal(), cancel_tx, filter_done, publisher_done).await;

    pool.close().await;
    info!("{} stopped", SERVICE_NAME);

    // Non-zero exit so a supervisor restarts a streamer whose stream died
    if let Some(failure) = outcome.filter.and_then(|summary| summary.failure) {
        anyhow::bail!("Stream filter stopped: {}", failure);
    }
    Ok(())
}
