/// Vote publishing onto the message bus
///
/// Drains the internal vote channel until every sender is gone, publishing one
/// raw-text message per vote. Failed publishes are retried with bounded
/// exponential backoff and then dropped (logged and counted).
use crate::config::{KafkaConfig, PublisherConfig};
use crate::error::{BallotError, Result};
use crate::metrics::{VOTES_DROPPED, VOTES_PUBLISHED};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use resilience::{with_retry, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Where published votes go
#[async_trait]
pub trait VoteSink: Send + Sync {
    async fn publish(&self, option: &str) -> Result<()>;

    /// Deliver anything still buffered and release the producer
    async fn close(&self);
}

/// Kafka producer for the `votes` topic
pub struct KafkaVoteSink {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaVoteSink {
    /// Create the producer and confirm the brokers answer. Fatal on error.
    pub async fn connect(kafka: &KafkaConfig, publisher: &PublisherConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.brokers)
            .set("client.id", "vote-streamer")
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .set("linger.ms", "5")
            .create()?;

        let lookup = producer.clone();
        let topic = kafka.votes_topic.clone();
        tokio::task::spawn_blocking(move || {
            lookup
                .client()
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| BallotError::Internal(format!("metadata lookup task failed: {}", e)))??;

        info!(
            brokers = %kafka.brokers,
            topic = %kafka.votes_topic,
            "Vote producer connected"
        );

        Ok(Self {
            producer,
            topic: kafka.votes_topic.clone(),
            send_timeout: publisher.send_timeout,
        })
    }
}

#[async_trait]
impl VoteSink for KafkaVoteSink {
    async fn publish(&self, option: &str) -> Result<()> {
        // No key, no envelope: the payload is the option text itself
        let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(option.as_bytes());

        match self.producer.send(record, self.send_timeout).await {
            Ok((partition, offset)) => {
                debug!(option = %option, partition, offset, "Vote published");
                Ok(())
            }
            Err((e, _)) => Err(BallotError::Kafka(e)),
        }
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        match tokio::task::spawn_blocking(move || producer.flush(PRODUCER_FLUSH_TIMEOUT)).await {
            Ok(Ok(())) => info!("Vote producer flushed"),
            Ok(Err(e)) => error!(error = %e, "Failed to flush vote producer"),
            Err(e) => error!(error = %e, "Vote producer flush task failed"),
        }
    }
}

/// Counts reported once the publisher stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherSummary {
    pub published: u64,
    pub dropped: u64,
}

pub struct VotePublisher {
    sink: Arc<dyn VoteSink>,
    retry: RetryConfig,
}

impl VotePublisher {
    pub fn new(sink: Arc<dyn VoteSink>, config: &PublisherConfig) -> Self {
        let retry = RetryConfig {
            max_retries: config.max_retries,
            ..resilience::bus_publish_retry()
        };
        Self { sink, retry }
    }

    /// Start draining `votes`. The returned receiver resolves once, after the
    /// channel is closed, every buffered vote is handled and the sink is closed.
    pub fn spawn(self, votes: mpsc::Receiver<String>) -> oneshot::Receiver<PublisherSummary> {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let summary = self.run(votes).await;
            let _ = done_tx.send(summary);
        });
        done_rx
    }

    async fn run(self, mut votes: mpsc::Receiver<String>) -> PublisherSummary {
        let mut summary = PublisherSummary::default();

        while let Some(option) = votes.recv().await {
            let sink = &self.sink;
            let vote = option.as_str();
            match with_retry(self.retry.clone(), move || sink.publish(vote)).await {
                Ok(()) => {
                    summary.published += 1;
                    VOTES_PUBLISHED.inc();
                }
                Err(e) => {
                    summary.dropped += 1;
                    VOTES_DROPPED.inc();
                    let attempts = e.attempts();
                    let last_error = e.into_inner();
                    error!(
                        option = %option,
                        attempts,
                        error = %last_error,
                        "Dropping vote, publish retries exhausted"
                    );
                }
            }
        }

        info!(
            published = summary.published,
            dropped = summary.dropped,
            "Vote channel closed, stopping publisher"
        );
        self.sink.close().await;
        if summary.dropped > 0 {
            warn!(dropped = summary.dropped, "Some votes were never published");
        }
        summary
    }
}
