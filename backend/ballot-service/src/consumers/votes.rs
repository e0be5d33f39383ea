//! Vote Consumer
//!
//! Consumes raw vote messages from the `votes` topic and adds each one to the
//! in-memory aggregate. The offset is committed as soon as the vote is counted,
//! before it is persisted: a crash between commit and the next successful
//! flush loses that vote (at-least-once up to the aggregate, not beyond).

use crate::config::KafkaConfig;
use crate::error::{BallotError, Result};
use crate::metrics::{VOTES_RECEIVED, VOTES_REJECTED};
use crate::services::aggregate::AggregateCounter;
use crate::shutdown::{stop_requested, TaskHandle};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Counts reported by the consumer when it stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub received: u64,
    pub rejected: u64,
}

/// Owned copy of what is needed from a delivery once the borrow ends
struct Delivery {
    topic: String,
    partition: i32,
    offset: i64,
    payload: Option<Vec<u8>>,
}

pub struct VoteConsumer {
    consumer: Arc<StreamConsumer>,
    counter: Arc<AggregateCounter>,
    topic: String,
}

impl VoteConsumer {
    /// Create the consumer, join the group and confirm the brokers answer.
    ///
    /// Any error here is fatal for the counter process.
    pub async fn connect(config: &KafkaConfig, counter: Arc<AggregateCounter>) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.counter_group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .create()?;

        consumer.subscribe(&[&config.votes_topic])?;
        let consumer = Arc::new(consumer);

        // Topic lookup through the bootstrap brokers; blocks, so off the runtime
        let lookup = Arc::clone(&consumer);
        let topic = config.votes_topic.clone();
        let partitions = tokio::task::spawn_blocking(move || {
            lookup
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .map(|t| t.partitions().len())
                        .sum::<usize>()
                })
        })
        .await
        .map_err(|e| BallotError::Internal(format!("metadata lookup task failed: {}", e)))??;

        info!(
            brokers = %config.brokers,
            topic = %config.votes_topic,
            group_id = %config.counter_group_id,
            partitions,
            "Vote consumer connected"
        );

        Ok(Self {
            consumer,
            counter,
            topic: config.votes_topic.clone(),
        })
    }

    /// Start the delivery loop; stopping it disconnects from the bus
    pub fn spawn(self) -> TaskHandle<ConsumerSummary> {
        TaskHandle::spawn("vote-consumer", move |stop| self.run(stop))
    }

    async fn run(self, mut stop: watch::Receiver<bool>) -> ConsumerSummary {
        info!(topic = %self.topic, "Starting vote consumer loop");
        let mut summary = ConsumerSummary::default();

        loop {
            let received = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                received = self.consumer.recv() => received.map(|message| Delivery {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(<[u8]>::to_vec),
                }),
            };

            match received {
                Ok(delivery) => {
                    match record_vote(&self.counter, delivery.payload.as_deref()).await {
                        Some(_) => summary.received += 1,
                        None => summary.rejected += 1,
                    }
                    self.acknowledge(&delivery);
                }
                Err(e) => {
                    error!(error = %e, "Kafka receive error");
                    if pause_unless_stopped(&mut stop).await {
                        break;
                    }
                }
            }
        }

        self.consumer.unsubscribe();
        info!(
            received = summary.received,
            rejected = summary.rejected,
            "Vote consumer loop stopped"
        );
        summary
    }

    fn acknowledge(&self, delivery: &Delivery) {
        let mut offsets = TopicPartitionList::new();
        let added = offsets.add_partition_offset(
            &delivery.topic,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        );
        let committed =
            added.and_then(|_| self.consumer.commit(&offsets, CommitMode::Async));
        if let Err(e) = committed {
            warn!(
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "Failed to commit Kafka offset"
            );
        }
    }
}

/// Back off after a receive error. Returns true if a stop arrived meanwhile.
async fn pause_unless_stopped(stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = stop_requested(stop) => true,
        _ = tokio::time::sleep(RECEIVE_ERROR_PAUSE) => false,
    }
}

/// Count one delivered payload. Returns the option's pending count, or `None`
/// when the payload is not a usable vote (it is still acknowledged).
pub async fn record_vote(counter: &AggregateCounter, payload: Option<&[u8]>) -> Option<u64> {
    let bytes = match payload {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => {
            warn!("Discarding vote message with empty payload");
            VOTES_REJECTED.inc();
            return None;
        }
    };

    let option = match std::str::from_utf8(bytes) {
        Ok(option) => option,
        Err(e) => {
            warn!(error = %e, len = bytes.len(), "Discarding vote message with non-UTF-8 payload");
            VOTES_REJECTED.inc();
            return None;
        }
    };

    let pending = counter.increment(option).await;
    VOTES_RECEIVED.inc();
    debug!(option = %option, pending, "Vote received");
    Some(pending)
}
