/// Ordered, cooperative shutdown of the two pipeline shapes
///
/// Consumption side: stop the flusher's ticker, then disconnect the consumer,
/// wait for the consumer, then for the flusher's in-flight cycle, then run one
/// last cycle. Production side: cancel the stream filter, wait for it to close
/// the vote channel, then wait for the publisher to drain it.
use crate::consumers::votes::ConsumerSummary;
use crate::domain::models::FlushReport;
use crate::services::publisher::PublisherSummary;
use crate::services::stream_filter::FilterSummary;
use crate::workers::flusher::Flusher;
use std::future::Future;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A spawned background task with a stop request and a stop notification
pub struct TaskHandle<T> {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn `task`, handing it the receiving side of the stop flag
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(task(stop_rx));
        Self {
            name,
            stop_tx,
            join,
        }
    }

    /// Request a stop. Idempotent; the task finishes its current unit of work.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the task to end without asking it to. Returns `None` if it panicked.
    ///
    /// The handle is spent once this resolves.
    pub async fn finished(&mut self) -> Option<T> {
        let result = (&mut self.join).await;
        Self::settle(self.name, result)
    }

    /// Request a stop and wait for the task's output
    pub async fn stopped(self) -> Option<T> {
        self.stop();
        let name = self.name;
        Self::settle(name, self.join.await)
    }

    fn settle(name: &'static str, result: Result<T, tokio::task::JoinError>) -> Option<T> {
        match result {
            Ok(output) => {
                info!(task = name, "Task stopped");
                Some(output)
            }
            Err(e) => {
                error!(task = name, error = %e, "Task terminated abnormally");
                None
            }
        }
    }
}

/// Resolves once `flag` is raised, or once its sender is gone.
///
/// Unlike `wait_for`, the output holds no `watch::Ref`, so it can be a
/// `select!` arm in a spawned task whose other arms await.
pub async fn stop_requested(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

/// Resolves on SIGINT, SIGTERM or SIGHUP (Ctrl+C elsewhere)
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| error!(error = %e, "Failed to install SIGTERM handler"))
            .ok();
        let mut hangup = signal(SignalKind::hangup())
            .map_err(|e| error!(error = %e, "Failed to install SIGHUP handler"))
            .ok();

        let terminate_recv = async {
            match terminate.as_mut() {
                Some(s) => {
                    s.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        let hangup_recv = async {
            match hangup.as_mut() {
                Some(s) => {
                    s.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = interrupt => info!("Received SIGINT"),
            _ = terminate_recv => info!("Received SIGTERM"),
            _ = hangup_recv => info!("Received SIGHUP"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }
}

/// What the consumption side did on the way out
#[derive(Debug)]
pub struct ConsumptionShutdown {
    pub consumer: Option<ConsumerSummary>,
    /// Outcome of the last cycle run after both tasks stopped
    pub final_flush: Option<FlushReport>,
}

/// Drive the consumption side from `signal` (or an early consumer exit) to a full stop
pub async fn coordinate_consumption<S>(
    signal: S,
    flusher: TaskHandle<Flusher>,
    mut consumer: TaskHandle<ConsumerSummary>,
    final_flush: bool,
) -> ConsumptionShutdown
where
    S: Future<Output = ()>,
{
    let early_exit = tokio::select! {
        _ = signal => {
            info!("Shutdown requested, stopping vote consumption");
            None
        }
        summary = consumer.finished() => {
            warn!("Vote consumer exited on its own, shutting down");
            Some(summary)
        }
    };

    // No new cycles from here; one already running is left to finish
    flusher.stop();

    let consumer_summary = match early_exit {
        Some(summary) => summary,
        None => consumer.stopped().await,
    };
    if let Some(summary) = &consumer_summary {
        info!(
            received = summary.received,
            rejected = summary.rejected,
            "Vote consumer disconnected"
        );
    }

    let final_report = match flusher.stopped().await {
        Some(mut flusher) if final_flush => {
            let report = flusher.run_final_cycle().await;
            if !report.settled {
                error!(
                    failed = report.failed,
                    deferred = report.deferred,
                    "Votes left unpersisted at shutdown"
                );
            }
            Some(report)
        }
        Some(_) => None,
        None => {
            error!("Flusher lost, pending votes were not persisted");
            None
        }
    };

    ConsumptionShutdown {
        consumer: consumer_summary,
        final_flush: final_report,
    }
}

/// What the production side did on the way out
#[derive(Debug)]
pub struct ProductionShutdown {
    pub filter: Option<FilterSummary>,
    pub publisher: Option<PublisherSummary>,
}

/// Drive the production side from `signal` (or the filter ending) to a full stop.
///
/// Always waits for the filter's completion strictly before the publisher's, so
/// every vote queued before cancellation is published.
pub async fn coordinate_production<S>(
    signal: S,
    cancel: watch::Sender<bool>,
    mut filter_done: oneshot::Receiver<FilterSummary>,
    publisher_done: oneshot::Receiver<PublisherSummary>,
) -> ProductionShutdown
where
    S: Future<Output = ()>,
{
    let early_exit = tokio::select! {
        _ = signal => {
            info!("Shutdown requested, cancelling content stream");
            None
        }
        summary = &mut filter_done => {
            warn!("Stream filter ended on its own, shutting down");
            Some(summary.ok())
        }
    };

    cancel.send_replace(true);

    let filter = match early_exit {
        Some(summary) => summary,
        None => filter_done.await.ok(),
    };
    match &filter {
        Some(summary) => info!(
            events = summary.events,
            votes = summary.votes,
            "Stream filter stopped"
        ),
        None => error!("Stream filter task ended without reporting"),
    }

    let publisher = publisher_done.await.ok();
    match &publisher {
        Some(summary) => info!(
            published = summary.published,
            dropped = summary.dropped,
            "Vote publisher drained and stopped"
        ),
        None => error!("Vote publisher task ended without reporting"),
    }

    ProductionShutdown { filter, publisher }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlusherConfig, PublisherConfig};
    use crate::error::Result;
    use crate::repository::memory::InMemoryPollStore;
    use crate::services::aggregate::AggregateCounter;
    use crate::services::publisher::tests::RecordingSink;
    use crate::services::publisher::{VotePublisher, VoteSink};
    use crate::services::stream_filter::tests::{update, ScriptedStream};
    use crate::services::stream_filter::StreamFilter;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    /// Publishes only as permits are released
    struct GatedSink {
        gate: Arc<Semaphore>,
        inner: RecordingSink,
    }

    #[async_trait]
    impl VoteSink for GatedSink {
        async fn publish(&self, option: &str) -> Result<()> {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.publish(option).await
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    fn signal() -> (oneshot::Sender<()>, impl Future<Output = ()> + Send + 'static) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_production_cancel_drains_buffered_votes() {
        let store = Arc::new(InMemoryPollStore::with_poll(&["cat", "dog"]));
        let stream = Arc::new(ScriptedStream::new(
            vec![update("cat!"), update("dog and cat")],
            false,
        ));
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(GatedSink {
            gate: Arc::clone(&gate),
            inner: RecordingSink::default(),
        });
        let publisher_config = PublisherConfig {
            max_retries: 0,
            channel_capacity: 8,
            send_timeout: Duration::from_secs(1),
        };

        let (votes_tx, votes_rx) = mpsc::channel(publisher_config.channel_capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let publisher_done = VotePublisher::new(sink.clone(), &publisher_config).spawn(votes_rx);
        let filter_done = StreamFilter::new(store, stream).spawn(votes_tx, cancel_rx);

        // Filter has emitted everything and is parked on the stream
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sink.inner.published().is_empty());

        let (signal_tx, signal) = signal();
        let coordinator = tokio::spawn(coordinate_production(
            signal,
            cancel_tx,
            filter_done,
            publisher_done,
        ));
        signal_tx.send(()).unwrap();

        // Publisher still blocked, so shutdown cannot complete yet
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!coordinator.is_finished());
        assert_eq!(sink.inner.closed(), 0);

        gate.add_permits(3);
        let outcome = coordinator.await.unwrap();

        let filter = outcome.filter.unwrap();
        assert_eq!(filter.votes, 3);
        assert!(filter.failure.is_none());
        assert_eq!(outcome.publisher.unwrap().published, 3);
        assert_eq!(sink.inner.published(), vec!["cat", "cat", "dog"]);
        assert_eq!(sink.inner.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_production_shuts_down_when_stream_fails() {
        let store = Arc::new(InMemoryPollStore::with_poll(&["cat"]));
        let stream = Arc::new(ScriptedStream::new(vec![update("cat")], true));
        let sink = Arc::new(RecordingSink::default());
        let publisher_config = PublisherConfig::default();

        let (votes_tx, votes_rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let publisher_done = VotePublisher::new(sink.clone(), &publisher_config).spawn(votes_rx);
        let filter_done = StreamFilter::new(store, stream).spawn(votes_tx, cancel_rx);

        let outcome = coordinate_production(
            std::future::pending::<()>(),
            cancel_tx,
            filter_done,
            publisher_done,
        )
        .await;

        assert!(outcome.filter.unwrap().failure.is_some());
        assert_eq!(outcome.publisher.unwrap().published, 1);
        assert_eq!(sink.published(), vec!["cat"]);
    }

    fn flusher_config() -> FlusherConfig {
        FlusherConfig {
            interval: Duration::from_secs(1),
            store_timeout: Duration::from_secs(1),
            alert_threshold: 5,
            max_backoff_cycles: 30,
            final_flush: true,
        }
    }

    fn fake_consumer(counter: Arc<AggregateCounter>, votes: u64) -> TaskHandle<ConsumerSummary> {
        TaskHandle::spawn("vote-consumer", move |mut stop| async move {
            for _ in 0..votes {
                counter.increment("cat").await;
            }
            stop_requested(&mut stop).await;
            ConsumerSummary {
                received: votes,
                rejected: 0,
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumption_stop_runs_final_flush() {
        let store = Arc::new(InMemoryPollStore::with_poll(&["cat"]));
        let counter = Arc::new(AggregateCounter::new());
        let flusher = Flusher::new(counter.clone(), store.clone(), flusher_config()).spawn();
        let consumer = fake_consumer(counter.clone(), 3);

        // Stop before the first tick, so only the final flush persists anything
        let (signal_tx, signal) = signal();
        let coordinator = tokio::spawn(coordinate_consumption(signal, flusher, consumer, true));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.count("cat").await, 3);
        assert!(store.calls().is_empty());

        signal_tx.send(()).unwrap();
        let outcome = coordinator.await.unwrap();

        assert_eq!(outcome.consumer.unwrap().received, 3);
        let report = outcome.final_flush.unwrap();
        assert!(report.settled);
        assert_eq!(report.votes_persisted, 3);
        assert_eq!(store.total("cat"), 3);
        assert!(counter.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumption_stops_flusher_before_consumer() {
        let store = Arc::new(InMemoryPollStore::with_poll(&["cat"]));
        let counter = Arc::new(AggregateCounter::new());
        let flusher = Flusher::new(counter.clone(), store.clone(), flusher_config()).spawn();

        // Slow disconnect spanning several flush intervals, counting one late vote
        let late = Arc::clone(&counter);
        let consumer = TaskHandle::spawn("vote-consumer", move |mut stop| async move {
            late.increment("cat").await;
            stop_requested(&mut stop).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            late.increment("cat").await;
            ConsumerSummary {
                received: 2,
                rejected: 0,
            }
        });

        let (signal_tx, signal) = signal();
        let coordinator = tokio::spawn(coordinate_consumption(signal, flusher, consumer, true));
        tokio::time::sleep(Duration::from_millis(100)).await;
        signal_tx.send(()).unwrap();
        let outcome = coordinator.await.unwrap();

        // Only the final flush reached the store, after the consumer was gone
        assert_eq!(store.calls(), vec![("cat".to_string(), 2)]);
        assert_eq!(outcome.consumer.unwrap().received, 2);
        assert!(outcome.final_flush.unwrap().settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_persists_option_in_backoff() {
        let store = Arc::new(InMemoryPollStore::with_poll(&["cat", "dog"]));
        store.fail_option("dog");
        let counter = Arc::new(AggregateCounter::new());
        counter.increment("dog").await;

        // Three failures leave dog skipped until cycle 8
        let mut flusher = Flusher::new(counter.clone(), store.clone(), flusher_config());
        for _ in 0..4 {
            flusher.run_cycle().await;
        }
        assert_eq!(flusher.failures().consecutive_failures("dog"), 3);
        store.recover_option("dog");

        let (signal_tx, signal) = signal();
        signal_tx.send(()).unwrap();
        let consumer = fake_consumer(counter.clone(), 1);
        let outcome = coordinate_consumption(signal, flusher.spawn(), consumer, true).await;

        let report = outcome.final_flush.unwrap();
        assert!(report.settled);
        assert_eq!(report.deferred, 0);
        assert_eq!(store.total("dog"), 1);
        assert!(counter.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumption_without_final_flush_keeps_pending() {
        let store = Arc::new(InMemoryPollStore::with_poll(&["cat"]));
        let counter = Arc::new(AggregateCounter::new());
        let flusher = Flusher::new(counter.clone(), store.clone(), flusher_config()).spawn();
        let consumer = fake_consumer(counter.clone(), 2);

        let (signal_tx, signal) = signal();
        signal_tx.send(()).unwrap();
        let outcome = coordinate_consumption(signal, flusher, consumer, false).await;

        assert!(outcome.final_flush.is_none());
        assert!(store.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_exit_triggers_shutdown() {
        let store = Arc::new(InMemoryPollStore::with_poll(&["cat"]));
        let counter = Arc::new(AggregateCounter::new());
        counter.increment("cat").await;
        let flusher = Flusher::new(counter.clone(), store.clone(), flusher_config()).spawn();
        let consumer = TaskHandle::spawn("vote-consumer", |_stop| async {
            ConsumerSummary::default()
        });

        let outcome =
            coordinate_consumption(std::future::pending::<()>(), flusher, consumer, true).await;

        assert_eq!(outcome.consumer, Some(ConsumerSummary::default()));
        assert_eq!(store.total("cat"), 1);
    }

    #[tokio::test]
    async fn test_task_handle_reports_panic_as_none() {
        let handle = TaskHandle::spawn("doomed", |_stop| async {
            panic!("boom");
        });

        let output: Option<()> = handle.stopped().await;
        assert!(output.is_none());
    }
}
