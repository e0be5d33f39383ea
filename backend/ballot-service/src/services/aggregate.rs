/// In-memory vote aggregate
///
/// Votes land here as they are consumed and leave only through `flush`, which
/// hands each pending delta to a `FlushSink`. A single lock covers every
/// read-modify-write: an increment, or a whole flush pass including the
/// conditional reset, so a vote arriving mid-flush is never lost to a reset.
use crate::domain::models::FlushReport;
use crate::metrics::PENDING_OPTIONS;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Result of handing one option's delta to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Delta applied; the in-memory count may be reset
    Persisted,
    /// Delta rejected; the count is kept for the next cycle
    Failed,
    /// Not attempted this cycle; the count is kept
    Deferred,
}

/// Destination of flushed deltas
#[async_trait]
pub trait FlushSink: Send {
    async fn persist(&mut self, option: &str, count: u64) -> PersistOutcome;
}

#[derive(Debug, Default)]
pub struct AggregateCounter {
    // None until the first vote, and again after a fully settled flush
    counts: Mutex<Option<HashMap<String, u64>>>,
}

impl AggregateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one vote for `option`, returning its pending count
    pub async fn increment(&self, option: &str) -> u64 {
        let mut guard = self.counts.lock().await;
        let count = guard
            .get_or_insert_with(HashMap::new)
            .entry(option.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Pending (unpersisted) count for one option
    pub async fn count(&self, option: &str) -> u64 {
        let guard = self.counts.lock().await;
        guard
            .as_ref()
            .and_then(|counts| counts.get(option).copied())
            .unwrap_or(0)
    }

    /// Snapshot of every option with a non-zero pending count
    pub async fn pending(&self) -> HashMap<String, u64> {
        let guard = self.counts.lock().await;
        guard
            .iter()
            .flatten()
            .filter(|(_, count)| **count > 0)
            .map(|(option, count)| (option.clone(), *count))
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        let guard = self.counts.lock().await;
        Self::nothing_pending(&guard)
    }

    /// Run one flush cycle against `sink`.
    ///
    /// Holds the lock for the entire pass. Options are visited in name order
    /// so cycles are reproducible. Persisted options are zeroed; failed and
    /// deferred options keep their count untouched. The map is cleared only
    /// when every pending option persisted.
    pub async fn flush<S>(&self, sink: &mut S) -> FlushReport
    where
        S: FlushSink + ?Sized,
    {
        let mut guard = self.counts.lock().await;

        if Self::nothing_pending(&guard) {
            *guard = None;
            PENDING_OPTIONS.set(0);
            return FlushReport::empty();
        }

        let mut batch: Vec<(String, u64)> = guard
            .iter()
            .flatten()
            .filter(|(_, count)| **count > 0)
            .map(|(option, count)| (option.clone(), *count))
            .collect();
        batch.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut report = FlushReport::default();
        for (option, count) in batch {
            match sink.persist(&option, count).await {
                PersistOutcome::Persisted => {
                    if let Some(entry) = guard.as_mut().and_then(|c| c.get_mut(&option)) {
                        *entry = 0;
                    }
                    report.persisted += 1;
                    report.votes_persisted += count;
                }
                PersistOutcome::Failed => report.failed += 1,
                PersistOutcome::Deferred => report.deferred += 1,
            }
        }

        report.settled = report.failed == 0 && report.deferred == 0;
        if report.settled {
            *guard = None;
        }
        PENDING_OPTIONS.set((report.failed + report.deferred) as i64);

        report
    }

    fn nothing_pending(counts: &Option<HashMap<String, u64>>) -> bool {
        counts
            .as_ref()
            .map_or(true, |c| c.values().all(|count| *count == 0))
    }
}
