/// Periodic flush of the vote aggregate into the poll store
///
/// One task owns a ticker and runs a flush cycle per tick until stopped. A
/// stop request is only observed between cycles, so a cycle in flight always
/// completes. Options whose increment keeps failing are backed off
/// exponentially (in cycles) and raise an alert once their failure streak
/// reaches the configured threshold.
use crate::config::FlusherConfig;
use crate::domain::models::FlushReport;
use crate::error::BallotError;
use crate::metrics::{FLUSH_CYCLES, FLUSH_CYCLE_DURATION, FLUSH_OPTIONS, FLUSH_OPTION_ALERTS};
use crate::repository::PollStore;
use crate::services::aggregate::{AggregateCounter, FlushSink, PersistOutcome};
use crate::shutdown::{stop_requested, TaskHandle};
use async_trait::async_trait;
use resilience::with_timeout_result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
struct FailureStreak {
    consecutive: u32,
    retry_at: u64,
}

/// Consecutive failure bookkeeping per option
#[derive(Debug, Default)]
pub struct FailureTracker {
    streaks: HashMap<String, FailureStreak>,
}

impl FailureTracker {
    fn should_defer(&self, option: &str, cycle: u64) -> bool {
        self.streaks
            .get(option)
            .map_or(false, |streak| streak.retry_at > cycle)
    }

    fn record_success(&mut self, option: &str) {
        if let Some(streak) = self.streaks.remove(option) {
            info!(
                option = %option,
                failed_cycles = streak.consecutive,
                "Option persisted again after failures"
            );
        }
    }

    /// Returns the new streak length
    fn record_failure(&mut self, option: &str, cycle: u64, max_backoff_cycles: u32) -> u32 {
        let streak = self
            .streaks
            .entry(option.to_string())
            .or_insert(FailureStreak {
                consecutive: 0,
                retry_at: 0,
            });
        streak.consecutive = streak.consecutive.saturating_add(1);
        streak.retry_at = cycle + 1 + backoff_cycles(streak.consecutive, max_backoff_cycles);
        streak.consecutive
    }

    /// Current failure streak of an option (0 when healthy)
    pub fn consecutive_failures(&self, option: &str) -> u32 {
        self.streaks.get(option).map_or(0, |s| s.consecutive)
    }
}

/// Cycles to skip after `consecutive` failures: 0, 1, 3, 7, ... capped
fn backoff_cycles(consecutive: u32, max_backoff_cycles: u32) -> u64 {
    let exponent = consecutive.saturating_sub(1).min(32);
    let skip = (1u64 << exponent) - 1;
    skip.min(max_backoff_cycles as u64)
}

/// Flush sink that applies timeouts, backoff and alerting around the store
struct RetentionSink<'a> {
    store: &'a dyn PollStore,
    failures: &'a mut FailureTracker,
    config: &'a FlusherConfig,
    cycle: u64,
    /// Attempt every option regardless of its backoff
    bypass_backoff: bool,
}

#[async_trait]
impl FlushSink for RetentionSink<'_> {
    async fn persist(&mut self, option: &str, count: u64) -> PersistOutcome {
        if !self.bypass_backoff && self.failures.should_defer(option, self.cycle) {
            debug!(option = %option, count, "Option backing off, skipped this cycle");
            FLUSH_OPTIONS.with_label_values(&["deferred"]).inc();
            return PersistOutcome::Deferred;
        }

        match with_timeout_result(
            self.config.store_timeout,
            self.store.increment_result(option, count),
        )
        .await
        .map_err(BallotError::from)
        {
            Ok(polls) => {
                debug!(option = %option, count, polls, "Votes persisted");
                self.failures.record_success(option);
                FLUSH_OPTIONS.with_label_values(&["persisted"]).inc();
                PersistOutcome::Persisted
            }
            Err(e) => {
                let consecutive =
                    self.failures
                        .record_failure(option, self.cycle, self.config.max_backoff_cycles);
                FLUSH_OPTIONS.with_label_values(&["failed"]).inc();

                if consecutive >= self.config.alert_threshold {
                    if consecutive == self.config.alert_threshold {
                        FLUSH_OPTION_ALERTS.inc();
                    }
                    error!(
                        option = %option,
                        pending = count,
                        consecutive_failures = consecutive,
                        error = %e,
                        "ALERT: votes for option repeatedly failing to persist"
                    );
                } else {
                    warn!(
                        option = %option,
                        pending = count,
                        consecutive_failures = consecutive,
                        error = %e,
                        "Failed to persist votes, keeping count for next cycle"
                    );
                }
                PersistOutcome::Failed
            }
        }
    }
}

pub struct Flusher {
    counter: Arc<AggregateCounter>,
    store: Arc<dyn PollStore>,
    config: FlusherConfig,
    failures: FailureTracker,
    cycle: u64,
}

impl Flusher {
    pub fn new(
        counter: Arc<AggregateCounter>,
        store: Arc<dyn PollStore>,
        config: FlusherConfig,
    ) -> Self {
        Self {
            counter,
            store,
            config,
            failures: FailureTracker::default(),
            cycle: 0,
        }
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// Run one flush cycle now
    pub async fn run_cycle(&mut self) -> FlushReport {
        self.flush_pass(false).await
    }

    /// Last cycle before exit: options in backoff are attempted too
    pub async fn run_final_cycle(&mut self) -> FlushReport {
        info!(cycle = self.cycle + 1, "Running final flush");
        self.flush_pass(true).await
    }

    async fn flush_pass(&mut self, bypass_backoff: bool) -> FlushReport {
        self.cycle += 1;
        let timer = FLUSH_CYCLE_DURATION.start_timer();

        let mut sink = RetentionSink {
            store: self.store.as_ref(),
            failures: &mut self.failures,
            config: &self.config,
            cycle: self.cycle,
            bypass_backoff,
        };
        let report = self.counter.flush(&mut sink).await;
        timer.observe_duration();

        if report.persisted + report.failed + report.deferred == 0 {
            debug!(cycle = self.cycle, "No new votes, skipping flush");
            FLUSH_CYCLES.with_label_values(&["empty"]).inc();
        } else if report.settled {
            info!(
                cycle = self.cycle,
                options = report.persisted,
                votes = report.votes_persisted,
                "Flush finished"
            );
            FLUSH_CYCLES.with_label_values(&["settled"]).inc();
        } else {
            warn!(
                cycle = self.cycle,
                persisted = report.persisted,
                failed = report.failed,
                deferred = report.deferred,
                "Flush finished with options still pending"
            );
            FLUSH_CYCLES.with_label_values(&["partial"]).inc();
        }

        report
    }

    /// Start the periodic loop. The task hands the flusher back when stopped.
    pub fn spawn(self) -> TaskHandle<Flusher> {
        TaskHandle::spawn("flusher", move |stop| self.run(stop))
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) -> Self {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            alert_threshold = self.config.alert_threshold,
            "Flusher started"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        info!(cycles = self.cycle, "Flusher stopped");
        self
    }
}
