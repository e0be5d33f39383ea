//! Prometheus metrics for the vote pipeline
//!
//! Registered in the default registry; exposition is left to the host process.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static::lazy_static! {
    /// Vote messages counted by the consumer
    pub static ref VOTES_RECEIVED: IntCounter = register_int_counter!(
        "ballot_votes_received_total",
        "Vote messages aggregated in memory"
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Vote messages acknowledged without being counted
    pub static ref VOTES_REJECTED: IntCounter = register_int_counter!(
        "ballot_votes_rejected_total",
        "Vote messages with an empty or non-UTF-8 payload"
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Flush cycles by outcome (empty/settled/partial)
    pub static ref FLUSH_CYCLES: IntCounterVec = register_int_counter_vec!(
        "ballot_flush_cycles_total",
        "Flush cycles by outcome",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref FLUSH_CYCLE_DURATION: Histogram = register_histogram!(
        "ballot_flush_cycle_duration_seconds",
        "Time spent in one flush cycle",
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Per-option persistence results (persisted/failed/deferred)
    pub static ref FLUSH_OPTIONS: IntCounterVec = register_int_counter_vec!(
        "ballot_flush_options_total",
        "Per-option persistence results",
        &["result"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref FLUSH_OPTION_ALERTS: IntCounter = register_int_counter!(
        "ballot_flush_option_alerts_total",
        "Options that reached the consecutive failure alert threshold"
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Options holding an unpersisted delta after the last cycle
    pub static ref PENDING_OPTIONS: IntGauge = register_int_gauge!(
        "ballot_pending_options",
        "Options with votes not yet persisted"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref VOTES_MATCHED: IntCounter = register_int_counter!(
        "ballot_stream_votes_matched_total",
        "Votes extracted from the content stream"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref VOTES_PUBLISHED: IntCounter = register_int_counter!(
        "ballot_votes_published_total",
        "Votes published to the message bus"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref VOTES_DROPPED: IntCounter = register_int_counter!(
        "ballot_votes_dropped_total",
        "Votes dropped after publish retries were exhausted"
    ).expect("Prometheus metrics registration should succeed at startup");
}
