/// Preset configurations for the external calls the ballot services make
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Kafka produce calls
///
/// - Retry: 3 attempts after the first, 100ms doubling up to 5s
/// - Produce is at-least-once, so a duplicate on retry is acceptable
pub fn bus_publish_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(5),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

/// Poll store increments
///
/// - Timeout: 5s per statement
/// - No retry here: a failed increment is kept in memory and retried next flush
pub fn store_call_timeout() -> TimeoutConfig {
    TimeoutConfig {
        duration: Duration::from_secs(5),
    }
}
