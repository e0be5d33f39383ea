//! Resilience helpers shared by the ballot services
//!
//! - **Retry**: exponential backoff with jitter for transient failures
//! - **Timeout**: time limits on external calls
//! - **Presets**: tuned settings for the bus producer and the poll store
//!
//! # Example: publish with retry
//!
//! ```rust,no_run
//! use resilience::{presets, with_retry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let result = with_retry(presets::bus_publish_retry(), || async {
//!         // Your produce call here
//!         Ok::<_, String>(())
//!     })
//!     .await;
//! }
//! ```

pub mod presets;
pub mod retry;
pub mod timeout;

pub use presets::{bus_publish_retry, store_call_timeout};
pub use retry::{with_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout_result, TimeoutConfig, TimeoutError};
