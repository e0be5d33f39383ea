/// Configuration management for the ballot services
///
/// Loaded once from environment variables at startup. Database pool settings
/// live in `db_pool::DbConfig`; Mastodon credentials in `MastodonConfig`.
use db_pool::env_utils::{parse_env_optional, parse_env_with_default, require_env};
use std::fmt;
use std::time::Duration;

use crate::error::{BallotError, Result};

/// Settings shared by both binaries
#[derive(Debug, Clone)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub flusher: FlusherConfig,
    pub publisher: PublisherConfig,
}

/// Message bus settings
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Bootstrap brokers (comma-separated), used to discover topic leaders
    pub brokers: String,
    pub votes_topic: String,
    /// Durable consumer group of the vote counter
    pub counter_group_id: String,
}

/// Periodic flush of the in-memory aggregate
#[derive(Debug, Clone)]
pub struct FlusherConfig {
    pub interval: Duration,
    /// Deadline for a single per-option increment
    pub store_timeout: Duration,
    /// Consecutive failures of one option before an alert is raised
    pub alert_threshold: u32,
    /// Upper bound on how many cycles a failing option is skipped
    pub max_backoff_cycles: u32,
    /// Persist whatever is pending once more after a graceful stop
    pub final_flush: bool,
}

/// Vote republishing from the content stream onto the bus
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_retries: u32,
    pub channel_capacity: usize,
    pub send_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            votes_topic: "votes".to_string(),
            counter_group_id: "counter".to_string(),
        }
    }
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            store_timeout: resilience::store_call_timeout().duration,
            alert_threshold: 5,
            max_backoff_cycles: 30,
            final_flush: true,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: resilience::bus_publish_retry().max_retries,
            channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let kafka_defaults = KafkaConfig::default();
        let kafka = KafkaConfig {
            brokers: parse_env_with_default("KAFKA_BROKERS", kafka_defaults.brokers),
            votes_topic: parse_env_with_default("KAFKA_VOTES_TOPIC", kafka_defaults.votes_topic),
            counter_group_id: parse_env_with_default(
                "KAFKA_COUNTER_GROUP_ID",
                kafka_defaults.counter_group_id,
            ),
        };

        let flusher_defaults = FlusherConfig::default();
        let flusher = FlusherConfig {
            interval: Duration::from_millis(parse_env_with_default(
                "FLUSH_INTERVAL_MS",
                flusher_defaults.interval.as_millis() as u64,
            )),
            store_timeout: Duration::from_millis(parse_env_with_default(
                "FLUSH_STORE_TIMEOUT_MS",
                flusher_defaults.store_timeout.as_millis() as u64,
            )),
            alert_threshold: parse_env_with_default(
                "FLUSH_ALERT_THRESHOLD",
                flusher_defaults.alert_threshold,
            ),
            max_backoff_cycles: parse_env_with_default(
                "FLUSH_MAX_BACKOFF_CYCLES",
                flusher_defaults.max_backoff_cycles,
            ),
            final_flush: parse_env_with_default("FLUSH_ON_SHUTDOWN", flusher_defaults.final_flush),
        };

        let publisher_defaults = PublisherConfig::default();
        let publisher = PublisherConfig {
            max_retries: parse_env_with_default(
                "PUBLISH_MAX_RETRIES",
                publisher_defaults.max_retries,
            ),
            channel_capacity: parse_env_with_default(
                "VOTE_CHANNEL_CAPACITY",
                publisher_defaults.channel_capacity,
            ),
            send_timeout: Duration::from_millis(parse_env_with_default(
                "PUBLISH_SEND_TIMEOUT_MS",
                publisher_defaults.send_timeout.as_millis() as u64,
            )),
        };

        let config = Config {
            kafka,
            flusher,
            publisher,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(BallotError::Config("KAFKA_BROKERS is empty".to_string()));
        }
        if self.flusher.interval.is_zero() {
            return Err(BallotError::Config(
                "FLUSH_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        if self.flusher.alert_threshold == 0 {
            return Err(BallotError::Config(
                "FLUSH_ALERT_THRESHOLD must be greater than zero".to_string(),
            ));
        }
        if self.publisher.channel_capacity == 0 {
            return Err(BallotError::Config(
                "VOTE_CHANNEL_CAPACITY must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mastodon instance and credentials for the public timeline stream
#[derive(Clone)]
pub struct MastodonConfig {
    pub server: String,
    /// Pre-issued token; when absent the password grant below is used
    pub access_token: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub user_email: String,
    pub user_password: String,
}

impl fmt::Debug for MastodonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MastodonConfig")
            .field("server", &self.server)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("user_email", &self.user_email)
            .field("user_password", &"[REDACTED]")
            .finish()
    }
}

impl MastodonConfig {
    pub fn from_env() -> Result<Self> {
        let server = parse_env_with_default("MSTDN_SERVER", "https://mstdn.jp".to_string());
        let access_token: Option<String> = parse_env_optional("MSTDN_ACCESS_TOKEN");

        let (client_id, client_secret, user_email, user_password) = if access_token.is_some() {
            (
                parse_env_with_default("MSTDN_CLIENT_ID", String::new()),
                parse_env_with_default("MSTDN_CLIENT_SECRET", String::new()),
                parse_env_with_default("MSTDN_USER_EMAIL", String::new()),
                parse_env_with_default("MSTDN_USER_PASSWORD", String::new()),
            )
        } else {
            (
                require_env("MSTDN_CLIENT_ID").map_err(BallotError::Config)?,
                require_env("MSTDN_CLIENT_SECRET").map_err(BallotError::Config)?,
                require_env("MSTDN_USER_EMAIL").map_err(BallotError::Config)?,
                require_env("MSTDN_USER_PASSWORD").map_err(BallotError::Config)?,
            )
        };

        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            access_token,
            client_id,
            client_secret,
            user_email,
            user_password,
        })
    }
}
