/// Error types for ballot-service
use resilience::TimeoutError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BallotError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Content stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TimeoutError<BallotError>> for BallotError {
    fn from(err: TimeoutError<BallotError>) -> Self {
        match err {
            TimeoutError::Elapsed(after) => BallotError::Timeout(format!("{:?}", after)),
            TimeoutError::OperationFailed(inner) => inner,
        }
    }
}

/// Result type alias for ballot operations
pub type Result<T> = std::result::Result<T, BallotError>;
