//! Vote ingestion pipeline
//!
//! Consumption side (`vote-counter`): [`consumers::votes::VoteConsumer`] feeds
//! the in-memory [`services::aggregate::AggregateCounter`], which
//! [`workers::flusher::Flusher`] drains into Postgres every interval.
//!
//! Production side (`vote-streamer`): [`services::stream_filter::StreamFilter`]
//! turns the Mastodon public timeline into votes that
//! [`services::publisher::VotePublisher`] republishes onto Kafka.
//!
//! [`shutdown`] holds the ordered stop sequence for both.

pub mod config;
pub mod consumers;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod repository;
pub mod services;
pub mod shutdown;
pub mod workers;

pub use error::{BallotError, Result};
