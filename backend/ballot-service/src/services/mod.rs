pub mod aggregate;
pub mod mastodon;
pub mod publisher;
pub mod stream_filter;

pub use aggregate::AggregateCounter;
pub use mastodon::MastodonClient;
pub use publisher::{KafkaVoteSink, VotePublisher, VoteSink};
pub use stream_filter::{StreamFilter, Vocabulary};
