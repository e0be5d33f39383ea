pub mod votes;

pub use votes::{ConsumerSummary, VoteConsumer};
