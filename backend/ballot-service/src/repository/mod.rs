pub mod polls;

#[cfg(test)]
pub(crate) mod memory;

pub use polls::{PollRepository, PollStore};
