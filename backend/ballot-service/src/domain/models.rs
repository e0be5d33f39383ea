use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

/// One choice within some poll, carried as its raw text
pub type VoteOption = String;

/// Poll record - the durable target of flushed vote increments
///
/// `results` is only ever mutated through per-option atomic increments.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollRecord {
    pub id: Uuid,
    pub title: String,
    pub options: Vec<VoteOption>,
    pub results: Json<HashMap<VoteOption, i64>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PollRecord {
    /// Cumulative persisted total for one option (0 when never voted)
    pub fn result_for(&self, option: &str) -> i64 {
        self.results.0.get(option).copied().unwrap_or(0)
    }
}

/// Counts produced by one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Options whose increment was applied this cycle
    pub persisted: usize,
    /// Options whose increment failed and stay pending
    pub failed: usize,
    /// Options skipped this cycle because they are backing off
    pub deferred: usize,
    /// Total votes moved to the store
    pub votes_persisted: u64,
    /// Aggregate fully cleared at the end of the cycle
    pub settled: bool,
}

impl FlushReport {
    /// Report for a cycle that found nothing pending
    pub fn empty() -> Self {
        Self {
            settled: true,
            ..Default::default()
        }
    }
}
