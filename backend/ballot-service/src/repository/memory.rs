//! In-memory poll store for unit tests

use crate::domain::models::PollRecord;
use crate::error::{BallotError, Result};
use crate::repository::PollStore;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct InMemoryPollStore {
    polls: Mutex<Vec<PollRecord>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, u64)>>,
    fail_load: Mutex<bool>,
}

impl InMemoryPollStore {
    pub(crate) fn with_poll(options: &[&str]) -> Self {
        let store = Self::default();
        store.add_poll(options);
        store
    }

    pub(crate) fn add_poll(&self, options: &[&str]) {
        self.polls.lock().unwrap().push(PollRecord {
            id: Uuid::new_v4(),
            title: options.join(" vs "),
            options: options.iter().map(|o| o.to_string()).collect(),
            results: Json(HashMap::new()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
    }

    pub(crate) fn fail_option(&self, option: &str) {
        self.failing.lock().unwrap().insert(option.to_string());
    }

    pub(crate) fn recover_option(&self, option: &str) {
        self.failing.lock().unwrap().remove(option);
    }

    pub(crate) fn fail_load(&self) {
        *self.fail_load.lock().unwrap() = true;
    }

    /// Sum of `results[option]` across all polls
    pub(crate) fn total(&self, option: &str) -> i64 {
        self.polls
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.result_for(option))
            .sum()
    }

    /// Every increment attempted, failed ones included
    pub(crate) fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PollStore for InMemoryPollStore {
    async fn load_polls(&self) -> Result<Vec<PollRecord>> {
        if *self.fail_load.lock().unwrap() {
            return Err(BallotError::Internal("store unavailable".to_string()));
        }
        Ok(self.polls.lock().unwrap().clone())
    }

    async fn increment_result(&self, option: &str, count: u64) -> Result<u64> {
        self.calls.lock().unwrap().push((option.to_string(), count));

        if self.failing.lock().unwrap().contains(option) {
            return Err(BallotError::Internal(format!("write of {} rejected", option)));
        }

        let mut touched = 0;
        for poll in self.polls.lock().unwrap().iter_mut() {
            if poll.options.iter().any(|o| o == option) {
                *poll.results.0.entry(option.to_string()).or_insert(0) += count as i64;
                touched += 1;
            }
        }
        Ok(touched)
    }
}
