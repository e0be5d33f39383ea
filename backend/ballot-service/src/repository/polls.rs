use crate::domain::models::PollRecord;
use crate::error::{BallotError, Result};
use async_trait::async_trait;
use db_pool::acquire_with_metrics;
use sqlx::PgPool;
use tracing::debug;

/// Persistent poll store as seen by the vote pipeline
///
/// Implementations must be safe for concurrent independent use.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Every known poll, used to build the stream vocabulary
    async fn load_polls(&self) -> Result<Vec<PollRecord>>;

    /// Atomically add `count` to `results[option]` of every poll offering `option`.
    ///
    /// Returns the number of polls touched. Zero is not an error: the option may
    /// belong to a poll that was deleted after the vote was cast.
    async fn increment_result(&self, option: &str, count: u64) -> Result<u64>;
}

/// Postgres-backed poll store
#[derive(Clone)]
pub struct PollRepository {
    pool: PgPool,
    service_name: String,
}

impl PollRepository {
    pub fn new(pool: PgPool, service_name: impl Into<String>) -> Self {
        Self {
            pool,
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl PollStore for PollRepository {
    async fn load_polls(&self) -> Result<Vec<PollRecord>> {
        let mut conn = acquire_with_metrics(&self.pool, &self.service_name).await?;

        let polls = sqlx::query_as::<_, PollRecord>(
            r#"
            SELECT id, title, options, results, created_at, updated_at
            FROM polls
            ORDER BY created_at
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok(polls)
    }

    async fn increment_result(&self, option: &str, count: u64) -> Result<u64> {
        let delta = i64::try_from(count)
            .map_err(|_| BallotError::InvalidInput(format!("vote delta {} overflows", count)))?;

        // Own connection per statement so one slow increment does not queue others
        let mut conn = acquire_with_metrics(&self.pool, &self.service_name).await?;

        let result = sqlx::query(
            r#"
            UPDATE polls
            SET results = jsonb_set(
                    results,
                    ARRAY[$1::text],
                    to_jsonb(COALESCE((results->>$1)::bigint, 0) + $2::bigint)
                ),
                updated_at = NOW()
            WHERE $1 = ANY(options)
            "#,
        )
        .bind(option)
        .bind(delta)
        .execute(&mut *conn)
        .await?;

        let touched = result.rows_affected();
        if touched == 0 {
            debug!(option = %option, "No poll offers this option, increment discarded");
        }

        Ok(touched)
    }
}
