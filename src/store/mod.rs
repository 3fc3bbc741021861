//! The shared job store.
//!
//! Every coordination primitive of the engine is a row operation here:
//! claims are single-statement compare-and-set updates, deduplication rides
//! on a UNIQUE constraint, and fan-in synchronization is a counter column on
//! the funnel job. Workers never take in-process locks spanning each other;
//! the store is the synchronization substrate.
//!
//! The store speaks SQLite, MySQL and Postgres through the `Any` driver;
//! dialect differences are confined to [`crate::dialect`].

mod analysis;
mod job;
mod schema;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use thiserror::Error;
use tracing::warn;

use crate::config::HiveConfig;
use crate::dialect::{self, SqlDialect, UnknownDialect};
use crate::params::ParamError;

pub use analysis::{AnalysisSpec, DataflowRuleSpec};
pub use job::{NewJob, EXT_INPUT_PREFIX, MAX_INPUT_ID_LENGTH};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("parameter error: {0}")]
    Param(#[from] ParamError),

    #[error("{0}")]
    Dialect(#[from] UnknownDialect),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// True for the driver's "deadlock; restart transaction" sentinel, the
    /// only error the bounded retry wrapper is allowed to swallow.
    pub fn is_deadlock(&self) -> bool {
        match self {
            Self::Sqlx(err) => dialect::is_deadlock(err),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Retry `op` while `is_transient` matches, up to `max_attempts` total
/// attempts with a linear backoff. Non-matching errors propagate
/// immediately.
pub(crate) async fn retry_transient<T, F, Fut>(
    max_attempts: u32,
    backoff: Duration,
    is_transient: impl Fn(&StoreError) -> bool,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if is_transient(&err) && attempt < max_attempts => {
                warn!(attempt, error = %err, "transient store error; retrying");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ============================================================================
// Timestamps across the Any driver
// ============================================================================

/// Timestamps cross the Any driver as RFC 3339 TEXT.
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::InvalidRow(format!("bad timestamp '{text}': {err}")))
}

pub(crate) fn get_ts(row: &AnyRow, column: &str) -> StoreResult<Option<DateTime<Utc>>> {
    let text: Option<String> = row.try_get(column)?;
    text.as_deref().map(parse_ts).transpose()
}

// ============================================================================
// Store handle
// ============================================================================

/// Handle on the shared store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct JobStore {
    pool: AnyPool,
    dialect: SqlDialect,
    stats_by_triggers: bool,
    deadlock_max_attempts: u32,
    deadlock_backoff: Duration,
}

impl JobStore {
    /// Connect to the store described by `config`.
    pub async fn connect(config: &HiveConfig) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();
        let dialect = SqlDialect::from_url(&config.database_url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.database_url)
            .await?;
        Ok(Self {
            pool,
            dialect,
            stats_by_triggers: config.stats_by_triggers,
            deadlock_max_attempts: config.deadlock_max_attempts,
            deadlock_backoff: config.deadlock_backoff,
        })
    }

    /// Create the schema if it does not exist yet.
    pub async fn init_schema(&self) -> StoreResult<()> {
        for statement in schema::statements(self.dialect) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Whether DB triggers maintain `analysis_stats` (explicit increments
    /// are skipped then).
    pub fn stats_by_triggers(&self) -> bool {
        self.stats_by_triggers
    }

    pub(crate) fn deadlock_retry_policy(&self) -> (u32, Duration) {
        (self.deadlock_max_attempts, self.deadlock_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_transient_retries_then_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result: StoreResult<&str> = retry_transient(
            3,
            Duration::from_millis(1),
            |err| matches!(err, StoreError::NotFound(_)),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StoreError::NotFound("simulated deadlock".into()))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_after_max_attempts() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = retry_transient(
            3,
            Duration::from_millis(1),
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::NotFound("still deadlocked".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_propagates_other_errors_immediately() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = retry_transient(
            3,
            Duration::from_millis(1),
            |err| matches!(err, StoreError::NotFound(_)),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::InvalidRow("config error".into())) }
            },
        )
        .await;
        assert!(matches!(result, Err(StoreError::InvalidRow(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timestamps_roundtrip() {
        let text = now_str();
        let parsed = parse_ts(&text).unwrap();
        assert_eq!(
            parsed.to_rfc3339_opts(SecondsFormat::Micros, true),
            text
        );
    }
}
