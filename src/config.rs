//! Engine configuration.
//!
//! Configuration is an explicit value passed through construction; there are
//! no process-wide mutable singletons.

use std::time::Duration;

/// Configuration shared by the store, workers and the garbage collector.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Database URL of the shared store
    pub database_url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// When true, the deployment mirrors job transitions into
    /// `analysis_stats` with DB triggers and the engine skips its own
    /// counter increments.
    pub stats_by_triggers: bool,

    /// Attempts for a deadlocked status update before giving up
    pub deadlock_max_attempts: u32,

    /// Base delay of the linear backoff between deadlock retries
    pub deadlock_backoff: Duration,

    /// How long a worker naps after an empty claim before concluding NO_WORK
    pub claim_grace: Duration,

    /// Claim batch size used when an analysis does not set its own
    pub default_batch_size: i64,
}

impl HiveConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool_size: 10,
            stats_by_triggers: false,
            deadlock_max_attempts: 3,
            deadlock_backoff: Duration::from_secs(1),
            claim_grace: Duration::from_secs(1),
            default_batch_size: 1,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("APIARY_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("APIARY_DATABASE_URL must be set"))?;

        let mut config = Self::new(database_url);

        if let Ok(size) = std::env::var("APIARY_POOL_SIZE") {
            config.pool_size = size.parse()?;
        }
        if let Ok(flag) = std::env::var("APIARY_STATS_BY_TRIGGERS") {
            config.stats_by_triggers = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Ok(secs) = std::env::var("APIARY_CLAIM_GRACE_SECS") {
            config.claim_grace = Duration::from_secs(secs.parse()?);
        }
        if let Ok(n) = std::env::var("APIARY_DEFAULT_BATCH_SIZE") {
            config.default_batch_size = n.parse()?;
        }

        Ok(config)
    }
}
