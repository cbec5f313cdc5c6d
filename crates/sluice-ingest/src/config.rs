//! Engine configuration
//!
//! Loaded from environment variables (after `.env`, see `main`). Unset
//! variables fall back to the `DEFAULT_*` constants; set but unparsable ones
//! are an error rather than silently replaced.

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::buffer_pool::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};
use crate::dead_letter::DEFAULT_DEAD_LETTER_CAPACITY;
use crate::registry::DEFAULT_MAX_JOBS;

pub const DEFAULT_DEAD_LETTER_DIR: &str = "./data/dead-letter";
pub const DEFAULT_CHECKPOINT_DIR: &str = "./data/checkpoints";
pub const DEFAULT_CHECKPOINT_INTERVAL_ROWS: u64 = 50_000;
pub const DEFAULT_PROGRESS_INTERVAL_ROWS: u64 = 1_000;

/// Parse `var`, or use `default` when it is unset
fn env_or<T: FromStr>(var: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            sluice_common::SluiceError::invalid_env(var, &raw, std::any::type_name::<T>()).into()
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Directory for `{job}_{table}.ndjson` dead-letter files
    pub dead_letter_dir: PathBuf,
    /// Directory for `{job}.json` checkpoints
    pub checkpoint_dir: PathBuf,
    /// Source rows between checkpoint saves
    pub checkpoint_interval_rows: u64,
    /// Settled rows between progress broadcasts
    pub progress_interval_rows: u64,
    pub max_jobs: usize,
    pub buffer_size: usize,
    pub buffer_pool_capacity: usize,
    /// Rejected rows held in memory before a forced flush
    pub dead_letter_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dead_letter_dir: PathBuf::from(DEFAULT_DEAD_LETTER_DIR),
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            checkpoint_interval_rows: DEFAULT_CHECKPOINT_INTERVAL_ROWS,
            progress_interval_rows: DEFAULT_PROGRESS_INTERVAL_ROWS,
            max_jobs: DEFAULT_MAX_JOBS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_pool_capacity: DEFAULT_POOL_CAPACITY,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            dead_letter_dir: env_or("INGEST_DEAD_LETTER_DIR", PathBuf::from(DEFAULT_DEAD_LETTER_DIR))?,
            checkpoint_dir: env_or("INGEST_CHECKPOINT_DIR", PathBuf::from(DEFAULT_CHECKPOINT_DIR))?,
            checkpoint_interval_rows: env_or(
                "INGEST_CHECKPOINT_INTERVAL_ROWS",
                DEFAULT_CHECKPOINT_INTERVAL_ROWS,
            )?,
            progress_interval_rows: env_or(
                "INGEST_PROGRESS_INTERVAL_ROWS",
                DEFAULT_PROGRESS_INTERVAL_ROWS,
            )?,
            max_jobs: env_or("INGEST_MAX_JOBS", DEFAULT_MAX_JOBS)?,
            buffer_size: env_or("INGEST_BUFFER_SIZE", DEFAULT_BUFFER_SIZE)?,
            buffer_pool_capacity: env_or("INGEST_BUFFER_POOL_CAPACITY", DEFAULT_POOL_CAPACITY)?,
            dead_letter_capacity: env_or(
                "INGEST_DEAD_LETTER_CAPACITY",
                DEFAULT_DEAD_LETTER_CAPACITY,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.checkpoint_interval_rows == 0 {
            anyhow::bail!("INGEST_CHECKPOINT_INTERVAL_ROWS must be greater than 0");
        }
        if self.progress_interval_rows == 0 {
            anyhow::bail!("INGEST_PROGRESS_INTERVAL_ROWS must be greater than 0");
        }
        if self.max_jobs == 0 {
            anyhow::bail!("INGEST_MAX_JOBS must be greater than 0");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("INGEST_BUFFER_SIZE must be greater than 0");
        }
        if self.buffer_pool_capacity == 0 {
            anyhow::bail!("INGEST_BUFFER_POOL_CAPACITY must be greater than 0");
        }
        if self.dead_letter_capacity == 0 {
            anyhow::bail!("INGEST_DEAD_LETTER_CAPACITY must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;

        Ok(Self {
            url,
            max_connections: env_or("DB_MAX_CONNECTIONS", 10)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", 1)?,
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT", 30)?,
        })
    }

    pub async fn create_pool(&self) -> anyhow::Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_secs))
            .connect(&self.url)
            .await
            .context("Failed to connect to database")?;

        tracing::info!(
            max_connections = self.max_connections,
            min_connections = self.min_connections,
            "Database connection pool created"
        );
        Ok(pool)
    }
}
