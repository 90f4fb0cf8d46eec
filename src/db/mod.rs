//! SQLite persistence for cron job state and dead letters.
//!
//! One pool shared by the scheduler and the dispatcher. The store can reject
//! a write with SQLITE_BUSY under contention; those surface as
//! [`Error::StoreBusy`] and callers retry them with [`retry_on_busy`].

pub mod dead_letter;
pub mod jobs;

pub use dead_letter::{DeadLetter, DeadLetterFilter};

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cron_jobs (
    id              TEXT PRIMARY KEY,
    schedule        TEXT NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1,
    priority        TEXT NOT NULL DEFAULT 'normal',
    max_attempts    INTEGER,
    timeout_seconds INTEGER,
    payload         TEXT NOT NULL DEFAULT 'null',
    next_run        TEXT,
    last_run        TEXT,
    last_status     TEXT,
    run_count       INTEGER NOT NULL DEFAULT 0,
    error_count     INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id          TEXT PRIMARY KEY,
    origin      TEXT NOT NULL,
    subject     TEXT NOT NULL,
    job_id      TEXT,
    attempts    INTEGER NOT NULL,
    last_error  TEXT NOT NULL,
    item        TEXT NOT NULL,
    failed_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_failed ON dead_letters(failed_at);
CREATE INDEX IF NOT EXISTS idx_dead_letters_subject ON dead_letters(subject);
CREATE INDEX IF NOT EXISTS idx_dead_letters_job ON dead_letters(job_id)
    WHERE job_id IS NOT NULL;
";

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a separate database, so pin one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Backoff policy for storage-contention retries.
#[derive(Debug, Clone)]
pub struct BusyRetry {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Run `op`, retrying with doubling backoff while it fails with
/// [`Error::StoreBusy`]. Any other error, or running out of tries, is
/// returned as is.
pub async fn retry_on_busy<T, F, Fut>(policy: &BusyRetry, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut backoff = policy.base_backoff;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_busy() && attempt < policy.max_attempts => {
                warn!(operation = what, attempt, error = %e, "store busy, retrying");
                metrics::store_busy_retries()
                    .add(1, &[opentelemetry::KeyValue::new("operation", what.to_string())]);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            other => return other,
        }
    }
}

pub(crate) fn parse_column<T>(column: &str, raw: &str) -> Result<T>
where
    T: FromStr<Err = Error>,
{
    raw.parse()
        .map_err(|e: Error| Error::Other(format!("bad {column} column: {e}")))
}
