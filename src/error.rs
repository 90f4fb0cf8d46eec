//! Error types for dispatch-rs.

use thiserror::Error;

/// SQLite primary/extended result codes that mean "another writer holds the lock".
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// The store rejected a write because another writer holds the lock.
    #[error("store busy: {0}")]
    StoreBusy(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Storage contention, safe to retry after a short backoff.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::StoreBusy(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            if db
                .code()
                .is_some_and(|code| SQLITE_BUSY_CODES.contains(&code.as_ref()))
            {
                return Error::StoreBusy(db.message().to_string());
            }
        }
        Error::Database(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
