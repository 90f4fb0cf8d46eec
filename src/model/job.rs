//! Cron job definitions and their runtime bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::work::Priority;
use crate::error::{Error, Result};

/// Newtype for cron job IDs. Chosen by whoever defines the job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a job's most recent firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued; outcome not reported yet.
    Queued,
    Succeeded,
    /// Execution exhausted its retries or failed terminally.
    Failed,
    Cancelled,
    /// The schedule expression doesn't parse; the job is skipped.
    InvalidSchedule,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::InvalidSchedule => "invalid_schedule",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "invalid_schedule" => Ok(JobStatus::InvalidSchedule),
            other => Err(Error::InvalidValue(format!("unknown job status: {other}"))),
        }
    }
}

/// A durable, user-editable scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: JobId,

    /// Cron expression or `@every <interval>`.
    pub schedule: String,

    pub enabled: bool,

    /// Priority of the work items this job enqueues.
    pub priority: Priority,

    /// None = dispatcher default.
    pub max_attempts: Option<u32>,

    /// Per-execution deadline. None = dispatcher default.
    pub timeout_seconds: Option<u64>,

    /// Message or action to enqueue on each firing.
    pub payload: serde_json::Value,

    /// Cached next fire instant. Derived from `schedule` and `last_run`; never authoritative.
    pub next_run: Option<DateTime<Utc>>,

    /// Slot of the most recent firing.
    pub last_run: Option<DateTime<Utc>>,

    pub last_status: Option<JobStatus>,

    pub run_count: u64,

    pub error_count: u64,
}

impl CronJob {
    pub fn new(id: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            id: JobId::new(id),
            schedule: schedule.into(),
            enabled: true,
            priority: Priority::Normal,
            max_attempts: None,
            timeout_seconds: None,
            payload: serde_json::Value::Null,
            next_run: None,
            last_run: None,
            last_status: None,
            run_count: 0,
            error_count: 0,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn last_run(mut self, at: DateTime<Utc>) -> Self {
        self.last_run = Some(at);
        self
    }
}
