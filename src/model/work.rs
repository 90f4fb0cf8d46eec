//! Work items: identity, origin, priority tier and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

use super::job::JobId;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of dispatch tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier, assigned at admission.
    pub id: WorkId,

    /// Where this work came from.
    pub origin: Origin,

    /// Priority tier. Lower tiers drain first.
    pub priority: Priority,

    /// Logical subject (conversation, channel, job). Used for cancellation
    /// and as part of the derived dedup key.
    pub subject: String,

    /// Identity the rate limiter charges. None means the subject is used.
    pub identity: Option<String>,

    /// Fingerprint used for duplicate suppression.
    pub dedup_key: String,

    /// Opaque data for the execution backend. The core doesn't interpret it.
    pub payload: serde_json::Value,

    /// Cron job that produced this item, if any.
    pub job_id: Option<JobId>,

    /// Current lifecycle state.
    pub state: State,

    /// Number of executions started so far.
    pub attempts: u32,

    /// Executions allowed before the item goes dead.
    pub max_attempts: u32,

    /// Per-execution deadline. None means the dispatcher default.
    pub timeout_ms: Option<u64>,

    pub enqueued_at: DateTime<Utc>,

    /// Retry backoff: not eligible for dequeue before this instant.
    pub not_before: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl WorkItem {
    /// Move to `to`, rejecting transitions the lifecycle doesn't allow.
    pub fn transition(&mut self, to: State) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Per-execution deadline, falling back to `default`.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Identity charged by the rate limiter.
    pub fn rate_identity(&self) -> &str {
        self.identity.as_deref().unwrap_or(&self.subject)
    }

    /// Whether the retry backoff has elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }

    /// Reset a dead item into a fresh pending lifecycle for an operator retry.
    pub(crate) fn readmit(mut self) -> Self {
        let now = Utc::now();
        self.state = State::Pending;
        self.attempts = 0;
        self.not_before = None;
        self.enqueued_at = now;
        self.updated_at = now;
        self
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(WorkId)
            .map_err(|e| Error::InvalidValue(format!("work id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A chat message arriving from a channel adapter.
    InboundMessage,
    /// A reply or notification on its way out to a channel.
    OutboundMessage,
    /// A scheduled cron firing.
    CronJob,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::InboundMessage => "inbound_message",
            Origin::OutboundMessage => "outbound_message",
            Origin::CronJob => "cron_job",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inbound_message" | "inbound" => Ok(Origin::InboundMessage),
            "outbound_message" | "outbound" => Ok(Origin::OutboundMessage),
            "cron_job" | "cron" => Ok(Origin::CronJob),
            other => Err(Error::InvalidValue(format!("unknown origin: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority tier. Declaration order is drain order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Number of tiers.
    pub const COUNT: usize = 4;

    /// All tiers in drain order.
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Tier index, 0 = drained first.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::InvalidValue(format!("unknown priority: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Admitted, waiting in the queue.
    Pending,
    /// Claimed by a worker and executing.
    InFlight,
    /// Done successfully. Terminal.
    Succeeded,
    /// Failed recoverably, back in the queue for another attempt.
    Retrying,
    /// Exhausted retries or failed terminally; recorded in the dead-letter store. Terminal.
    Dead,
    /// Aborted by cancel-by-subject. Terminal.
    Cancelled,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (Pending, Cancelled)
                | (InFlight, Succeeded)
                | (InFlight, Retrying)
                | (InFlight, Dead)
                | (InFlight, Cancelled)
                | (Retrying, InFlight)
                | (Retrying, Cancelled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Dead | State::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::InFlight => "in_flight",
            State::Succeeded => "succeeded",
            State::Retrying => "retrying",
            State::Dead => "dead",
            State::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "in_flight" => Ok(State::InFlight),
            "succeeded" => Ok(State::Succeeded),
            "retrying" => Ok(State::Retrying),
            "dead" => Ok(State::Dead),
            "cancelled" => Ok(State::Cancelled),
            other => Err(Error::InvalidValue(format!("unknown state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What the execution backend reported for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecOutcome {
    Succeeded {
        /// Arbitrary result data. Opaque to the core.
        data: Option<serde_json::Value>,
    },
    Failed {
        error: String,
        /// False for terminal errors such as a malformed payload.
        retryable: bool,
    },
    /// The per-execution deadline passed.
    TimedOut,
}

impl ExecOutcome {
    pub fn success() -> Self {
        ExecOutcome::Succeeded { data: None }
    }

    pub fn success_with(data: serde_json::Value) -> Self {
        ExecOutcome::Succeeded { data: Some(data) }
    }

    /// A transient failure, retried up to `max_attempts`.
    pub fn transient(error: impl Into<String>) -> Self {
        ExecOutcome::Failed {
            error: error.into(),
            retryable: true,
        }
    }

    /// A terminal failure, dead-lettered immediately.
    pub fn terminal(error: impl Into<String>) -> Self {
        ExecOutcome::Failed {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Succeeded { .. })
    }
}

// ---------------------------------------------------------------------------
// Dedup keys
// ---------------------------------------------------------------------------

/// Fingerprint for message traffic: origin, subject and a payload hash.
pub fn content_dedup_key(origin: Origin, subject: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{origin}:{subject}:{}", hex::encode(hasher.finalize()))
}

/// Fingerprint for a cron firing: job id plus the intended slot.
pub fn cron_dedup_key(job_id: &JobId, slot: DateTime<Utc>) -> String {
    format!("cron:{job_id}:{}", slot.timestamp())
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new work items. The dispatcher's public API for admission.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) origin: Origin,
    pub(crate) subject: String,
    pub(crate) identity: Option<String>,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: Priority,
    pub(crate) dedup_key: Option<String>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) job_id: Option<JobId>,
}

impl NewWorkItem {
    pub fn new(origin: Origin, subject: impl Into<String>) -> Self {
        Self {
            origin,
            subject: subject.into(),
            identity: None,
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            dedup_key: None,
            max_attempts: None,
            timeout: None,
            job_id: None,
        }
    }

    /// Shorthand for an inbound chat message.
    pub fn inbound(subject: impl Into<String>) -> Self {
        Self::new(Origin::InboundMessage, subject)
    }

    /// Shorthand for an outbound chat message.
    pub fn outbound(subject: impl Into<String>) -> Self {
        Self::new(Origin::OutboundMessage, subject)
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the derived content fingerprint.
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Rate-limit identity this submission will be charged to.
    pub fn rate_identity(&self) -> &str {
        self.identity.as_deref().unwrap_or(&self.subject)
    }

    /// Materialize a pending work item.
    pub(crate) fn into_item(self, default_max_attempts: u32) -> WorkItem {
        let now = Utc::now();
        let dedup_key = self
            .dedup_key
            .unwrap_or_else(|| content_dedup_key(self.origin, &self.subject, &self.payload));
        WorkItem {
            id: WorkId::new(),
            origin: self.origin,
            priority: self.priority,
            subject: self.subject,
            identity: self.identity,
            dedup_key,
            payload: self.payload,
            job_id: self.job_id,
            state: State::Pending,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            enqueued_at: now,
            not_before: None,
            updated_at: now,
            last_error: None,
        }
    }
}
