//! Structured events emitted by the dispatcher on every admission and state
//! transition.
//!
//! Consumers subscribe to the event stream to build dashboards, alerting,
//! or audit logs. The stream is a broadcast: slow subscribers lag and see a
//! gap in `seq` rather than slowing the dispatcher down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::model::{JobId, Origin, Priority, WorkId};

/// A structured event emitted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkAdmitted {
        id: WorkId,
        origin: Origin,
        priority: Priority,
        subject: String,
    },
    WorkDeduplicated {
        origin: Origin,
        dedup_key: String,
    },
    WorkRateLimited {
        origin: Origin,
        identity: String,
    },
    WorkClaimed {
        id: WorkId,
        attempt: u32,
    },
    WorkSucceeded {
        id: WorkId,
        attempts: u32,
        duration_ms: u64,
    },
    WorkRetrying {
        id: WorkId,
        attempt: u32,
        error: String,
        not_before: Option<DateTime<Utc>>,
    },
    WorkDead {
        id: WorkId,
        attempts: u32,
        reason: String,
    },
    WorkCancelled {
        id: WorkId,
        subject: String,
    },
    WorkRequeued {
        id: WorkId,
    },
    CronFired {
        job_id: JobId,
        slot: DateTime<Utc>,
        /// None when the firing was suppressed as a duplicate.
        work_id: Option<WorkId>,
    },
}

/// Sequenced broadcast sender.
pub(crate) struct EventBus {
    seq: AtomicU64,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
