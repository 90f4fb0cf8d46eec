//! Priority queue of pending work, one FIFO sub-queue per tier.
//!
//! `dequeue` scans tiers from urgent to low and claims the oldest eligible
//! item of the first tier that has one. Ordering across tiers is by priority,
//! not arrival. Items waiting out a retry backoff are skipped until their
//! `not_before` passes; a waiting worker sleeps until the earliest such
//! instant or until something new is pushed.
//!
//! The queue also tracks which dedup keys are live (pending or in flight) so
//! that a key never maps to two concurrent items, and keeps a small record
//! per in-flight item for cancellation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::warn;

use crate::model::{Priority, State, WorkId, WorkItem};

/// Result of pushing a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// An item with the same dedup key is already pending or in flight.
    Duplicate(WorkId),
    /// The queue is shutting down.
    Closed,
}

/// What cancel-by-subject touched.
#[derive(Debug, Default)]
pub struct Cancelled {
    /// Pending items removed from the queue.
    pub pending: Vec<WorkItem>,
    /// In-flight items flagged so their outcome is never retried.
    pub in_flight: Vec<WorkId>,
}

impl Cancelled {
    pub fn total(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }
}

struct InFlight {
    subject: String,
    dedup_key: String,
    cancelled: bool,
    abort: Option<AbortHandle>,
}

enum Claim {
    Item(WorkItem),
    /// Nothing eligible yet; the earliest backoff expires at this instant.
    NotBefore(DateTime<Utc>),
    Empty,
}

struct QueueInner {
    tiers: [VecDeque<WorkItem>; Priority::COUNT],
    live: HashMap<String, WorkId>,
    in_flight: HashMap<WorkId, InFlight>,
    closed: bool,
}

impl QueueInner {
    fn claim(&mut self, now: DateTime<Utc>) -> Claim {
        let mut earliest: Option<DateTime<Utc>> = None;

        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|item| item.is_eligible(now)) {
                let Some(mut item) = tier.remove(pos) else {
                    continue;
                };
                if let Err(e) = item.transition(State::InFlight) {
                    warn!(id = %item.id, error = %e, "claiming item in unexpected state");
                    item.state = State::InFlight;
                }
                item.attempts += 1;
                item.not_before = None;
                self.in_flight.insert(
                    item.id,
                    InFlight {
                        subject: item.subject.clone(),
                        dedup_key: item.dedup_key.clone(),
                        cancelled: false,
                        abort: None,
                    },
                );
                return Claim::Item(item);
            }

            for t in tier.iter().filter_map(|item| item.not_before) {
                earliest = Some(earliest.map_or(t, |e| e.min(t)));
            }
        }

        match earliest {
            Some(t) => Claim::NotBefore(t),
            None => Claim::Empty,
        }
    }

    fn depth(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }
}

pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
    available: Notify,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tiers: Default::default(),
                live: HashMap::new(),
                in_flight: HashMap::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Add a newly admitted item at the back of its tier.
    pub fn push(&self, item: WorkItem) -> Push {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Push::Closed;
            }
            if let Some(existing) = inner.live.get(&item.dedup_key) {
                return Push::Duplicate(*existing);
            }
            inner.live.insert(item.dedup_key.clone(), item.id);
            inner.tiers[item.priority.index()].push_back(item);
        }
        self.available.notify_one();
        Push::Queued
    }

    /// Wait for the next eligible item and claim it.
    ///
    /// The claimed item is `InFlight` with `attempts` incremented. Returns
    /// `None` once the queue is closed; pending items are left in place.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait_until = {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                match inner.claim(Utc::now()) {
                    Claim::Item(item) => return Some(item),
                    Claim::NotBefore(t) => Some(t),
                    Claim::Empty => None,
                }
            };

            match wait_until {
                Some(t) => {
                    let delay = (t - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remember how to abort an in-flight execution.
    pub fn attach_abort(&self, id: WorkId, handle: AbortHandle) {
        let mut inner = self.lock();
        match inner.in_flight.get_mut(&id) {
            Some(entry) if entry.cancelled => handle.abort(),
            Some(entry) => entry.abort = Some(handle),
            None => {}
        }
    }

    /// Put a failed in-flight item back for another attempt, keeping its dedup
    /// key live. Returns the item back if it was cancelled meanwhile; the
    /// caller then settles it instead.
    pub fn retry(&self, mut item: WorkItem) -> std::result::Result<(), WorkItem> {
        {
            let mut inner = self.lock();
            let cancelled = inner
                .in_flight
                .get(&item.id)
                .is_some_and(|entry| entry.cancelled);
            if cancelled {
                return Err(item);
            }
            inner.in_flight.remove(&item.id);
            if item.state != State::Retrying
                && let Err(e) = item.transition(State::Retrying)
            {
                warn!(id = %item.id, error = %e, "retrying item in unexpected state");
                item.state = State::Retrying;
            }
            inner.tiers[item.priority.index()].push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Forget an in-flight item that reached a terminal state, releasing its
    /// dedup key. Returns whether it had been cancelled.
    pub fn settle(&self, id: WorkId) -> bool {
        let mut inner = self.lock();
        match inner.in_flight.remove(&id) {
            Some(entry) => {
                if inner.live.get(&entry.dedup_key) == Some(&id) {
                    inner.live.remove(&entry.dedup_key);
                }
                entry.cancelled
            }
            None => false,
        }
    }

    /// Whether cancel-by-subject flagged this in-flight item.
    pub fn is_cancelled(&self, id: WorkId) -> bool {
        self.lock()
            .in_flight
            .get(&id)
            .is_some_and(|entry| entry.cancelled)
    }

    /// Remove pending items for `subject` and flag (and abort) in-flight ones.
    pub fn cancel_subject(&self, subject: &str) -> Cancelled {
        let mut inner = self.lock();
        let mut report = Cancelled::default();

        let QueueInner {
            tiers,
            live,
            in_flight,
            ..
        } = &mut *inner;

        for tier in tiers.iter_mut() {
            let (matching, kept): (VecDeque<_>, VecDeque<_>) =
                tier.drain(..).partition(|item| item.subject == subject);
            *tier = kept;
            for mut item in matching {
                live.remove(&item.dedup_key);
                if let Err(e) = item.transition(State::Cancelled) {
                    warn!(id = %item.id, error = %e, "cancelling item in unexpected state");
                    item.state = State::Cancelled;
                }
                report.pending.push(item);
            }
        }

        for (id, entry) in in_flight.iter_mut() {
            if entry.subject == subject && !entry.cancelled {
                entry.cancelled = true;
                if let Some(handle) = entry.abort.take() {
                    handle.abort();
                }
                report.in_flight.push(*id);
            }
        }

        report
    }

    /// Whether an item with this dedup key is pending or in flight.
    pub fn is_live(&self, dedup_key: &str) -> bool {
        self.lock().live.contains_key(dedup_key)
    }

    /// Pending items, including those waiting out a backoff.
    pub fn depth(&self) -> usize {
        self.lock().depth()
    }

    /// Pending items per tier, urgent first.
    pub fn depth_by_tier(&self) -> [usize; Priority::COUNT] {
        let inner = self.lock();
        std::array::from_fn(|i| inner.tiers[i].len())
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Stop handing out work and wake every blocked `dequeue`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
