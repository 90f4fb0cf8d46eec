//! Dispatcher: admission, settlement and operator controls.
//!
//! Submissions pass the rate limiter, then the dedup window, then land in
//! the priority queue. Workers report each attempt back through
//! [`Dispatcher::report`], which decides between success, another attempt
//! after a backoff, and the dead-letter store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::dedup::DedupIndex;
use super::queue::{PriorityQueue, Push};
use super::rate_limit::{RateLimitConfig, RateLimiter};
use crate::db::{BusyRetry, Db, DeadLetter, DeadLetterFilter, retry_on_busy};
use crate::error::Result;
use crate::event::{Event, EventBus, EventKind};
use crate::model::{ExecOutcome, JobId, JobStatus, NewWorkItem, Priority, State, WorkId, WorkItem};
use crate::telemetry::metrics;

/// Configuration for the dispatcher and its worker pool.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent executions allowed.
    pub worker_count: usize,
    /// Used when a submission doesn't set its own.
    pub default_max_attempts: u32,
    /// Per-execution deadline when a submission doesn't set its own.
    pub default_timeout: Duration,
    /// First retry delay. Doubles per attempt up to `retry_backoff_max`.
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub dedup_window: Duration,
    pub rate_limit: RateLimitConfig,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
    /// Retry policy for dead-letter writes.
    pub busy_retry: BusyRetry,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            default_max_attempts: 3,
            default_timeout: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(60),
            dedup_window: Duration::from_secs(60),
            rate_limit: RateLimitConfig::default(),
            event_capacity: 1024,
            busy_retry: BusyRetry::default(),
        }
    }
}

/// Admission decision for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted(WorkId),
    /// Same fingerprint seen within the window, or still pending/in flight.
    Duplicate,
    RateLimited,
    /// The dispatcher is shutting down.
    Closed,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted(_))
    }

    fn as_str(&self) -> &'static str {
        match self {
            Admission::Accepted(_) => "accepted",
            Admission::Duplicate => "duplicate",
            Admission::RateLimited => "rate_limited",
            Admission::Closed => "closed",
        }
    }
}

/// Where an attempt left the item.
#[derive(Debug, Clone)]
pub enum Settlement {
    Succeeded(WorkItem),
    Retrying(WorkItem),
    Dead(WorkItem),
    Cancelled(WorkItem),
}

impl Settlement {
    pub fn item(&self) -> &WorkItem {
        match self {
            Settlement::Succeeded(item)
            | Settlement::Retrying(item)
            | Settlement::Dead(item)
            | Settlement::Cancelled(item) => item,
        }
    }

    pub fn state(&self) -> State {
        self.item().state
    }
}

/// Final status of a cron-originated item, reported back to the scheduler.
#[derive(Debug, Clone)]
pub struct CronOutcome {
    pub job_id: JobId,
    pub work_id: WorkId,
    pub status: JobStatus,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub queue_depth: usize,
    /// Pending items per tier, urgent first.
    pub depth_by_tier: [usize; Priority::COUNT],
    pub in_flight: usize,
    pub active_workers: usize,
    pub worker_count: usize,
    /// Identities currently holding a rate-limit bucket.
    pub rate_limited_identities: usize,
    pub dedup_keys: usize,
}

struct Shared {
    config: DispatchConfig,
    limiter: RateLimiter,
    dedup: DedupIndex,
    queue: PriorityQueue,
    db: Arc<Db>,
    events: EventBus,
    active_workers: AtomicUsize,
    cron_outcomes: Mutex<Option<mpsc::UnboundedSender<CronOutcome>>>,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(db: Arc<Db>, config: DispatchConfig) -> Self {
        let shared = Shared {
            limiter: RateLimiter::new(config.rate_limit.clone()),
            dedup: DedupIndex::new(config.dedup_window),
            queue: PriorityQueue::new(),
            events: EventBus::new(config.event_capacity),
            db,
            active_workers: AtomicUsize::new(0),
            cron_outcomes: Mutex::new(None),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Admit a message-originated submission.
    ///
    /// Checks run in a fixed order: rate limit, dedup window, then the queue's
    /// live-key check. A rate-limited submission consumes nothing from the
    /// dedup window.
    pub fn submit(&self, new: NewWorkItem) -> Admission {
        if !self.shared.limiter.allow(new.rate_identity()) {
            debug!(origin = %new.origin, identity = new.rate_identity(), "rate limited");
            self.shared.events.emit(EventKind::WorkRateLimited {
                origin: new.origin,
                identity: new.rate_identity().to_string(),
            });
            count_admission(new.origin.as_str(), Admission::RateLimited);
            return Admission::RateLimited;
        }
        self.admit(new)
    }

    /// Admit system-originated work without charging the rate limiter.
    pub fn submit_system(&self, new: NewWorkItem) -> Admission {
        self.admit(new)
    }

    fn admit(&self, new: NewWorkItem) -> Admission {
        let origin = new.origin;
        let item = new.into_item(self.shared.config.default_max_attempts);

        if !self.shared.dedup.admit(&item.dedup_key) {
            debug!(origin = %origin, dedup_key = %item.dedup_key, "duplicate within window");
            self.shared.events.emit(EventKind::WorkDeduplicated {
                origin,
                dedup_key: item.dedup_key,
            });
            count_admission(origin.as_str(), Admission::Duplicate);
            return Admission::Duplicate;
        }

        let (id, priority, subject, dedup_key) = (
            item.id,
            item.priority,
            item.subject.clone(),
            item.dedup_key.clone(),
        );
        let admission = match self.shared.queue.push(item) {
            Push::Queued => {
                info!(%id, origin = %origin, %priority, subject = %subject, "work admitted");
                self.shared.events.emit(EventKind::WorkAdmitted {
                    id,
                    origin,
                    priority,
                    subject,
                });
                Admission::Accepted(id)
            }
            Push::Duplicate(existing) => {
                debug!(%existing, dedup_key = %dedup_key, "duplicate of live item");
                self.shared.events.emit(EventKind::WorkDeduplicated { origin, dedup_key });
                Admission::Duplicate
            }
            Push::Closed => {
                self.shared.dedup.forget(&dedup_key);
                Admission::Closed
            }
        };
        count_admission(origin.as_str(), admission);
        admission
    }

    /// Settle one attempt of an in-flight item.
    ///
    /// Succeeded items are done. Failures are retried after a backoff while
    /// the failure is retryable and attempts remain; otherwise the item is
    /// written to the dead-letter store. Items cancelled while running end
    /// as `Cancelled` whatever the outcome.
    pub async fn report(&self, mut item: WorkItem, outcome: ExecOutcome) -> Result<Settlement> {
        let id = item.id;
        let (error, retryable) = match outcome {
            ExecOutcome::Succeeded { .. } => {
                self.shared.queue.settle(id);
                item.transition(State::Succeeded)?;
                info!(%id, attempts = item.attempts, "work succeeded");
                self.shared.events.emit(EventKind::WorkSucceeded {
                    id,
                    attempts: item.attempts,
                    duration_ms: elapsed_ms(&item),
                });
                self.notify_cron(&item, JobStatus::Succeeded);
                return Ok(Settlement::Succeeded(item));
            }
            ExecOutcome::Failed { error, retryable } => (error, retryable),
            ExecOutcome::TimedOut => (
                format!(
                    "timed out after {}ms",
                    item.timeout(self.shared.config.default_timeout).as_millis()
                ),
                true,
            ),
        };
        item.last_error = Some(error.clone());

        if self.shared.queue.is_cancelled(id) {
            return Ok(self.settle_cancelled(item));
        }

        if retryable && item.attempts < item.max_attempts {
            let delay = self.backoff(item.attempts);
            item.not_before = (!delay.is_zero())
                .then(|| chrono::Duration::from_std(delay).ok())
                .flatten()
                .and_then(|d| Utc::now().checked_add_signed(d));
            item.transition(State::Retrying)?;
            let snapshot = item.clone();
            return match self.shared.queue.retry(item) {
                Ok(()) => {
                    warn!(%id, attempt = snapshot.attempts, error = %error, "work failed, retrying");
                    self.shared.events.emit(EventKind::WorkRetrying {
                        id,
                        attempt: snapshot.attempts,
                        error,
                        not_before: snapshot.not_before,
                    });
                    Ok(Settlement::Retrying(snapshot))
                }
                Err(item) => Ok(self.settle_cancelled(item)),
            };
        }

        if self.shared.queue.settle(id) {
            return Ok(self.settle_cancelled_unqueued(item));
        }
        item.transition(State::Dead)?;

        let recorded = retry_on_busy(&self.shared.config.busy_retry, "record_dead_letter", || {
            self.shared.db.record_dead_letter(&item, &error)
        })
        .await;

        error!(%id, attempts = item.attempts, error = %error, "work dead");
        metrics::work_dead_lettered()
            .add(1, &[KeyValue::new("origin", item.origin.as_str())]);
        self.shared.events.emit(EventKind::WorkDead {
            id,
            attempts: item.attempts,
            reason: error,
        });
        self.notify_cron(&item, JobStatus::Failed);

        if let Err(e) = recorded {
            let json = serde_json::to_string(&item).unwrap_or_default();
            error!(%id, error = %e, item = %json, "failed to persist dead letter");
            return Err(e);
        }
        Ok(Settlement::Dead(item))
    }

    fn settle_cancelled(&self, item: WorkItem) -> Settlement {
        self.shared.queue.settle(item.id);
        self.settle_cancelled_unqueued(item)
    }

    fn settle_cancelled_unqueued(&self, mut item: WorkItem) -> Settlement {
        if let Err(e) = item.transition(State::Cancelled) {
            warn!(id = %item.id, error = %e, "cancelling item in unexpected state");
            item.state = State::Cancelled;
        }
        info!(id = %item.id, subject = %item.subject, "in-flight work cancelled");
        self.shared.events.emit(EventKind::WorkCancelled {
            id: item.id,
            subject: item.subject.clone(),
        });
        self.notify_cron(&item, JobStatus::Cancelled);
        Settlement::Cancelled(item)
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.shared.config.retry_backoff;
        let exp = attempts.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exp)
            .min(self.shared.config.retry_backoff_max)
    }

    /// Cancel all pending and in-flight work for `subject`.
    ///
    /// Pending items are removed at once. In-flight executions are aborted
    /// and settle as cancelled when their worker reports. Returns how many
    /// items were affected.
    pub fn cancel_subject(&self, subject: &str) -> usize {
        let report = self.shared.queue.cancel_subject(subject);
        for item in &report.pending {
            self.shared.dedup.forget(&item.dedup_key);
            self.shared.events.emit(EventKind::WorkCancelled {
                id: item.id,
                subject: item.subject.clone(),
            });
            self.notify_cron(item, JobStatus::Cancelled);
        }
        if report.total() > 0 {
            info!(
                subject,
                pending = report.pending.len(),
                in_flight = report.in_flight.len(),
                "cancelled work for subject"
            );
        }
        report.total()
    }

    pub async fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        self.shared.db.list_dead_letters(filter).await
    }

    /// Put a dead item back in the queue with a fresh attempt budget.
    ///
    /// Bypasses the dedup window but not the live-key check: if an item with
    /// the same fingerprint is pending or in flight, this returns `Duplicate`
    /// and the dead letter stays.
    pub async fn requeue_dead(&self, id: WorkId) -> Result<Admission> {
        let policy = &self.shared.config.busy_retry;
        let letter = retry_on_busy(policy, "get_dead_letter", || {
            self.shared.db.get_dead_letter(id)
        })
        .await?;

        let item = letter.item.readmit();
        let origin = item.origin;
        let admission = match self.shared.queue.push(item) {
            Push::Queued => {
                retry_on_busy(policy, "purge_dead_letter", || {
                    self.shared.db.purge_dead_letter(id)
                })
                .await?;
                info!(%id, "dead letter requeued");
                self.shared.events.emit(EventKind::WorkRequeued { id });
                Admission::Accepted(id)
            }
            Push::Duplicate(existing) => {
                warn!(%id, %existing, "requeue refused, fingerprint is live");
                Admission::Duplicate
            }
            Push::Closed => Admission::Closed,
        };
        count_admission(origin.as_str(), admission);
        Ok(admission)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queue_depth: self.shared.queue.depth(),
            depth_by_tier: self.shared.queue.depth_by_tier(),
            in_flight: self.shared.queue.in_flight(),
            active_workers: self.shared.active_workers.load(Ordering::Relaxed),
            worker_count: self.shared.config.worker_count,
            rate_limited_identities: self.shared.limiter.active_identities(),
            dedup_keys: self.shared.dedup.len(),
        }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Route final statuses of cron items to the returned receiver.
    /// Replaces any previous listener.
    pub fn register_cron_listener(&self) -> mpsc::UnboundedReceiver<CronOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .shared
            .cron_outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn notify_cron(&self, item: &WorkItem, status: JobStatus) {
        let Some(ref job_id) = item.job_id else {
            return;
        };
        let guard = self
            .shared
            .cron_outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ref tx) = *guard {
            let _ = tx.send(CronOutcome {
                job_id: job_id.clone(),
                work_id: item.id,
                status,
            });
        }
    }

    /// Stop handing out work. Pending items are left where they are.
    pub fn shutdown(&self) {
        info!("dispatcher closing");
        self.shared.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.shared.queue
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.shared.db
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        self.shared.events.emit(kind);
    }

    /// Mark a worker busy until the returned guard drops.
    pub(crate) fn occupy_slot(&self) -> ActiveSlot {
        self.shared.active_workers.fetch_add(1, Ordering::Relaxed);
        ActiveSlot {
            dispatcher: self.clone(),
        }
    }
}

pub(crate) struct ActiveSlot {
    dispatcher: Dispatcher,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.dispatcher
            .shared
            .active_workers
            .fetch_sub(1, Ordering::Relaxed);
    }
}

fn elapsed_ms(item: &WorkItem) -> u64 {
    (Utc::now() - item.enqueued_at).num_milliseconds().max(0) as u64
}

fn count_admission(origin: &'static str, admission: Admission) {
    metrics::work_admitted().add(
        1,
        &[
            KeyValue::new("origin", origin),
            KeyValue::new("result", admission.as_str()),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Origin;
    use serde_json::json;

    async fn dispatcher(config: DispatchConfig) -> Dispatcher {
        let db = Arc::new(Db::in_memory().await.unwrap());
        Dispatcher::new(db, config)
    }

    fn fast() -> DispatchConfig {
        DispatchConfig {
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_within_window_is_suppressed() {
        let d = dispatcher(fast()).await;
        let msg = || NewWorkItem::inbound("chat-1").payload(json!({"text": "hi"}));
        assert!(d.submit(msg()).is_accepted());
        assert_eq!(d.submit(msg()), Admission::Duplicate);
        assert_eq!(d.stats().queue_depth, 1);
    }

    #[tokio::test]
    async fn rate_limited_submission_does_not_burn_dedup_window() {
        let mut config = fast();
        config.rate_limit.capacity = 1.0;
        config.rate_limit.refill_per_sec = 0.0;
        let d = dispatcher(config).await;

        assert!(d.submit(NewWorkItem::inbound("chat-1").payload(json!(1))).is_accepted());
        let second = NewWorkItem::inbound("chat-1").payload(json!(2));
        assert_eq!(d.submit(second.clone()), Admission::RateLimited);
        // System path skips the limiter; the fingerprint was never recorded.
        assert!(d.submit_system(second).is_accepted());
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let d = dispatcher(DispatchConfig {
            retry_backoff: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(5),
            ..Default::default()
        })
        .await;
        assert_eq!(d.backoff(1), Duration::from_secs(2));
        assert_eq!(d.backoff(2), Duration::from_secs(4));
        assert_eq!(d.backoff(3), Duration::from_secs(5));
        assert_eq!(d.backoff(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn terminal_failure_goes_straight_to_dead_letters() {
        let d = dispatcher(fast()).await;
        d.submit(NewWorkItem::outbound("chat-1").payload(json!({"bad": true})));
        let claimed = d.queue().dequeue().await.unwrap();
        let settled = d
            .report(claimed, ExecOutcome::terminal("malformed payload"))
            .await
            .unwrap();
        assert_eq!(settled.state(), State::Dead);
        assert_eq!(settled.item().attempts, 1);

        let letters = d.dead_letters(&DeadLetterFilter::default()).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].last_error, "malformed payload");
        assert_eq!(letters[0].item.origin, Origin::OutboundMessage);
    }

    #[tokio::test]
    async fn cron_outcomes_reach_listener() {
        let d = dispatcher(fast()).await;
        let mut rx = d.register_cron_listener();
        d.submit_system(
            NewWorkItem::new(Origin::CronJob, "cron:digest").job(JobId::new("digest")),
        );
        let claimed = d.queue().dequeue().await.unwrap();
        d.report(claimed, ExecOutcome::success()).await.unwrap();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.job_id.as_str(), "digest");
        assert_eq!(outcome.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancelled_failure_is_not_retried() {
        let d = dispatcher(fast()).await;
        d.submit(NewWorkItem::inbound("chat-1").payload(json!(1)));
        let claimed = d.queue().dequeue().await.unwrap();
        assert_eq!(d.cancel_subject("chat-1"), 1);

        let settled = d
            .report(claimed, ExecOutcome::transient("aborted"))
            .await
            .unwrap();
        assert_eq!(settled.state(), State::Cancelled);
        assert_eq!(d.stats().queue_depth, 0);
        assert_eq!(d.stats().in_flight, 0);
    }
}
