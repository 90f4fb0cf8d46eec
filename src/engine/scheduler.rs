//! Cron scheduler: turns persisted job definitions into queued work.
//!
//! One loop. Each pass reloads enabled jobs, fires every job whose next slot
//! has arrived (in job-id order), then sleeps until the earliest upcoming slot,
//! a job-definition change, a shutdown request, or the idle poll interval.
//! Missed slots (downtime, long sleeps) collapse into one firing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Admission, CronOutcome, Dispatcher};
use super::schedule::JobSchedule;
use crate::db::{BusyRetry, Db, retry_on_busy};
use crate::error::Result;
use crate::event::EventKind;
use crate::model::{CronJob, JobStatus, NewWorkItem, Origin, cron_dedup_key};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest sleep when no job is due sooner.
    pub idle_poll: Duration,
    /// Pause after the job store fails to load, and between attempts to
    /// record cron outcomes the store rejected as busy.
    pub error_backoff: Duration,
    pub busy_retry: BusyRetry,
    /// When set, cron firings are charged to this rate-limit identity.
    /// Otherwise they bypass the limiter.
    pub rate_limit_identity: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(300),
            error_backoff: Duration::from_secs(5),
            busy_retry: BusyRetry::default(),
            rate_limit_identity: None,
        }
    }
}

/// What the scheduler loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Recomputing,
    Firing,
    IdleWaiting,
    Stopped,
}

/// A job paired with its parsed schedule.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job: CronJob,
    pub schedule: JobSchedule,
}

impl ScheduledJob {
    /// Next slot the job owes. Jobs that never ran use the cached anchor.
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        match self.job.last_run {
            Some(last) => self.schedule.next_after(last),
            None => self.job.next_run,
        }
    }
}

/// Jobs due at `now` with the slot each should fire for, in job-id order.
pub fn due_jobs(jobs: &[ScheduledJob], now: DateTime<Utc>) -> Vec<(usize, DateTime<Utc>)> {
    let mut due: Vec<(usize, DateTime<Utc>)> = jobs
        .iter()
        .enumerate()
        .filter_map(|(i, job)| {
            let first = job.fire_at()?;
            (first <= now).then(|| (i, job.schedule.latest_due(first, now)))
        })
        .collect();
    due.sort_by(|a, b| jobs[a.0].job.id.cmp(&jobs[b.0].job.id));
    due
}

/// Earliest upcoming slot across `jobs`.
pub fn next_wake(jobs: &[ScheduledJob]) -> Option<DateTime<Utc>> {
    jobs.iter().filter_map(ScheduledJob::fire_at).min()
}

/// Longest single sleep; the loop recomputes on waking.
const MAX_SLEEP: Duration = Duration::from_secs(86_400);

fn sleep_deadline(now: tokio::time::Instant, sleep_for: Duration) -> tokio::time::Instant {
    now + sleep_for.min(MAX_SLEEP)
}

pub struct CronScheduler {
    db: Arc<Db>,
    dispatcher: Dispatcher,
    config: SchedulerConfig,
}

/// Control handle for a running scheduler.
pub struct SchedulerHandle {
    shutdown: Arc<Notify>,
    jobs_changed: Arc<Notify>,
    phase: watch::Receiver<SchedulerPhase>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Wake the loop to reload job definitions.
    pub fn notify_jobs_changed(&self) {
        self.jobs_changed.notify_one();
    }

    pub fn phase(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase.clone()
    }

    /// Stop the loop. Work already queued is left to the dispatcher.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(error = %e, "scheduler ended abnormally");
        }
    }
}

impl CronScheduler {
    pub fn new(db: Arc<Db>, dispatcher: Dispatcher, config: SchedulerConfig) -> Self {
        Self {
            db,
            dispatcher,
            config,
        }
    }

    pub fn start(self) -> SchedulerHandle {
        let shutdown = Arc::new(Notify::new());
        let jobs_changed = Arc::new(Notify::new());
        let (phase_tx, phase) = watch::channel(SchedulerPhase::Recomputing);
        let outcomes = self.dispatcher.register_cron_listener();

        let join = tokio::spawn(self.run(
            Arc::clone(&shutdown),
            Arc::clone(&jobs_changed),
            phase_tx,
            outcomes,
        ));

        SchedulerHandle {
            shutdown,
            jobs_changed,
            phase,
            join,
        }
    }

    async fn run(
        self,
        shutdown: Arc<Notify>,
        jobs_changed: Arc<Notify>,
        phase: watch::Sender<SchedulerPhase>,
        mut outcomes: mpsc::UnboundedReceiver<CronOutcome>,
    ) {
        info!("cron scheduler started");
        // Outcomes the store refused under contention, oldest first.
        let mut unrecorded: VecDeque<CronOutcome> = VecDeque::new();
        loop {
            phase.send_replace(SchedulerPhase::Recomputing);
            self.flush_outcomes(&mut unrecorded).await;
            let sleep_for = match self.tick(&phase, Utc::now()).await {
                Ok(Some(wake)) => (wake - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.config.idle_poll),
                Ok(None) => self.config.idle_poll,
                Err(e) => {
                    error!(error = %e, "scheduler pass failed");
                    self.config.error_backoff
                }
            };

            phase.send_replace(SchedulerPhase::IdleWaiting);
            debug!(sleep_ms = sleep_for.as_millis() as u64, "scheduler idle");
            let deadline = sleep_deadline(tokio::time::Instant::now(), sleep_for);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        self.flush_outcomes(&mut unrecorded).await;
                        if !unrecorded.is_empty() {
                            error!(count = unrecorded.len(), "cron outcomes lost at shutdown");
                        }
                        phase.send_replace(SchedulerPhase::Stopped);
                        info!("cron scheduler stopped");
                        return;
                    }
                    _ = jobs_changed.notified() => {
                        debug!("job definitions changed");
                        break;
                    }
                    Some(outcome) = outcomes.recv() => {
                        unrecorded.push_back(outcome);
                        self.flush_outcomes(&mut unrecorded).await;
                    }
                    _ = tokio::time::sleep(self.config.error_backoff), if !unrecorded.is_empty() => {
                        self.flush_outcomes(&mut unrecorded).await;
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }
    }

    /// One pass: load, fire what is due, return the next wake instant.
    async fn tick(
        &self,
        phase: &watch::Sender<SchedulerPhase>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let policy = &self.config.busy_retry;
        let loaded = retry_on_busy(policy, "list_enabled_jobs", || self.db.list_enabled_jobs()).await?;

        let mut jobs = Vec::with_capacity(loaded.len());
        for job in loaded {
            match job.schedule.parse::<JobSchedule>() {
                Ok(schedule) => jobs.push(ScheduledJob { job, schedule }),
                Err(e) => self.mark_invalid(&job, &e.to_string()).await,
            }
        }

        // Anchor jobs that have never run so their first slot is stable.
        for scheduled in jobs.iter_mut().filter(|s| s.job.last_run.is_none() && s.job.next_run.is_none()) {
            let anchor = scheduled.schedule.next_after(now);
            let id = &scheduled.job.id;
            retry_on_busy(policy, "set_job_next_run", || self.db.set_job_next_run(id, anchor)).await?;
            scheduled.job.next_run = anchor;
        }

        let due = due_jobs(&jobs, now);
        if !due.is_empty() {
            phase.send_replace(SchedulerPhase::Firing);
        }
        for (index, slot) in due {
            let scheduled = &mut jobs[index];
            let next = scheduled.schedule.next_after(slot);
            self.fire(&scheduled.job, slot);

            let id = &scheduled.job.id;
            retry_on_busy(policy, "record_job_fire", || self.db.record_job_fire(id, slot, next)).await?;
            scheduled.job.last_run = Some(slot);
            scheduled.job.next_run = next;
        }

        Ok(next_wake(&jobs))
    }

    fn fire(&self, job: &CronJob, slot: DateTime<Utc>) -> Admission {
        let mut new = NewWorkItem::new(Origin::CronJob, format!("cron:{}", job.id))
            .payload(job.payload.clone())
            .priority(job.priority)
            .dedup_key(cron_dedup_key(&job.id, slot))
            .job(job.id.clone());
        if let Some(n) = job.max_attempts {
            new = new.max_attempts(n);
        }
        if let Some(secs) = job.timeout_seconds {
            new = new.timeout(Duration::from_secs(secs));
        }

        let admission = match self.config.rate_limit_identity {
            Some(ref identity) => self.dispatcher.submit(new.identity(identity.clone())),
            None => self.dispatcher.submit_system(new),
        };

        let (result, work_id) = match admission {
            Admission::Accepted(id) => ("enqueued", Some(id)),
            Admission::Duplicate => ("duplicate", None),
            Admission::RateLimited | Admission::Closed => ("rejected", None),
        };
        info!(job_id = %job.id, %slot, result, "cron fired");
        metrics::cron_fired().add(1, &[KeyValue::new("result", result)]);
        self.dispatcher.emit(EventKind::CronFired {
            job_id: job.id.clone(),
            slot,
            work_id,
        });
        admission
    }

    async fn mark_invalid(&self, job: &CronJob, reason: &str) {
        warn!(job_id = %job.id, schedule = %job.schedule, reason, "invalid schedule, skipping job");
        if job.last_status == Some(JobStatus::InvalidSchedule) {
            return;
        }
        let status = retry_on_busy(&self.config.busy_retry, "record_job_outcome", || {
            self.db.record_job_outcome(&job.id, JobStatus::InvalidSchedule)
        })
        .await;
        if let Err(e) = status {
            error!(job_id = %job.id, error = %e, "failed to mark invalid schedule");
        }
    }

    /// Write queued outcomes in arrival order. Stops at the first one the
    /// store is still too busy to take; later outcomes wait behind it so a
    /// job's status is never overwritten by an older one.
    async fn flush_outcomes(&self, unrecorded: &mut VecDeque<CronOutcome>) {
        while let Some(outcome) = unrecorded.front() {
            debug!(job_id = %outcome.job_id, work_id = %outcome.work_id, status = outcome.status.as_str(), "cron work settled");
            let recorded = retry_on_busy(&self.config.busy_retry, "record_job_outcome", || {
                self.db.record_job_outcome(&outcome.job_id, outcome.status)
            })
            .await;
            match recorded {
                Ok(()) => {}
                Err(e) if e.is_busy() => {
                    warn!(job_id = %outcome.job_id, pending = unrecorded.len(), error = %e, "store busy, cron outcome deferred");
                    return;
                }
                Err(e) => {
                    error!(job_id = %outcome.job_id, error = %e, "failed to record cron outcome");
                }
            }
            unrecorded.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DispatchConfig, WorkerPool, executor_fn};
    use crate::model::ExecOutcome;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn job(id: &str, schedule: &str, last_run: Option<DateTime<Utc>>) -> ScheduledJob {
        let mut job = CronJob::new(id, schedule);
        job.last_run = last_run;
        ScheduledJob {
            schedule: schedule.parse().unwrap(),
            job,
        }
    }

    #[test]
    fn simultaneous_jobs_fire_in_id_order_then_wake_at_soonest() {
        let now = t0();
        let mut jobs = vec![
            job("b-report", "@every 90s", Some(now - chrono::Duration::seconds(90))),
            job("a-ping", "@every 60s", Some(now - chrono::Duration::seconds(60))),
        ];

        let due = due_jobs(&jobs, now);
        let fired: Vec<&str> = due.iter().map(|(i, _)| jobs[*i].job.id.as_str()).collect();
        assert_eq!(fired, vec!["a-ping", "b-report"]);
        assert!(due.iter().all(|(_, slot)| *slot == now));

        for (i, slot) in due {
            jobs[i].job.last_run = Some(slot);
        }
        assert!(due_jobs(&jobs, now).is_empty());
        assert_eq!(next_wake(&jobs), Some(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn long_downtime_fires_once_for_latest_slot() {
        let now = t0();
        let jobs = vec![job("ping", "@every 60s", Some(now - chrono::Duration::minutes(30)))];
        let due = due_jobs(&jobs, now);
        assert_eq!(due, vec![(0, now)]);
    }

    #[test]
    fn never_run_job_waits_for_its_anchor() {
        let now = t0();
        let mut jobs = vec![job("ping", "@every 60s", None)];
        assert!(due_jobs(&jobs, now).is_empty());
        assert_eq!(next_wake(&jobs), None);

        jobs[0].job.next_run = Some(now + chrono::Duration::seconds(60));
        assert_eq!(next_wake(&jobs), Some(now + chrono::Duration::seconds(60)));
        assert_eq!(due_jobs(&jobs, now + chrono::Duration::seconds(61)).len(), 1);
    }

    #[test]
    fn per_second_cron_after_a_month_down_fires_once() {
        let now = t0();
        let mut jobs = vec![job("tick", "* * * * * *", Some(now - chrono::Duration::days(30)))];

        let due = due_jobs(&jobs, now);
        assert_eq!(due, vec![(0, now)]);

        jobs[0].job.last_run = Some(due[0].1);
        assert!(due_jobs(&jobs, now).is_empty());
        assert!(next_wake(&jobs).is_some_and(|wake| wake > now));
    }

    #[test]
    fn sleep_is_capped() {
        let now = tokio::time::Instant::now();
        assert_eq!(sleep_deadline(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(sleep_deadline(now, Duration::MAX), now + MAX_SLEEP);
    }

    #[tokio::test]
    async fn second_wake_for_the_same_slot_is_a_duplicate() {
        let db = Arc::new(Db::in_memory().await.unwrap());
        let dispatcher = Dispatcher::new(Arc::clone(&db), DispatchConfig::default());
        let mut events = dispatcher.subscribe();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let executor = executor_fn(move |_item| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ExecOutcome::success()
            }
        });
        let pool = WorkerPool::with_size(dispatcher.clone(), Arc::new(executor), 2);

        let scheduler = CronScheduler::new(db, dispatcher.clone(), SchedulerConfig::default());
        let job = CronJob::new("digest", "*/5 * * * *");
        let slot = t0();

        assert!(scheduler.fire(&job, slot).is_accepted());
        assert_eq!(scheduler.fire(&job, slot), Admission::Duplicate);

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = events.recv().await
                    && matches!(event.kind, EventKind::WorkSucceeded { .. })
                {
                    return;
                }
            }
        })
        .await;
        assert!(settled.is_ok(), "fired work never settled");

        pool.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
