//! Cron job store: definitions plus the runtime fields the scheduler writes back.

use chrono::{DateTime, Utc};

use super::parse_column;
use crate::error::{Error, Result};
use crate::model::{CronJob, JobId, JobStatus, Priority};

impl super::Db {
    /// Insert a job, or update an existing job's definition.
    ///
    /// Runtime fields (`last_run`, counters, status) survive an update. The
    /// cached `next_run` is dropped when the schedule expression changes.
    pub async fn upsert_job(&self, job: &CronJob) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO cron_jobs (id, schedule, enabled, priority, max_attempts, timeout_seconds, payload,
                                    next_run, last_run, last_status, run_count, error_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                schedule = excluded.schedule,
                enabled = excluded.enabled,
                priority = excluded.priority,
                max_attempts = excluded.max_attempts,
                timeout_seconds = excluded.timeout_seconds,
                payload = excluded.payload,
                next_run = CASE WHEN cron_jobs.schedule = excluded.schedule
                                THEN cron_jobs.next_run ELSE NULL END,
                updated_at = excluded.updated_at",
        )
        .bind(job.id.as_str())
        .bind(&job.schedule)
        .bind(job.enabled)
        .bind(job.priority.as_str())
        .bind(job.max_attempts.map(i64::from))
        .bind(job.timeout_seconds.map(|s| s as i64))
        .bind(job.payload.to_string())
        .bind(job.next_run)
        .bind(job.last_run)
        .bind(job.last_status.map(JobStatus::as_str))
        .bind(job.run_count as i64)
        .bind(job.error_count as i64)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<CronJob> {
        let row: Option<CronJobRow> = sqlx::query_as(
            "SELECT id, schedule, enabled, priority, max_attempts, timeout_seconds, payload,
                    next_run, last_run, last_status, run_count, error_count
             FROM cron_jobs WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("cron job {id}")))?
            .try_into_job()
    }

    /// All jobs, ordered by ID.
    pub async fn list_jobs(&self) -> Result<Vec<CronJob>> {
        let rows: Vec<CronJobRow> = sqlx::query_as(
            "SELECT id, schedule, enabled, priority, max_attempts, timeout_seconds, payload,
                    next_run, last_run, last_status, run_count, error_count
             FROM cron_jobs ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(CronJobRow::try_into_job).collect()
    }

    /// Enabled jobs, ordered by ID.
    pub async fn list_enabled_jobs(&self) -> Result<Vec<CronJob>> {
        let rows: Vec<CronJobRow> = sqlx::query_as(
            "SELECT id, schedule, enabled, priority, max_attempts, timeout_seconds, payload,
                    next_run, last_run, last_status, run_count, error_count
             FROM cron_jobs WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(CronJobRow::try_into_job).collect()
    }

    /// Delete a job. Returns whether it existed.
    pub async fn delete_job(&self, id: &JobId) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM cron_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    pub async fn set_job_enabled(&self, id: &JobId, enabled: bool) -> Result<()> {
        let rows = sqlx::query("UPDATE cron_jobs SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        expect_one(rows, id)
    }

    /// Record a firing: `last_run` moves to `slot`, the run counter goes up
    /// and the status is provisionally `queued`.
    pub async fn record_job_fire(
        &self,
        id: &JobId,
        slot: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE cron_jobs
             SET last_run = ?, next_run = ?, run_count = run_count + 1, last_status = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(slot)
        .bind(next_run)
        .bind(JobStatus::Queued.as_str())
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();
        expect_one(rows, id)
    }

    /// Record the final outcome of a firing. `Failed` also bumps `error_count`.
    pub async fn record_job_outcome(&self, id: &JobId, status: JobStatus) -> Result<()> {
        let failed = i64::from(status == JobStatus::Failed);
        let rows = sqlx::query(
            "UPDATE cron_jobs
             SET last_status = ?, error_count = error_count + ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(failed)
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();
        expect_one(rows, id)
    }

    /// Refresh the cached next fire instant.
    pub async fn set_job_next_run(&self, id: &JobId, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let rows = sqlx::query("UPDATE cron_jobs SET next_run = ? WHERE id = ?")
            .bind(next_run)
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        expect_one(rows, id)
    }
}

fn expect_one(rows: u64, id: &JobId) -> Result<()> {
    if rows == 0 {
        Err(Error::NotFound(format!("cron job {id}")))
    } else {
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CronJobRow {
    id: String,
    schedule: String,
    enabled: bool,
    priority: String,
    max_attempts: Option<i64>,
    timeout_seconds: Option<i64>,
    payload: String,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    last_status: Option<String>,
    run_count: i64,
    error_count: i64,
}

impl CronJobRow {
    fn try_into_job(self) -> Result<CronJob> {
        Ok(CronJob {
            id: JobId(self.id),
            schedule: self.schedule,
            enabled: self.enabled,
            priority: parse_column::<Priority>("priority", &self.priority)?,
            max_attempts: self.max_attempts.map(|n| n.max(1) as u32),
            timeout_seconds: self.timeout_seconds.map(|s| s.max(0) as u64),
            payload: serde_json::from_str(&self.payload)?,
            next_run: self.next_run,
            last_run: self.last_run,
            last_status: self
                .last_status
                .as_deref()
                .map(|s| parse_column::<JobStatus>("last_status", s))
                .transpose()?,
            run_count: self.run_count.max(0) as u64,
            error_count: self.error_count.max(0) as u64,
        })
    }
}
