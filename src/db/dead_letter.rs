//! Dead-letter store: terminal record of work that exhausted its retries.
//!
//! Append and retrieve only. The full work item is kept as JSON alongside a
//! few indexed columns for filtering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::error::{Error, Result};
use crate::model::{JobId, Origin, WorkId, WorkItem};

/// A work item that ended in the `dead` state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: WorkItem,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Filters for listing dead letters. Empty filter lists everything, newest first.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub origin: Option<Origin>,
    pub subject: Option<String>,
    pub job_id: Option<JobId>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl super::Db {
    /// Record a dead item. Recording the same item twice keeps the latest.
    pub async fn record_dead_letter(&self, item: &WorkItem, last_error: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO dead_letters (id, origin, subject, job_id, attempts, last_error, item, failed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(item.id.to_string())
        .bind(item.origin.as_str())
        .bind(&item.subject)
        .bind(item.job_id.as_ref().map(JobId::as_str))
        .bind(i64::from(item.attempts))
        .bind(last_error)
        .bind(serde_json::to_string(item)?)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_dead_letter(&self, id: WorkId) -> Result<DeadLetter> {
        let row: Option<DeadLetterRow> = sqlx::query_as(
            "SELECT item, last_error, failed_at FROM dead_letters WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?
            .try_into_dead_letter()
    }

    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT item, last_error, failed_at FROM dead_letters WHERE 1 = 1");

        if let Some(origin) = filter.origin {
            qb.push(" AND origin = ").push_bind(origin.as_str());
        }
        if let Some(ref subject) = filter.subject {
            qb.push(" AND subject = ").push_bind(subject.clone());
        }
        if let Some(ref job_id) = filter.job_id {
            qb.push(" AND job_id = ").push_bind(job_id.0.clone());
        }
        if let Some(since) = filter.since {
            qb.push(" AND failed_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY failed_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit.max(0));
        }

        let rows: Vec<DeadLetterRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(DeadLetterRow::try_into_dead_letter)
            .collect()
    }

    /// Delete a dead letter. Returns whether it existed.
    pub async fn purge_dead_letter(&self, id: WorkId) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    pub async fn count_dead_letters(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    item: String,
    last_error: String,
    failed_at: DateTime<Utc>,
}

impl DeadLetterRow {
    fn try_into_dead_letter(self) -> Result<DeadLetter> {
        Ok(DeadLetter {
            item: serde_json::from_str(&self.item)?,
            last_error: self.last_error,
            failed_at: self.failed_at,
        })
    }
}
