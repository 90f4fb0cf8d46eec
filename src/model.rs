//! Core data model.
//!
//! A work item is one unit of dispatch, whatever its origin. A cron job is a
//! durable, user-editable definition that produces work items on a schedule.

pub mod job;
pub mod work;

pub use job::{CronJob, JobId, JobStatus};
pub use work::{
    ExecOutcome, NewWorkItem, Origin, Priority, State, WorkId, WorkItem, content_dedup_key,
    cron_dedup_key,
};
