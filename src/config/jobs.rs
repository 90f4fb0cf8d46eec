//! Cron job definitions loaded from TOML.
//!
//! ```toml
//! [[job]]
//! id = "morning-digest"
//! schedule = "0 9 * * *"
//! priority = "high"
//! timeout_seconds = 120
//! payload = { command = "bin/digest", args = ["--daily"] }
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::engine::JobSchedule;
use crate::error::{Error, Result};
use crate::model::{CronJob, Priority};

#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default)]
    job: Vec<JobDef>,
}

#[derive(Debug, Deserialize)]
struct JobDef {
    id: String,
    schedule: String,
    #[serde(default = "enabled_default")]
    enabled: bool,
    #[serde(default)]
    priority: Priority,
    max_attempts: Option<u32>,
    timeout_seconds: Option<u64>,
    #[serde(default)]
    payload: serde_json::Value,
}

fn enabled_default() -> bool {
    true
}

impl JobDef {
    fn into_job(self) -> CronJob {
        let mut job = CronJob::new(self.id, self.schedule)
            .payload(self.payload)
            .priority(self.priority)
            .enabled(self.enabled);
        job.max_attempts = self.max_attempts;
        job.timeout_seconds = self.timeout_seconds;
        job
    }
}

/// Parse job definitions, rejecting unparsable schedules and duplicate ids.
pub fn parse_jobs(content: &str) -> Result<Vec<CronJob>> {
    let file: JobFile =
        toml::from_str(content).map_err(|e| Error::Config(format!("bad job file: {e}")))?;

    let mut jobs: Vec<CronJob> = Vec::with_capacity(file.job.len());
    for def in file.job {
        def.schedule.parse::<JobSchedule>()?;
        if jobs.iter().any(|j| j.id.as_str() == def.id) {
            return Err(Error::Config(format!("duplicate job id {:?}", def.id)));
        }
        jobs.push(def.into_job());
    }
    Ok(jobs)
}

/// Read and parse a job file.
pub fn load_jobs_file(path: &Path) -> Result<Vec<CronJob>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read job file {}: {e}", path.display()))
    })?;
    parse_jobs(&content).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_job_tables() {
        let jobs = parse_jobs(
            r#"
            [[job]]
            id = "digest"
            schedule = "0 9 * * *"
            priority = "high"
            timeout_seconds = 120
            payload = { command = "bin/digest", args = ["--daily"] }

            [[job]]
            id = "heartbeat"
            schedule = "@every 90s"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].priority, Priority::High);
        assert_eq!(jobs[0].timeout_seconds, Some(120));
        assert_eq!(
            jobs[0].payload,
            json!({"command": "bin/digest", "args": ["--daily"]})
        );
        assert!(!jobs[1].enabled);
        assert_eq!(jobs[1].payload, serde_json::Value::Null);
    }

    #[test]
    fn rejects_invalid_schedule() {
        let err = parse_jobs("[[job]]\nid = \"x\"\nschedule = \"whenever\"\n").unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule { .. }));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = parse_jobs(
            "[[job]]\nid = \"x\"\nschedule = \"@every 1m\"\n[[job]]\nid = \"x\"\nschedule = \"@every 2m\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_file_has_no_jobs() {
        assert!(parse_jobs("").unwrap().is_empty());
    }
}
