//! Schedule expressions for cron jobs.
//!
//! Accepts standard 5-field cron (a seconds field of `0` is prepended),
//! the 6/7-field syntax of the `cron` crate, and fixed intervals written
//! `@every 90s` or `every 5m`. All instants are UTC.

use chrono::{DateTime, Duration, Utc};
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum JobSchedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl JobSchedule {
    /// First fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Cron(schedule) => schedule.after(&after).next(),
            JobSchedule::Every(interval) => after.checked_add_signed(*interval),
        }
    }

    /// Most recent slot at or before `now`, given the earliest owed slot
    /// `first`. Missed slots collapse into this one.
    pub fn latest_due(&self, first: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        if first >= now {
            return first;
        }
        match self {
            JobSchedule::Every(interval) => {
                let step = interval.num_milliseconds().max(1);
                let missed = (now - first).num_milliseconds() / step;
                first + Duration::milliseconds(step * missed)
            }
            // Search backwards from just past `now`; sub-second `now` can put
            // the first step back one slot ahead of it.
            JobSchedule::Cron(schedule) => schedule
                .after(&(now + Duration::seconds(1)))
                .rev()
                .take(2)
                .find(|t| *t <= now)
                .filter(|t| *t >= first)
                .unwrap_or(first),
        }
    }
}

impl FromStr for JobSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let expr = s.trim();
        let invalid = |reason: String| Error::InvalidSchedule {
            schedule: s.to_string(),
            reason,
        };

        if let Some(rest) = expr
            .strip_prefix("@every")
            .or_else(|| expr.strip_prefix("every "))
        {
            return parse_interval(rest.trim())
                .map(JobSchedule::Every)
                .map_err(invalid);
        }

        let fields = expr.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {expr}"),
            6 | 7 => expr.to_string(),
            n => return Err(invalid(format!("expected 5-7 fields, got {n}"))),
        };

        cron::Schedule::from_str(&normalized)
            .map(|schedule| JobSchedule::Cron(Box::new(schedule)))
            .map_err(|e| invalid(e.to_string()))
    }
}

fn parse_interval(raw: &str) -> std::result::Result<Duration, String> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: i64 = digits
        .parse()
        .map_err(|_| format!("bad interval {raw:?}"))?;
    let interval = match unit.trim() {
        "" | "s" | "sec" | "secs" => Duration::try_seconds(n),
        "m" | "min" | "mins" => Duration::try_minutes(n),
        "h" | "hr" | "hrs" => Duration::try_hours(n),
        "d" | "day" | "days" => Duration::try_days(n),
        other => return Err(format!("unknown interval unit {other:?}")),
    }
    .ok_or_else(|| format!("interval {raw:?} out of range"))?;
    if interval <= Duration::zero() {
        return Err("interval must be positive".to_string());
    }
    Ok(interval)
}
