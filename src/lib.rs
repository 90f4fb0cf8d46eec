//! # dispatch-rs
//!
//! Task dispatch core for a conversational assistant: per-identity rate
//! limiting, duplicate suppression, a tiered priority queue, a bounded worker
//! pool with retries and a dead-letter store, and a cron scheduler feeding the
//! same queue.
//!
//! Job definitions and dead letters persist in SQLite (sqlx); the queue itself
//! lives in memory. Observability is tracing plus OpenTelemetry.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod telemetry;
