//! Dispatch engine: admission gates, the priority queue, workers and the
//! cron scheduler.

pub mod dedup;
pub mod dispatcher;
pub mod executor;
pub mod queue;
pub mod rate_limit;
pub mod schedule;
pub mod scheduler;
pub mod worker;

pub use dedup::DedupIndex;
pub use dispatcher::{
    Admission, CronOutcome, DispatchConfig, DispatchStats, Dispatcher, Settlement,
};
pub use executor::{CommandExecutor, Executor, FnExecutor, executor_fn};
pub use queue::{PriorityQueue, Push};
pub use rate_limit::{RateBucket, RateLimitConfig, RateLimiter};
pub use schedule::JobSchedule;
pub use scheduler::{CronScheduler, SchedulerConfig, SchedulerHandle, SchedulerPhase};
pub use worker::WorkerPool;
