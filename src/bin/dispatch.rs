//! dispatch CLI: operator interface to the dispatch core.

use dispatch_rs::config::{Config, load_jobs_file};
use dispatch_rs::db::{DeadLetterFilter, Db};
use dispatch_rs::engine::{
    Admission, CommandExecutor, CronScheduler, Dispatcher, Executor, WorkerPool, executor_fn,
};
use dispatch_rs::event::EventKind;
use dispatch_rs::model::{CronJob, ExecOutcome, JobId, NewWorkItem, Origin, Priority, WorkId};
use dispatch_rs::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser)]
#[command(name = "dispatch", about = "Task dispatch core: queue, workers and cron")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher, worker pool and cron scheduler until Ctrl-C
    Serve {
        /// TOML file of [[job]] definitions to upsert before starting
        #[arg(long)]
        jobs: Option<PathBuf>,
        /// Worker pool size (overrides DISPATCH_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Admit one item and run it to completion in a local dispatcher
    Submit {
        /// Subject (conversation, channel) the work belongs to
        subject: String,
        /// JSON payload, e.g. '{"command":"echo","args":["hi"]}'
        #[arg(long)]
        payload: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Rate-limit identity (defaults to the subject)
        #[arg(long)]
        identity: Option<String>,
        #[arg(long, default_value = "inbound_message")]
        origin: Origin,
    },
    /// Cron job definitions
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Dead-letter store
    Dead {
        #[command(subcommand)]
        action: DeadAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List all jobs
    List,
    /// Add or replace a job
    Add {
        id: String,
        /// Cron expression or "@every 90s"
        schedule: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        /// Store the job disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a job
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
    /// Upsert every job in a TOML file
    Load { file: PathBuf },
}

#[derive(Subcommand)]
enum DeadAction {
    /// List dead letters, newest first
    List {
        #[arg(long)]
        origin: Option<Origin>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Delete a dead letter
    Purge { id: WorkId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { jobs, workers } => cmd_serve(config, jobs, workers).await,
        Command::Submit {
            subject,
            payload,
            priority,
            identity,
            origin,
        } => cmd_submit(config, subject, payload, priority, identity, origin).await,
        Command::Jobs { action } => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            cmd_jobs(&db, action).await
        }
        Command::Dead { action } => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            cmd_dead(&db, action).await
        }
    }
}

async fn cmd_serve(
    mut config: Config,
    jobs: Option<PathBuf>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let mut telemetry = TelemetryConfig::new("dispatch");
    telemetry.endpoint = config.otel_endpoint.clone();
    telemetry.default_filter = config.log_level.clone();
    let _guard = init_telemetry(telemetry)?;

    if let Some(n) = workers {
        config.dispatch.worker_count = n.max(1);
    }

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    if let Some(path) = jobs {
        let loaded = load_jobs_file(&path)?;
        for job in &loaded {
            db.upsert_job(job).await?;
        }
        info!(count = loaded.len(), file = %path.display(), "jobs loaded");
    }

    let dispatcher = Dispatcher::new(Arc::clone(&db), config.dispatch.clone());
    let pool = WorkerPool::spawn(dispatcher.clone(), Arc::new(CommandExecutor::new()));
    let scheduler =
        CronScheduler::new(Arc::clone(&db), dispatcher.clone(), config.scheduler.clone()).start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    scheduler.shutdown().await;
    pool.shutdown().await;
    let stats = dispatcher.stats();
    info!(
        pending = stats.queue_depth,
        "dispatcher stopped, pending work discarded"
    );
    db.close().await;
    Ok(())
}

async fn cmd_submit(
    mut config: Config,
    subject: String,
    payload: String,
    priority: Priority,
    identity: Option<String>,
    origin: Origin,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload)?;
    config.dispatch.worker_count = 1;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    let dispatcher = Dispatcher::new(Arc::clone(&db), config.dispatch.clone());
    let mut events = dispatcher.subscribe();

    let executor = executor_fn(|item| async move {
        let outcome = CommandExecutor::new().execute(item).await;
        if let ExecOutcome::Succeeded { data: Some(ref data) } = outcome
            && let Some(stdout) = data.get("stdout").and_then(|v| v.as_str())
        {
            print!("{stdout}");
        }
        outcome
    });
    let pool = WorkerPool::spawn(dispatcher.clone(), Arc::new(executor));

    let mut new = NewWorkItem::new(origin, subject)
        .payload(payload)
        .priority(priority);
    if let Some(identity) = identity {
        new = new.identity(identity);
    }

    let id = match dispatcher.submit(new) {
        Admission::Accepted(id) => id,
        other => {
            pool.shutdown().await;
            anyhow::bail!("not admitted: {other:?}");
        }
    };
    println!("Admitted: {id}");

    let result = loop {
        match events.recv().await {
            Ok(event) => match event.kind {
                EventKind::WorkRetrying {
                    id: i,
                    attempt,
                    error,
                    ..
                } if i == id => println!("Attempt {attempt} failed: {error}"),
                EventKind::WorkSucceeded { id: i, attempts, .. } if i == id => {
                    println!("Succeeded after {attempts} attempt(s)");
                    break Ok(());
                }
                EventKind::WorkDead {
                    id: i,
                    attempts,
                    reason,
                } if i == id => {
                    break Err(anyhow::anyhow!(
                        "dead after {attempts} attempt(s): {reason}"
                    ));
                }
                _ => {}
            },
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break Err(anyhow::anyhow!("event stream closed")),
        }
    };

    pool.shutdown().await;
    db.close().await;
    result
}

async fn cmd_jobs(db: &Db, action: JobsAction) -> anyhow::Result<()> {
    match action {
        JobsAction::List => {
            let jobs = db.list_jobs().await?;
            if jobs.is_empty() {
                println!("No jobs defined.");
                return Ok(());
            }
            println!(
                "{:<20}  {:<18}  {:<7}  {:<6}  {:<16}  {:<16}  {:>5}  {:>5}",
                "ID", "SCHEDULE", "ENABLED", "PRI", "LAST RUN", "STATUS", "RUNS", "ERRS"
            );
            println!("{}", "-".repeat(108));
            for job in &jobs {
                println!(
                    "{:<20}  {:<18}  {:<7}  {:<6}  {:<16}  {:<16}  {:>5}  {:>5}",
                    job.id,
                    job.schedule,
                    job.enabled,
                    job.priority,
                    job.last_run
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    job.last_status.map(|s| s.as_str()).unwrap_or("-"),
                    job.run_count,
                    job.error_count,
                );
            }
            println!("\n{} job(s)", jobs.len());
        }
        JobsAction::Add {
            id,
            schedule,
            payload,
            priority,
            max_attempts,
            timeout_seconds,
            disabled,
        } => {
            schedule.parse::<dispatch_rs::engine::JobSchedule>()?;
            let payload = match payload {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::Value::Null,
            };
            let mut job = CronJob::new(id, schedule)
                .payload(payload)
                .priority(priority)
                .enabled(!disabled);
            job.max_attempts = max_attempts;
            job.timeout_seconds = timeout_seconds;
            db.upsert_job(&job).await?;
            println!("Saved: {}", job.id);
        }
        JobsAction::Remove { id } => {
            if db.delete_job(&JobId::new(&id)).await? {
                println!("Removed: {id}");
            } else {
                anyhow::bail!("no job {id:?}");
            }
        }
        JobsAction::Enable { id } => {
            db.set_job_enabled(&JobId::new(&id), true).await?;
            println!("Enabled: {id}");
        }
        JobsAction::Disable { id } => {
            db.set_job_enabled(&JobId::new(&id), false).await?;
            println!("Disabled: {id}");
        }
        JobsAction::Load { file } => {
            let jobs = load_jobs_file(&file)?;
            for job in &jobs {
                db.upsert_job(job).await?;
            }
            println!("Loaded {} job(s) from {}", jobs.len(), file.display());
        }
    }
    Ok(())
}

async fn cmd_dead(db: &Db, action: DeadAction) -> anyhow::Result<()> {
    match action {
        DeadAction::List {
            origin,
            subject,
            limit,
        } => {
            let letters = db
                .list_dead_letters(&DeadLetterFilter {
                    origin,
                    subject,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            if letters.is_empty() {
                println!("No dead letters.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<16}  {:<20}  {:>4}  {:<16}  ERROR",
                "ID", "ORIGIN", "SUBJECT", "TRY", "FAILED"
            );
            println!("{}", "-".repeat(110));
            for letter in &letters {
                let error: String = letter.last_error.chars().take(60).collect();
                println!(
                    "{:<36}  {:<16}  {:<20}  {:>4}  {:<16}  {}",
                    letter.item.id,
                    letter.item.origin,
                    letter.item.subject,
                    letter.item.attempts,
                    letter.failed_at.format("%Y-%m-%d %H:%M"),
                    error
                );
            }
            println!("\n{} dead letter(s)", letters.len());
        }
        DeadAction::Purge { id } => {
            if db.purge_dead_letter(id).await? {
                println!("Purged: {id}");
            } else {
                anyhow::bail!("no dead letter {id}");
            }
        }
    }
    Ok(())
}
