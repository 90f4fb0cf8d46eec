//! Execution backends.
//!
//! The core never interprets payloads; it hands each claimed item to an
//! [`Executor`] and records whatever outcome comes back.

use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::model::{ExecOutcome, WorkItem};

/// Runs one attempt of a work item.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, item: WorkItem) -> ExecOutcome;
}

/// Adapter turning an async closure into an [`Executor`].
pub struct FnExecutor<F>(F);

/// Wrap `f` as an executor.
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecOutcome> + Send + 'static,
{
    FnExecutor(f)
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecOutcome> + Send + 'static,
{
    async fn execute(&self, item: WorkItem) -> ExecOutcome {
        (self.0)(item).await
    }
}

/// Payload shape understood by [`CommandExecutor`].
#[derive(Debug, Deserialize)]
struct CommandPayload {
    command: PathBuf,
    #[serde(default)]
    args: Vec<String>,
}

/// Runs the payload's `command` as a child process.
///
/// The child sees `DISPATCH_WORK_ID`, `DISPATCH_ORIGIN`, `DISPATCH_SUBJECT`,
/// `DISPATCH_ATTEMPT` and the full `DISPATCH_PAYLOAD` as JSON. A payload
/// without a command is a terminal failure; a non-zero exit is transient.
/// The child is killed if the attempt is aborted.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    /// Working directory for children. None = inherit.
    pub work_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, item: WorkItem) -> ExecOutcome {
        let spec: CommandPayload = match serde_json::from_value(item.payload.clone()) {
            Ok(spec) => spec,
            Err(e) => return ExecOutcome::terminal(format!("malformed payload: {e}")),
        };

        // Resolve relative commands against the process CWD, not work_dir.
        let command = if spec.command.is_relative() && spec.command.components().count() > 1 {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(&spec.command),
                Err(e) => return ExecOutcome::transient(format!("cannot resolve cwd: {e}")),
            }
        } else {
            spec.command.clone()
        };

        debug!(
            id = %item.id,
            command = %command.display(),
            attempt = item.attempts,
            "running command"
        );

        let mut cmd = Command::new(&command);
        cmd.args(&spec.args)
            .env("DISPATCH_WORK_ID", item.id.to_string())
            .env("DISPATCH_ORIGIN", item.origin.as_str())
            .env("DISPATCH_SUBJECT", &item.subject)
            .env("DISPATCH_ATTEMPT", item.attempts.to_string())
            .env("DISPATCH_PAYLOAD", item.payload.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(ref dir) = self.work_dir {
            cmd.current_dir(dir);
        }

        match cmd.output().await {
            Ok(output) if output.status.success() => {
                ExecOutcome::success_with(serde_json::json!({
                    "stdout": String::from_utf8_lossy(&output.stdout),
                }))
            }
            Ok(output) => ExecOutcome::transient(format!(
                "{} exited with status {}: {}",
                command.display(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Err(e) => ExecOutcome::transient(format!("spawn {}: {e}", command.display())),
        }
    }
}
