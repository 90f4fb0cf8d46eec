//! Worker pool: a fixed number of loops pulling from the priority queue.
//!
//! The pool size is the concurrency gate. Each attempt runs in its own task
//! under a deadline, so a hung or panicking execution costs one attempt and
//! never the worker slot.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, warn};

use super::dispatcher::{Dispatcher, Settlement};
use super::executor::Executor;
use crate::event::EventKind;
use crate::model::{ExecOutcome, WorkItem};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, record_state_transition, start_work_span};

pub struct WorkerPool {
    dispatcher: Dispatcher,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `config.worker_count` workers.
    pub fn spawn(dispatcher: Dispatcher, executor: Arc<dyn Executor>) -> Self {
        let size = dispatcher.config().worker_count;
        Self::with_size(dispatcher, executor, size)
    }

    pub fn with_size(dispatcher: Dispatcher, executor: Arc<dyn Executor>, size: usize) -> Self {
        let size = size.max(1);
        let workers = (0..size)
            .map(|worker| {
                tokio::spawn(supervise(worker, dispatcher.clone(), Arc::clone(&executor)))
            })
            .collect();
        info!(size, "worker pool started");
        Self {
            dispatcher,
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and wait for every worker to finish its current attempt.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown();
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

/// Keep a worker loop alive across panics.
async fn supervise(worker: usize, dispatcher: Dispatcher, executor: Arc<dyn Executor>) {
    loop {
        let run = tokio::spawn(worker_loop(worker, dispatcher.clone(), Arc::clone(&executor)));
        match run.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                error!(worker, panic = %panic_message(e.into_panic()), "worker panicked, restarting");
            }
            Err(_) => return,
        }
    }
}

async fn worker_loop(worker: usize, dispatcher: Dispatcher, executor: Arc<dyn Executor>) {
    while let Some(item) = dispatcher.queue().dequeue().await {
        run_attempt(worker, &dispatcher, &executor, item).await;
    }
    debug!(worker, "worker stopped");
}

async fn run_attempt(
    worker: usize,
    dispatcher: &Dispatcher,
    executor: &Arc<dyn Executor>,
    item: WorkItem,
) {
    let _slot = dispatcher.occupy_slot();
    let id = item.id;
    let span = start_work_span(item.origin, id, item.attempts);
    let from = if item.attempts > 1 { "retrying" } else { "pending" };
    record_state_transition(&span, from, "in_flight");
    dispatcher.emit(EventKind::WorkClaimed {
        id,
        attempt: item.attempts,
    });

    let deadline = item.timeout(dispatcher.config().default_timeout);
    let started = Instant::now();
    let mut execution = {
        let executor = Arc::clone(executor);
        let item = item.clone();
        tokio::spawn(async move { executor.execute(item).await }.instrument(span.clone()))
    };
    dispatcher.queue().attach_abort(id, execution.abort_handle());

    let outcome = match tokio::time::timeout(deadline, &mut execution).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => joined_failure(worker, e),
        Err(_) => {
            execution.abort();
            warn!(parent: &span, worker, timeout_ms = deadline.as_millis() as u64, "execution timed out");
            ExecOutcome::TimedOut
        }
    };

    let label = outcome_label(&outcome);
    record_outcome(&span, label);
    metrics::execution_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[
            KeyValue::new("origin", item.origin.as_str()),
            KeyValue::new("outcome", label),
        ],
    );

    match dispatcher.report(item, outcome).instrument(span.clone()).await {
        Ok(settlement) => record_state_transition(&span, "in_flight", settlement_label(&settlement)),
        Err(e) => error!(parent: &span, %id, error = %e, "failed to settle work"),
    }
}

fn joined_failure(worker: usize, e: JoinError) -> ExecOutcome {
    if e.is_panic() {
        let message = panic_message(e.into_panic());
        error!(worker, panic = %message, "execution panicked");
        ExecOutcome::transient(format!("execution panicked: {message}"))
    } else {
        ExecOutcome::transient("execution aborted")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn outcome_label(outcome: &ExecOutcome) -> &'static str {
    match outcome {
        ExecOutcome::Succeeded { .. } => "succeeded",
        ExecOutcome::Failed { .. } => "failed",
        ExecOutcome::TimedOut => "timed_out",
    }
}

fn settlement_label(settlement: &Settlement) -> &'static str {
    settlement.state().as_str()
}
