//! Epoch supervision.
//!
//! The supervisor runs a fixed set of workers for one epoch. The first worker
//! to finish (or the epoch's cancellation) ends the epoch for all of them:
//! every task is stopped, and the most significant outcome among everything
//! observed while stopping is reported.
//!
//! # Arbitration
//!
//! - The first completion becomes the candidate outcome
//! - A later outcome replaces it only if its [`ExitCause`] ranks strictly higher
//! - Errors that don't become the outcome are logged, never propagated
//! - Tasks still running after the stop timeout are aborted

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, ExitCause};
use crate::task::{TaskHandle, TaskResult, Worker};

/// Default bound on how long stopping tasks may take.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Tasks still running this long after being stopped are aborted.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Runs one epoch's workers and arbitrates their outcome.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    config: SupervisorConfig,
}

/// The outcome currently speaking for the epoch.
struct Candidate {
    /// Task that produced it; `None` for external cancellation.
    task: Option<String>,
    result: TaskResult,
    cause: ExitCause,
}

impl Candidate {
    fn new(task: Option<String>, result: TaskResult) -> Self {
        let cause = ExitCause::of(&result);
        Self {
            task,
            result,
            cause,
        }
    }

    /// Fold in an outcome observed after the candidate was chosen.
    fn consider(&mut self, task: &str, result: TaskResult) {
        let cause = ExitCause::of(&result);
        if cause > self.cause {
            if let Err(e) = &self.result {
                warn!(task = ?self.task, error = %e, "Task error superseded");
            }
            debug!(task = %task, cause = %cause, previous = %self.cause, "Outcome replaced");
            *self = Candidate::new(Some(task.to_string()), result);
        } else if let Err(e) = result {
            warn!(task = %task, error = %e, "Task failed while stopping");
        }
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run `workers` until one finishes or `cancel` fires, then stop them all.
    pub async fn run(&self, workers: Vec<Box<dyn Worker>>, cancel: &CancellationToken) -> TaskResult {
        let epoch = cancel.child_token();
        let tasks: Vec<TaskHandle> = workers
            .into_iter()
            .map(|w| TaskHandle::spawn(w, &epoch))
            .collect();

        info!(
            count = tasks.len(),
            tasks = ?tasks.iter().map(TaskHandle::name).collect::<Vec<_>>(),
            "Epoch started"
        );

        // Fan-in: every completion lands here, first one included.
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (index, task) in tasks.iter().enumerate() {
            let waiter = task.waiter();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = waiter.wait().await;
                let _ = tx.send((index, result));
            });
        }
        drop(tx);

        let mut finished = vec![false; tasks.len()];

        let mut candidate = tokio::select! {
            biased;
            Some((index, result)) = rx.recv() => {
                finished[index] = true;
                info!(task = %tasks[index].name(), ok = result.is_ok(), "Task finished, ending epoch");
                Candidate::new(Some(tasks[index].name().to_string()), result)
            }
            _ = cancel.cancelled() => {
                info!("Epoch cancelled");
                Candidate::new(None, Ok(()))
            }
        };

        for task in &tasks {
            task.stop();
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        while finished.iter().any(|done| !done) {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((index, result))) => {
                    finished[index] = true;
                    candidate.consider(tasks[index].name(), result);
                }
                Ok(None) | Err(_) => break,
            }
        }

        for (task, done) in tasks.iter().zip(&finished) {
            if *done {
                continue;
            }
            warn!(
                task = %task.name(),
                timeout = ?self.config.stop_timeout,
                "Task ignored stop, aborting"
            );
            task.abort();
            candidate.consider(
                task.name(),
                Err(AgentError::StopTimeout {
                    task: task.name().to_string(),
                    timeout: self.config.stop_timeout,
                }),
            );
        }

        info!(cause = %candidate.cause, task = ?candidate.task, "Epoch finished");
        candidate.result
    }
}
