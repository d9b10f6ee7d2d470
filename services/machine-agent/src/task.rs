//! Supervised tasks.
//!
//! A [`Worker`] is one responsibility of the agent. Spawning it yields a
//! [`TaskHandle`] that can be stopped any number of times, from any task, and
//! waited on by several observers.

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AgentError;

/// Outcome of a finished task.
pub type TaskResult = Result<(), AgentError>;

/// One long-running responsibility inside a supervision epoch.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Run until done, failed or cancelled.
    ///
    /// Returning `Ok(())` after `cancel` fires is a clean stop.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> TaskResult;
}

/// Handle to a spawned worker.
pub struct TaskHandle {
    name: String,
    cancel: CancellationToken,
    done: watch::Receiver<Option<TaskResult>>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `worker` under a child of `parent`.
    pub fn spawn(worker: Box<dyn Worker>, parent: &CancellationToken) -> Self {
        let name = worker.name().to_string();
        let cancel = parent.child_token();
        let (tx, done) = watch::channel(None);

        let token = cancel.clone();
        let task_name = name.clone();
        let join = tokio::spawn(async move {
            let result = worker.run(token).await;
            debug!(task = %task_name, ok = result.is_ok(), "Task finished");
            let _ = tx.send(Some(result));
        });

        Self {
            name,
            cancel,
            done,
            join,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the task to stop. Calling this on a finished task does nothing.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task's outcome.
    pub async fn wait(&self) -> TaskResult {
        self.waiter().wait().await
    }

    /// A detached observer of this task's outcome.
    pub fn waiter(&self) -> TaskWaiter {
        TaskWaiter {
            done: self.done.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Abort the task immediately.
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Waits for one task's outcome; clonable and independent of the handle.
#[derive(Clone)]
pub struct TaskWaiter {
    done: watch::Receiver<Option<TaskResult>>,
}

impl TaskWaiter {
    pub async fn wait(mut self) -> TaskResult {
        match self.done.wait_for(Option::is_some).await {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| Err(AgentError::fatal("task exited without reporting"))),
            Err(_) => Err(AgentError::fatal("task exited without reporting")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct UntilCancelled;

    #[async_trait]
    impl Worker for UntilCancelled {
        fn name(&self) -> &str {
            "until-cancelled"
        }

        async fn run(self: Box<Self>, cancel: CancellationToken) -> TaskResult {
            cancel.cancelled().await;
            Ok(())
        }
    }

    struct Fails;

    #[async_trait]
    impl Worker for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        async fn run(self: Box<Self>, _cancel: CancellationToken) -> TaskResult {
            Err(AgentError::Transient("boom".into()))
        }
    }

    struct Panics;

    #[async_trait]
    impl Worker for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn run(self: Box<Self>, _cancel: CancellationToken) -> TaskResult {
            panic!("worker bug");
        }
    }

    #[tokio::test]
    async fn test_stop_then_wait() {
        let parent = CancellationToken::new();
        let task = TaskHandle::spawn(Box::new(UntilCancelled), &parent);
        assert_eq!(task.name(), "until-cancelled");

        task.stop();
        task.stop();
        assert!(task.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_finished_task_is_noop() {
        let parent = CancellationToken::new();
        let task = TaskHandle::spawn(Box::new(Fails), &parent);

        let first = task.wait().await;
        assert!(matches!(first, Err(AgentError::Transient(_))));

        task.stop();
        let again = task.wait().await;
        assert!(matches!(again, Err(AgentError::Transient(_))));
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_task() {
        let parent = CancellationToken::new();
        let task = TaskHandle::spawn(Box::new(UntilCancelled), &parent);
        parent.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task.wait()).await;
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_panicking_task_reports_fatal() {
        let parent = CancellationToken::new();
        let task = TaskHandle::spawn(Box::new(Panics), &parent);
        assert!(matches!(task.wait().await, Err(AgentError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_waiters_are_independent() {
        let parent = CancellationToken::new();
        let task = TaskHandle::spawn(Box::new(UntilCancelled), &parent);
        let a = task.waiter();
        let b = task.waiter();
        task.stop();
        assert!(a.wait().await.is_ok());
        assert!(b.wait().await.is_ok());
    }
}
