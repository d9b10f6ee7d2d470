//! Agent upgrades.
//!
//! The upgrader reports the running tools version, then follows the
//! environment's `agent-version`. When that names another version it fetches
//! the tools and ends the epoch with [`AgentError::UpgradeReady`]; the run loop
//! performs the actual swap once every other task has stopped.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_id::EntityTag;
use fleet_reconcile::AttemptStrategy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::environ::EnvironConfig;
use crate::error::AgentError;
use crate::state::{retry_call, StateStore};
use crate::task::{TaskResult, Worker};
use crate::tools::ToolsManager;

pub struct Upgrader {
    tag: EntityTag,
    store: Arc<dyn StateStore>,
    tools: Arc<dyn ToolsManager>,
    attempt: AttemptStrategy,
}

impl Upgrader {
    pub fn new(
        tag: EntityTag,
        store: Arc<dyn StateStore>,
        tools: Arc<dyn ToolsManager>,
        attempt: AttemptStrategy,
    ) -> Self {
        Self {
            tag,
            store,
            tools,
            attempt,
        }
    }
}

#[async_trait]
impl Worker for Upgrader {
    fn name(&self) -> &str {
        "upgrader"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> TaskResult {
        let current = self.tools.current_version();
        let recorded = retry_call(&self.attempt, &cancel, || {
            self.store.set_agent_version(&self.tag, &current)
        })
        .await?;
        if recorded.is_none() {
            return Ok(());
        }
        debug!(tag = %self.tag, version = %current, "Agent version recorded");

        let mut watch = self.store.watch_environ_config();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                changed = watch.changed() => changed?,
            }

            let Some(attrs) =
                retry_call(&self.attempt, &cancel, || self.store.environ_config()).await?
            else {
                return Ok(());
            };
            let wanted = match EnvironConfig::from_attrs(&attrs) {
                Ok(config) => config.agent_version,
                Err(e) => {
                    warn!(error = %e, "Ignoring invalid environment configuration");
                    continue;
                }
            };
            let Some(wanted) = wanted else { continue };
            if wanted == current {
                continue;
            }

            info!(from = %current, to = %wanted, "Upgrade requested, fetching tools");
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                fetched = self.tools.fetch(&wanted) => fetched,
            };
            match fetched {
                Ok(()) => {
                    return Err(AgentError::UpgradeReady {
                        old: current,
                        new: wanted,
                    });
                }
                Err(e) => warn!(version = %wanted, error = %e, "Failed to fetch tools"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environ::attrs;
    use crate::state::{Job, MemoryState};
    use crate::tools::{FileTools, Version};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        state: MemoryState,
        tag: EntityTag,
        tools: Arc<FileTools>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = MemoryState::new(attrs([("name", json!("t")), ("type", json!("mock"))]));
        let tag = state.add_machine(&[Job::HostUnits]).tag();
        let tools = Arc::new(FileTools::new(dir.path(), tag.clone(), Version::new(1, 0, 0)));
        Fixture {
            state,
            tag,
            tools,
            _dir: dir,
        }
    }

    fn spawn(f: &Fixture, cancel: &CancellationToken) -> tokio::task::JoinHandle<TaskResult> {
        let upgrader = Upgrader::new(
            f.tag.clone(),
            Arc::new(f.state.clone()),
            f.tools.clone(),
            AttemptStrategy::default(),
        );
        tokio::spawn(Box::new(upgrader).run(cancel.clone()))
    }

    #[tokio::test]
    async fn test_records_running_version() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let handle = spawn(&f, &cancel);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let machine = f.state.machine(f.tag.machine_id()).unwrap();
        assert_eq!(machine.agent_version, Some(Version::new(1, 0, 0)));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_upgrade_ready_once_tools_are_staged() {
        let f = fixture();
        let target = Version::new(1, 1, 0);
        let cancel = CancellationToken::new();
        let handle = spawn(&f, &cancel);

        // Not staged yet: the upgrader keeps waiting.
        f.state.update_environ_config("agent-version", json!("1.1.0"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        std::fs::create_dir_all(f.tools.version_dir(&target)).unwrap();
        f.state.update_environ_config("agent-version", json!("1.1.0"));

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(AgentError::UpgradeReady { old, new }) => {
                assert_eq!(old, Version::new(1, 0, 0));
                assert_eq!(new, target);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_same_version_is_ignored() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let handle = spawn(&f, &cancel);

        f.state.update_environ_config("agent-version", json!("1.0.0"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
