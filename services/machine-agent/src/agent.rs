//! The machine agent run loop.
//!
//! Each pass through the loop is an epoch:
//!
//! ```text
//! Connecting ──► Supervising ──► Retrying ──► Connecting ...
//!     │               │
//!     │               ├──► Upgrading ──► Terminated (restart)
//!     └───────────────┴──► Terminated
//! ```
//!
//! An epoch authenticates, reads the agent's entity, spawns one worker per
//! responsibility and supervises them until one ends. Nothing carries over to
//! the next epoch except the credential file.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::EntityTag;
use fleet_reconcile::AttemptStrategy;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::{self, CredentialStore};
use crate::error::{AgentError, ExitCause};
use crate::lifecycle::{check_entity, LifeWatcher};
use crate::provider::Provider;
use crate::provisioner::Provisioner;
use crate::state::{EntityRecord, Job, StateConnector, StateStore};
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::task::{TaskResult, Worker};
use crate::tools::{ToolsManager, Version};
use crate::upgrader::Upgrader;

/// Default pause between epochs.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Process exit code asking the process manager to relaunch the agent.
pub const RESTART_EXIT_CODE: i32 = 10;

/// Run loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    pub retry_delay: Duration,
    pub supervisor: SupervisorConfig,
    /// Retry schedule for individual provider and store calls.
    pub attempt: AttemptStrategy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            supervisor: SupervisorConfig::default(),
            attempt: AttemptStrategy::default(),
        }
    }
}

/// External collaborators.
#[derive(Clone)]
pub struct AgentDeps {
    pub connector: Arc<dyn StateConnector>,
    pub provider: Arc<dyn Provider>,
    pub credentials: Arc<dyn CredentialStore>,
    pub tools: Arc<dyn ToolsManager>,
}

/// Where the run loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Connecting,
    Supervising,
    Retrying,
    Upgrading,
    Terminated,
}

/// How the run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// The entity is dead or removed.
    Terminated,
    /// A stop was requested.
    Stopped,
    /// New tools are in place; the agent must be relaunched.
    Restart { version: Version },
}

impl AgentExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentExit::Terminated | AgentExit::Stopped => 0,
            AgentExit::Restart { .. } => RESTART_EXIT_CODE,
        }
    }
}

impl std::fmt::Display for AgentExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentExit::Terminated => f.write_str("terminated"),
            AgentExit::Stopped => f.write_str("stopped"),
            AgentExit::Restart { version } => write!(f, "restart into {version}"),
        }
    }
}

/// Asks a running agent to stop. Safe to call repeatedly.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The agent for one machine.
pub struct MachineAgent {
    tag: EntityTag,
    settings: AgentSettings,
    deps: AgentDeps,
    stop: CancellationToken,
    phase: watch::Sender<AgentPhase>,
}

impl MachineAgent {
    pub fn new(tag: EntityTag, settings: AgentSettings, deps: AgentDeps) -> Self {
        let (phase, _) = watch::channel(AgentPhase::Connecting);
        Self {
            tag,
            settings,
            deps,
            stop: CancellationToken::new(),
            phase,
        }
    }

    pub fn tag(&self) -> &EntityTag {
        &self.tag
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    /// Observe phase transitions.
    pub fn phase(&self) -> watch::Receiver<AgentPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: AgentPhase) {
        debug!(tag = %self.tag, phase = ?phase, "Agent phase");
        self.phase.send_replace(phase);
    }

    /// Run epochs until the agent terminates, is stopped, or must restart.
    pub async fn run(self) -> AgentExit {
        info!(tag = %self.tag, version = %self.deps.tools.current_version(), "Agent starting");

        let exit = loop {
            if self.stop.is_cancelled() {
                break AgentExit::Stopped;
            }

            self.set_phase(AgentPhase::Connecting);
            let result = self.run_epoch().await;
            let cause = ExitCause::of(&result);

            match result {
                Err(AgentError::EntityGone(tag)) => {
                    info!(tag = %tag, "Entity is gone, agent terminating");
                    break AgentExit::Terminated;
                }
                Err(AgentError::UpgradeReady { old, new }) => {
                    self.set_phase(AgentPhase::Upgrading);
                    match self.deps.tools.swap_binaries_and_mark_restart(&new).await {
                        Ok(()) => {
                            info!(from = %old, to = %new, "Upgrade staged, restart required");
                            break AgentExit::Restart { version: new };
                        }
                        Err(e) => error!(to = %new, error = %e, "Failed to swap agent tools"),
                    }
                }
                Ok(()) => debug!(tag = %self.tag, cause = %cause, "Epoch ended"),
                Err(e) => warn!(tag = %self.tag, cause = %cause, error = %e, "Epoch failed"),
            }

            if self.stop.is_cancelled() {
                break AgentExit::Stopped;
            }

            self.set_phase(AgentPhase::Retrying);
            info!(delay = ?self.settings.retry_delay, "Restarting agent epoch");
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break AgentExit::Stopped,
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
            }
        };

        self.set_phase(AgentPhase::Terminated);
        info!(tag = %self.tag, exit = %exit, "Agent finished");
        exit
    }

    async fn run_epoch(&self) -> TaskResult {
        let connected = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(()),
            connected = self.connect() => connected?,
        };
        let (store, entity) = connected;

        let workers = self.workers(&entity, store);
        self.set_phase(AgentPhase::Supervising);
        Supervisor::new(self.settings.supervisor)
            .run(workers, &self.stop)
            .await
    }

    /// Authenticate, rotating the password if needed, and read the entity.
    async fn connect(&self) -> Result<(Arc<dyn StateStore>, EntityRecord), AgentError> {
        let credential = self.deps.credentials.load(&self.tag)?;
        let auth = credentials::authenticate(self.deps.connector.as_ref(), &credential).await?;
        let store = auth.store;

        if let Some(password) = auth.new_password {
            // The connection must not be used until the new password is durable.
            let rotated = credential.rotated(password.as_str());
            if let Err(e) = self.deps.credentials.save(&rotated) {
                drop(store);
                return Err(AgentError::fatal(format!(
                    "cannot persist rotated password: {e}"
                )));
            }
            store.set_entity_password(&self.tag, &password).await?;
            info!(tag = %self.tag, "Password rotated");
        }

        let entity = check_entity(&self.tag, store.entity(&self.tag).await)?;
        Ok((store, entity))
    }

    fn workers(&self, entity: &EntityRecord, store: Arc<dyn StateStore>) -> Vec<Box<dyn Worker>> {
        let mut workers: Vec<Box<dyn Worker>> = vec![
            Box::new(Upgrader::new(
                self.tag.clone(),
                store.clone(),
                self.deps.tools.clone(),
                self.settings.attempt,
            )),
            Box::new(LifeWatcher::new(
                self.tag.clone(),
                store.clone(),
                self.settings.attempt,
            )),
        ];

        for job in &entity.jobs {
            match job {
                Job::ManageEnviron => workers.push(Box::new(Provisioner::new(
                    store.clone(),
                    self.deps.provider.clone(),
                    self.settings.attempt,
                ))),
                Job::HostUnits => debug!(tag = %self.tag, job = %job, "No local worker for job"),
            }
        }
        workers
    }
}
