//! State store model types and access traits.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_id::{EntityTag, InstanceId, MachineId};
use fleet_reconcile::{retry, AttemptStrategy, RetryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::environ::ConfigAttrs;
use crate::tools::Version;

/// Errors from state store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid credentials for {0}")]
    Unauthorized(String),

    #[error("state connection closed")]
    Closed,

    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, StoreError::Unauthorized(_))
    }

    /// Whether the same call may succeed if tried again on this connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Run a store call under `strategy`, retrying while the store is unavailable.
///
/// Every attempt is raced against `cancel`; `Ok(None)` means `cancel` fired
/// before the call succeeded.
pub async fn retry_call<T, F, Fut>(
    strategy: &AttemptStrategy,
    cancel: &CancellationToken,
    op: F,
) -> Result<Option<T>, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match retry(strategy, cancel, StoreError::is_transient, op).await {
        Ok(value) => Ok(Some(value)),
        Err(RetryError::Cancelled) => Ok(None),
        Err(RetryError::Exhausted { last: e, .. }) | Err(RetryError::Permanent(e)) => Err(e),
    }
}

/// Life-cycle of a fleet entity. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Dying => "dying",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for Life {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Responsibilities a machine agent can be asked to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    /// Run deployed workload units.
    HostUnits,
    /// Provision instances for the whole environment.
    ManageEnviron,
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::HostUnits => f.write_str("host-units"),
            Job::ManageEnviron => f.write_str("manage-environ"),
        }
    }
}

/// Desired state for one fleet member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,
    pub life: Life,
    /// Provider instance backing this machine, once provisioned.
    pub instance_id: Option<InstanceId>,
    pub jobs: Vec<Job>,
    /// Tools version the machine's agent last reported.
    pub agent_version: Option<Version>,
}

impl MachineRecord {
    pub fn tag(&self) -> EntityTag {
        EntityTag::machine(&self.id)
    }
}

/// The agent's view of its own entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub tag: EntityTag,
    pub life: Life,
    pub jobs: Vec<Job>,
}

impl From<&MachineRecord> for EntityRecord {
    fn from(m: &MachineRecord) -> Self {
        Self {
            tag: m.tag(),
            life: m.life,
            jobs: m.jobs.clone(),
        }
    }
}

// =============================================================================
// Watch
// =============================================================================

/// Change notifications for one resource.
///
/// The first call to [`Watch::changed`] returns immediately so consumers
/// always start with a full read. Later calls wait for a change; changes that
/// arrive while the consumer is busy are coalesced into one notification.
pub struct Watch {
    rx: watch::Receiver<u64>,
    initial: bool,
}

impl Watch {
    pub fn new(rx: watch::Receiver<u64>) -> Self {
        Self { rx, initial: true }
    }

    /// A watch whose source is already gone.
    pub fn closed() -> Self {
        let (_, rx) = watch::channel(0);
        Self::new(rx)
    }

    /// Wait for the next notification.
    pub async fn changed(&mut self) -> Result<(), StoreError> {
        if self.initial {
            self.initial = false;
            self.rx.borrow_and_update();
            return Ok(());
        }
        self.rx.changed().await.map_err(|_| StoreError::Closed)
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Opens authenticated state connections.
#[async_trait]
pub trait StateConnector: Send + Sync {
    /// Connect as `tag` using `password`.
    ///
    /// Returns [`StoreError::Unauthorized`] when the password is not accepted.
    async fn connect(
        &self,
        tag: &EntityTag,
        password: &str,
    ) -> Result<Arc<dyn StateStore>, StoreError>;
}

/// An authenticated connection to the state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read an entity; [`StoreError::NotFound`] once it has been removed.
    async fn entity(&self, tag: &EntityTag) -> Result<EntityRecord, StoreError>;

    /// Replace the password the store accepts for `tag`.
    async fn set_entity_password(&self, tag: &EntityTag, password: &str) -> Result<(), StoreError>;

    /// Record the tools version the agent for `tag` is running.
    async fn set_agent_version(&self, tag: &EntityTag, version: &Version) -> Result<(), StoreError>;

    /// Current environment configuration attributes.
    async fn environ_config(&self) -> Result<ConfigAttrs, StoreError>;

    /// Every machine record in the fleet.
    async fn all_machines(&self) -> Result<Vec<MachineRecord>, StoreError>;

    /// Record the provider instance backing a machine.
    ///
    /// Succeeds if the machine already records the same instance; fails with
    /// [`StoreError::Conflict`] if it records a different one.
    async fn set_instance_id(
        &self,
        machine: &MachineId,
        instance: &InstanceId,
    ) -> Result<(), StoreError>;

    fn watch_entity(&self, tag: &EntityTag) -> Watch;

    fn watch_environ_config(&self) -> Watch;

    fn watch_machines(&self) -> Watch;
}
