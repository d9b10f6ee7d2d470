//! In-memory state store.
//!
//! Used by the standalone binary and by tests. Every clone shares the same
//! underlying state, so a test can hold one handle for administration while the
//! agent connects through another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_id::{EntityTag, InstanceId, MachineId};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use super::store::{
    EntityRecord, Job, Life, MachineRecord, StateConnector, StateStore, StoreError, Watch,
};
use crate::environ::ConfigAttrs;
use crate::tools::Version;

/// Shared in-memory state store.
#[derive(Clone)]
pub struct MemoryState {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    machines: BTreeMap<u64, MachineRecord>,
    next_machine: u64,
    /// SHA-256 hex digests of accepted passwords.
    passwords: HashMap<EntityTag, String>,
    config: ConfigAttrs,
    senders: Option<Senders>,
    available: bool,
    fail_instance_writes: bool,
}

struct Senders {
    machines: watch::Sender<u64>,
    config: watch::Sender<u64>,
    entities: watch::Sender<u64>,
}

impl Senders {
    fn new() -> Self {
        Self {
            machines: watch::channel(0).0,
            config: watch::channel(0).0,
            entities: watch::channel(0).0,
        }
    }
}

fn bump(tx: &watch::Sender<u64>) {
    tx.send_modify(|v| *v = v.wrapping_add(1));
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

impl Inner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.senders.is_none() {
            return Err(StoreError::Closed);
        }
        if !self.available {
            return Err(StoreError::Unavailable("state store is offline".into()));
        }
        Ok(())
    }

    fn machine_mut(&mut self, id: &MachineId) -> Result<&mut MachineRecord, StoreError> {
        self.machines
            .get_mut(&id.index())
            .ok_or_else(|| StoreError::NotFound(format!("machine {id}")))
    }

    fn notify_machines(&self) {
        if let Some(s) = &self.senders {
            bump(&s.machines);
            bump(&s.entities);
        }
    }

    fn notify_config(&self) {
        if let Some(s) = &self.senders {
            bump(&s.config);
        }
    }

    fn subscribe(&self, pick: impl Fn(&Senders) -> &watch::Sender<u64>) -> Watch {
        match &self.senders {
            Some(s) => Watch::new(pick(s).subscribe()),
            None => Watch::closed(),
        }
    }
}

impl MemoryState {
    /// An empty store with the given environment configuration.
    pub fn new(config: ConfigAttrs) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                machines: BTreeMap::new(),
                next_machine: 0,
                passwords: HashMap::new(),
                config,
                senders: Some(Senders::new()),
                available: true,
                fail_instance_writes: false,
            })),
        }
    }

    /// A store holding the environment manager machine, already running on
    /// `instance_id`, which accepts `password`.
    pub fn bootstrap(config: ConfigAttrs, instance_id: InstanceId, password: &str) -> Self {
        let state = Self::new(config);
        let machine = state.inject_machine(instance_id, &[Job::ManageEnviron, Job::HostUnits]);
        state.set_password(&machine.tag(), password);
        state
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Add an unprovisioned machine.
    pub fn add_machine(&self, jobs: &[Job]) -> MachineRecord {
        self.insert_machine(None, jobs)
    }

    /// Add a machine that is already running on `instance_id`.
    pub fn inject_machine(&self, instance_id: InstanceId, jobs: &[Job]) -> MachineRecord {
        self.insert_machine(Some(instance_id), jobs)
    }

    /// Add an unprovisioned machine under a chosen id.
    ///
    /// Later [`add_machine`](Self::add_machine) calls allocate ids above it.
    pub fn add_machine_at(&self, id: &MachineId, jobs: &[Job]) -> Result<MachineRecord, StoreError> {
        let mut inner = self.inner.lock();
        let index = id.index();
        if inner.machines.contains_key(&index) {
            return Err(StoreError::Conflict(format!("machine {id} already exists")));
        }
        inner.next_machine = inner.next_machine.max(index.saturating_add(1));

        let record = MachineRecord {
            id: id.clone(),
            life: Life::Alive,
            instance_id: None,
            jobs: jobs.to_vec(),
            agent_version: None,
        };
        inner.machines.insert(index, record.clone());
        inner.notify_machines();

        debug!(machine_id = %record.id, "Machine added");
        Ok(record)
    }

    fn insert_machine(&self, instance_id: Option<InstanceId>, jobs: &[Job]) -> MachineRecord {
        let mut inner = self.inner.lock();
        let index = inner.next_machine;
        inner.next_machine += 1;

        let record = MachineRecord {
            id: MachineId::from_index(index),
            life: Life::Alive,
            instance_id,
            jobs: jobs.to_vec(),
            agent_version: None,
        };
        inner.machines.insert(index, record.clone());
        inner.notify_machines();

        debug!(machine_id = %record.id, "Machine added");
        record
    }

    pub fn machine(&self, id: &MachineId) -> Result<MachineRecord, StoreError> {
        let mut inner = self.inner.lock();
        inner.machine_mut(id).map(|m| m.clone())
    }

    /// Advance a machine's life. Moving backwards is a conflict.
    pub fn set_life(&self, id: &MachineId, life: Life) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let machine = inner.machine_mut(id)?;
        if life < machine.life {
            return Err(StoreError::Conflict(format!(
                "machine {id} cannot go from {} to {life}",
                machine.life
            )));
        }
        if machine.life == life {
            return Ok(());
        }
        machine.life = life;
        inner.notify_machines();
        Ok(())
    }

    /// Remove a dead machine.
    pub fn remove_machine(&self, id: &MachineId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let life = inner.machine_mut(id)?.life;
        if life != Life::Dead {
            return Err(StoreError::Conflict(format!(
                "machine {id} is {life}, not dead"
            )));
        }
        inner.machines.remove(&id.index());
        inner.notify_machines();
        Ok(())
    }

    /// Replace the environment configuration.
    pub fn set_environ_config(&self, config: ConfigAttrs) {
        let mut inner = self.inner.lock();
        inner.config = config;
        inner.notify_config();
    }

    /// Set one environment configuration attribute.
    pub fn update_environ_config(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock();
        inner.config.insert(key.to_string(), value);
        inner.notify_config();
    }

    /// Make the store accept `password` for `tag`.
    pub fn set_password(&self, tag: &EntityTag, password: &str) {
        self.inner
            .lock()
            .passwords
            .insert(tag.clone(), hash_password(password));
    }

    pub fn password_matches(&self, tag: &EntityTag, password: &str) -> bool {
        self.inner
            .lock()
            .passwords
            .get(tag)
            .is_some_and(|h| *h == hash_password(password))
    }

    /// Make every store operation fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Make [`StateStore::set_instance_id`] fail.
    pub fn fail_instance_writes(&self, fail: bool) {
        self.inner.lock().fail_instance_writes = fail;
    }

    /// Close every connection. Outstanding watches report [`StoreError::Closed`].
    pub fn close(&self) {
        self.inner.lock().senders = None;
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

#[async_trait]
impl StateConnector for MemoryState {
    async fn connect(
        &self,
        tag: &EntityTag,
        password: &str,
    ) -> Result<Arc<dyn StateStore>, StoreError> {
        {
            let inner = self.inner.lock();
            inner.check_open()?;
            let accepted = inner
                .passwords
                .get(tag)
                .is_some_and(|h| *h == hash_password(password));
            if !accepted {
                return Err(StoreError::Unauthorized(tag.to_string()));
            }
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl StateStore for MemoryState {
    async fn entity(&self, tag: &EntityTag) -> Result<EntityRecord, StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let machine = inner.machine_mut(tag.machine_id())?;
        Ok(EntityRecord::from(&*machine))
    }

    async fn set_entity_password(&self, tag: &EntityTag, password: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.passwords.insert(tag.clone(), hash_password(password));
        Ok(())
    }

    async fn set_agent_version(&self, tag: &EntityTag, version: &Version) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.machine_mut(tag.machine_id())?.agent_version = Some(*version);
        Ok(())
    }

    async fn environ_config(&self) -> Result<ConfigAttrs, StoreError> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.config.clone())
    }

    async fn all_machines(&self) -> Result<Vec<MachineRecord>, StoreError> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.machines.values().cloned().collect())
    }

    async fn set_instance_id(
        &self,
        machine: &MachineId,
        instance: &InstanceId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.fail_instance_writes {
            return Err(StoreError::Unavailable(format!(
                "cannot record instance for machine {machine}"
            )));
        }

        let record = inner.machine_mut(machine)?;
        match &record.instance_id {
            Some(existing) if existing == instance => return Ok(()),
            Some(existing) => {
                return Err(StoreError::Conflict(format!(
                    "machine {machine} already has instance {existing}"
                )));
            }
            None => record.instance_id = Some(instance.clone()),
        }
        inner.notify_machines();
        Ok(())
    }

    fn watch_entity(&self, _tag: &EntityTag) -> Watch {
        self.inner.lock().subscribe(|s| &s.entities)
    }

    fn watch_environ_config(&self) -> Watch {
        self.inner.lock().subscribe(|s| &s.config)
    }

    fn watch_machines(&self) -> Watch {
        self.inner.lock().subscribe(|s| &s.machines)
    }
}
