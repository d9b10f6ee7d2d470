//! Integration tests for the machine agent run loop.
//!
//! Each test bootstraps an in-memory environment where machine 0 manages the
//! environment, writes the initial credential to a temp data directory, and
//! runs the agent for machine 0 (or a second machine) against it.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::{EntityTag, MachineId};
use fleet_machine_agent::credentials::{
    CredentialError, CredentialStore, EntityCredential, FileCredentialStore,
};
use fleet_machine_agent::environ::attrs;
use fleet_machine_agent::provider::{MockProvider, Operation};
use fleet_machine_agent::state::{Job, Life, MemoryState};
use fleet_machine_agent::supervisor::SupervisorConfig;
use fleet_machine_agent::tools::{FileTools, Version};
use fleet_machine_agent::{AgentDeps, AgentExit, AgentPhase, AgentSettings, MachineAgent};
use fleet_reconcile::AttemptStrategy;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const INITIAL_PASSWORD: &str = "initial-secret";

fn settings() -> AgentSettings {
    AgentSettings {
        retry_delay: Duration::from_millis(50),
        supervisor: SupervisorConfig {
            stop_timeout: Duration::from_secs(1),
        },
        attempt: AttemptStrategy::new(Duration::from_millis(100), Duration::from_millis(10)),
    }
}

struct Env {
    dir: TempDir,
    state: MemoryState,
    provider: Arc<MockProvider>,
    ops: mpsc::UnboundedReceiver<Operation>,
    credentials: Arc<FileCredentialStore>,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (provider, ops) = MockProvider::with_operations();
        let bootstrap_instance = provider.insert_instance(&MachineId::from_index(0)).unwrap();
        let state = MemoryState::bootstrap(
            attrs([("name", json!("testing")), ("type", json!("mock"))]),
            bootstrap_instance,
            INITIAL_PASSWORD,
        );
        let credentials = Arc::new(FileCredentialStore::new(dir.path()));
        credentials
            .save(&EntityCredential::initial(machine_tag(0), INITIAL_PASSWORD))
            .unwrap();

        Self {
            dir,
            state,
            provider: Arc::new(provider),
            ops,
            credentials,
        }
    }

    fn tools(&self, tag: &EntityTag) -> Arc<FileTools> {
        Arc::new(FileTools::new(self.dir.path(), tag.clone(), Version::new(1, 0, 0)))
    }

    fn agent(&self, tag: EntityTag) -> MachineAgent {
        self.agent_with_credentials(tag, self.credentials.clone())
    }

    fn agent_with_credentials(
        &self,
        tag: EntityTag,
        credentials: Arc<dyn CredentialStore>,
    ) -> MachineAgent {
        let deps = AgentDeps {
            connector: Arc::new(self.state.clone()),
            provider: self.provider.clone(),
            credentials,
            tools: self.tools(&tag),
        };
        MachineAgent::new(tag, settings(), deps)
    }

    fn stored_password(&self, tag: &EntityTag) -> Option<String> {
        self.credentials.load(tag).unwrap().password
    }
}

fn machine_tag(index: u64) -> EntityTag {
    EntityTag::machine(&MachineId::from_index(index))
}

async fn wait_for_phase(phase: &mut watch::Receiver<AgentPhase>, wanted: AgentPhase) {
    tokio::time::timeout(Duration::from_secs(2), phase.wait_for(|p| *p == wanted))
        .await
        .expect("agent never reached phase")
        .expect("agent dropped its phase channel");
}

async fn finish(handle: JoinHandle<AgentExit>) -> AgentExit {
    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("agent did not finish")
        .expect("agent task panicked")
}

#[tokio::test]
async fn test_dead_machine_terminates_agent() {
    let env = Env::new();
    env.state.set_life(&MachineId::from_index(0), Life::Dead).unwrap();

    let exit = finish(tokio::spawn(env.agent(machine_tag(0)).run())).await;
    assert_eq!(exit, AgentExit::Terminated);
    assert_eq!(exit.exit_code(), 0);
}

#[tokio::test]
async fn test_removed_machine_terminates_running_agent() {
    let env = Env::new();
    let machine = env.state.add_machine(&[Job::HostUnits]);
    env.state.set_password(&machine.tag(), INITIAL_PASSWORD);
    env.credentials
        .save(&EntityCredential::initial(machine.tag(), INITIAL_PASSWORD))
        .unwrap();

    let agent = env.agent(machine.tag());
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    env.state.set_life(&machine.id, Life::Dead).unwrap();
    env.state.remove_machine(&machine.id).unwrap();

    assert_eq!(finish(handle).await, AgentExit::Terminated);
}

#[tokio::test]
async fn test_stop_request_ends_run() {
    let env = Env::new();
    let agent = env.agent(machine_tag(0));
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());

    wait_for_phase(&mut phase, AgentPhase::Supervising).await;
    stop.request_stop();
    stop.request_stop();

    assert_eq!(finish(handle).await, AgentExit::Stopped);
    assert_eq!(*phase.borrow(), AgentPhase::Terminated);
}

#[tokio::test]
async fn test_password_is_rotated_and_persisted() {
    let env = Env::new();
    let tag = machine_tag(0);
    let agent = env.agent(tag.clone());
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());

    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    let password = env.stored_password(&tag).expect("password was not persisted");
    assert!(env.state.password_matches(&tag, &password));
    assert!(!env.state.password_matches(&tag, INITIAL_PASSWORD));

    // The initial password stays on disk for interrupted rotations.
    assert_eq!(
        env.credentials.load(&tag).unwrap().old_password,
        INITIAL_PASSWORD
    );

    stop.request_stop();
    assert_eq!(finish(handle).await, AgentExit::Stopped);
}

#[tokio::test]
async fn test_rotation_lost_before_store_update_is_repeated() {
    let env = Env::new();
    let tag = machine_tag(0);

    // Persisted locally, then the process died before telling the store.
    let interrupted = EntityCredential::initial(tag.clone(), INITIAL_PASSWORD).rotated("lost");
    env.credentials.save(&interrupted).unwrap();

    let agent = env.agent(tag.clone());
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    let password = env.stored_password(&tag).unwrap();
    assert_ne!(password, "lost");
    assert!(env.state.password_matches(&tag, &password));

    stop.request_stop();
    finish(handle).await;
}

/// Credential store whose writes always fail.
struct ReadOnlyCredentials(FileCredentialStore);

impl CredentialStore for ReadOnlyCredentials {
    fn load(&self, tag: &EntityTag) -> Result<EntityCredential, CredentialError> {
        self.0.load(tag)
    }

    fn save(&self, _credential: &EntityCredential) -> Result<(), CredentialError> {
        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
    }
}

#[tokio::test]
async fn test_unpersistable_password_is_never_used() {
    let mut env = Env::new();
    let tag = machine_tag(0);
    env.state.add_machine(&[Job::HostUnits]);

    let credentials = Arc::new(ReadOnlyCredentials(FileCredentialStore::new(env.dir.path())));
    let agent = env.agent_with_credentials(tag.clone(), credentials);
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());

    wait_for_phase(&mut phase, AgentPhase::Retrying).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    // The store still takes the initial password and nothing was provisioned.
    assert!(env.state.password_matches(&tag, INITIAL_PASSWORD));
    assert!(env.ops.try_recv().is_err());

    stop.request_stop();
    assert_eq!(finish(handle).await, AgentExit::Stopped);

    // The next run, with a writable credential file, still gets in.
    let agent = env.agent(tag.clone());
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    let password = env.stored_password(&tag).expect("password was not persisted");
    assert!(env.state.password_matches(&tag, &password));
    assert!(!env.state.password_matches(&tag, INITIAL_PASSWORD));

    stop.request_stop();
    assert_eq!(finish(handle).await, AgentExit::Stopped);
}

#[tokio::test]
async fn test_agent_provisions_new_machines() {
    let mut env = Env::new();
    let agent = env.agent(machine_tag(0));
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    let machine = env.state.add_machine(&[Job::HostUnits]);

    let started = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match env.ops.recv().await {
                Some(Operation::StartInstance { machine_id, .. }) => break machine_id,
                Some(_) => continue,
                None => panic!("operation channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(started, machine.id);

    stop.request_stop();
    assert_eq!(finish(handle).await, AgentExit::Stopped);
}

#[tokio::test]
async fn test_host_units_machine_does_not_provision() {
    let mut env = Env::new();
    let machine = env.state.add_machine(&[Job::HostUnits]);
    env.state.set_password(&machine.tag(), INITIAL_PASSWORD);
    env.credentials
        .save(&EntityCredential::initial(machine.tag(), INITIAL_PASSWORD))
        .unwrap();

    let agent = env.agent(machine.tag());
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(env.ops.try_recv().is_err());

    stop.request_stop();
    assert_eq!(finish(handle).await, AgentExit::Stopped);
}

#[tokio::test]
async fn test_upgrade_swaps_tools_and_requests_restart() {
    let env = Env::new();
    let tag = machine_tag(0);
    let target = Version::new(1, 1, 0);
    let tools = env.tools(&tag);
    std::fs::create_dir_all(tools.version_dir(&target)).unwrap();

    let agent = env.agent(tag);
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    env.state
        .update_environ_config("agent-version", json!(target.to_string()));

    let exit = finish(handle).await;
    assert_eq!(exit, AgentExit::Restart { version: target });
    assert_eq!(exit.exit_code(), 10);
    assert_eq!(tools.active_version().await.unwrap(), Some(target));
}

#[tokio::test]
async fn test_unavailable_store_is_retried() {
    let env = Env::new();
    env.state.set_available(false);

    let agent = env.agent(machine_tag(0));
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());

    wait_for_phase(&mut phase, AgentPhase::Retrying).await;
    env.state.set_available(true);
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    stop.request_stop();
    assert_eq!(finish(handle).await, AgentExit::Stopped);
}

#[tokio::test]
async fn test_store_outage_restarts_epoch() {
    let env = Env::new();
    let agent = env.agent(machine_tag(0));
    let stop = agent.stop_handle();
    let mut phase = agent.phase();
    let handle = tokio::spawn(agent.run());
    wait_for_phase(&mut phase, AgentPhase::Supervising).await;

    // Every watch ends and reconnects fail, so the agent keeps retrying.
    env.state.close();
    wait_for_phase(&mut phase, AgentPhase::Retrying).await;

    stop.request_stop();
    assert_eq!(finish(handle).await, AgentExit::Stopped);
}
