//! Fleet Machine Agent
//!
//! Runs the agent for one machine against an in-memory state store and the
//! mock provider. The store is bootstrapped the way a fresh environment is:
//! machine 0 manages the environment and accepts the bootstrap password.
//!
//! Exit codes: 0 when the machine is gone or the agent was stopped, 10 when
//! new tools are in place and the agent must be relaunched.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fleet_id::MachineId;
use fleet_machine_agent::config::Config;
use fleet_machine_agent::credentials::{
    CredentialError, CredentialStore, EntityCredential, FileCredentialStore,
};
use fleet_machine_agent::environ::attrs;
use fleet_machine_agent::state::Job;
use fleet_machine_agent::tools::{FileTools, Version};
use fleet_machine_agent::{AgentDeps, MachineAgent, MemoryState, MockProvider};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        machine_id = %config.machine_id,
        data_dir = %config.data_dir.display(),
        version = %Version::current(),
        "Starting fleet machine agent"
    );

    let tag = config.tag();
    let credentials = Arc::new(FileCredentialStore::new(&config.data_dir));
    let credential = match credentials.load(&tag) {
        Ok(credential) => credential,
        Err(CredentialError::NotFound(_)) => {
            let Some(password) = &config.bootstrap_password else {
                bail!("no credential for {tag} and FLEET_BOOTSTRAP_PASSWORD is not set");
            };
            let credential = EntityCredential::initial(tag.clone(), password.as_str());
            credentials
                .save(&credential)
                .context("failed to write initial credential")?;
            info!(tag = %tag, "Initial credential written");
            credential
        }
        Err(e) => return Err(e).context("failed to load credential"),
    };

    // Development environment: a fresh store that accepts the initial password.
    let provider = Arc::new(MockProvider::new());
    let bootstrap_instance = provider.insert_instance(&MachineId::from_index(0))?;
    let state = MemoryState::bootstrap(
        attrs([("name", json!("dev")), ("type", json!("mock"))]),
        bootstrap_instance,
        &credential.old_password,
    );
    if config.machine_id.index() != 0 {
        state
            .add_machine_at(&config.machine_id, &[Job::HostUnits])
            .context("failed to register machine")?;
    }
    state.set_password(&tag, &credential.old_password);

    let deps = AgentDeps {
        connector: Arc::new(state),
        provider,
        credentials,
        tools: Arc::new(FileTools::new(
            &config.data_dir,
            tag.clone(),
            Version::current(),
        )),
    };
    let agent = MachineAgent::new(tag, config.agent_settings(), deps);

    let stop = agent.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
        }
        stop.request_stop();
    });

    let exit = agent.run().await;
    info!(exit = %exit, code = exit.exit_code(), "Machine agent shutdown complete");

    if exit.exit_code() != 0 {
        std::process::exit(exit.exit_code());
    }
    Ok(())
}
