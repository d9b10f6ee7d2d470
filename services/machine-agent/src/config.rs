//! Configuration for the machine agent process.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::{EntityTag, MachineId};
use fleet_reconcile::AttemptStrategy;

use crate::agent::AgentSettings;
use crate::supervisor::SupervisorConfig;

/// Machine agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Machine this agent runs for.
    pub machine_id: MachineId,

    /// Data directory for credentials and tools.
    pub data_dir: PathBuf,

    /// Pause between epochs in seconds.
    pub retry_delay_secs: u64,

    /// Bound on stopping an epoch's tasks in seconds.
    pub stop_timeout_secs: u64,

    /// Total duration of one provider or store call's retries in milliseconds.
    pub attempt_total_ms: u64,

    /// Delay between provider and store call retries in milliseconds.
    pub attempt_delay_ms: u64,

    /// Initial password, used when no credential file exists yet.
    pub bootstrap_password: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let machine_id = lookup("FLEET_MACHINE_ID").context("FLEET_MACHINE_ID is required")?;
        let machine_id = MachineId::parse(&machine_id).context("invalid FLEET_MACHINE_ID")?;

        let data_dir = lookup("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleet"));

        Ok(Self {
            machine_id,
            data_dir,
            retry_delay_secs: parse_or(&lookup, "FLEET_RETRY_DELAY_SECS", 3)?,
            stop_timeout_secs: parse_or(&lookup, "FLEET_STOP_TIMEOUT_SECS", 10)?,
            attempt_total_ms: parse_or(&lookup, "FLEET_ATTEMPT_TOTAL_MS", 5000)?,
            attempt_delay_ms: parse_or(&lookup, "FLEET_ATTEMPT_DELAY_MS", 200)?,
            bootstrap_password: lookup("FLEET_BOOTSTRAP_PASSWORD").filter(|p| !p.is_empty()),
            log_level: lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn tag(&self) -> EntityTag {
        EntityTag::machine(&self.machine_id)
    }

    /// Run loop settings derived from this configuration.
    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            supervisor: SupervisorConfig {
                stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            },
            attempt: AttemptStrategy::new(
                Duration::from_millis(self.attempt_total_ms),
                Duration::from_millis(self.attempt_delay_ms),
            ),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid {key}: {value:?}")),
        None => Ok(default),
    }
}
