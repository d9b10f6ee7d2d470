//! Agent error taxonomy and exit-cause ranking.
//!
//! Every task reports failure as an [`AgentError`]. The supervisor never looks
//! at error content beyond its [`ExitCause`], a closed enumeration with a total
//! order that decides which of several concurrently finishing tasks speaks for
//! the whole epoch.

use std::time::Duration;

use fleet_id::EntityTag;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::environ::ConfigError;
use crate::provider::ProviderError;
use crate::state::StoreError;
use crate::tools::{ToolsError, Version};

/// Errors reported by agent tasks and the agent run loop.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Network or backend hiccup; the epoch is retried.
    #[error("transient error: {0}")]
    Transient(String),

    /// The environment configuration failed validation.
    #[error("invalid environment configuration: {0}")]
    ConfigInvalid(String),

    /// The agent's entity is dead or has been removed from the fleet.
    #[error("entity {0} is dead or has been removed")]
    EntityGone(EntityTag),

    /// New agent tools are staged; the agent must restart to run them.
    #[error("agent upgrade from {old} to {new} is ready, restart required")]
    UpgradeReady { old: Version, new: Version },

    /// A task ignored cancellation past the supervisor's stop bound.
    #[error("task {task} did not stop within {timeout:?}")]
    StopTimeout { task: String, timeout: Duration },

    /// Anything else.
    #[error("{0}")]
    Fatal(String),
}

impl AgentError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        AgentError::Fatal(msg.into())
    }
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Closed | StoreError::Unavailable(_) => AgentError::Transient(e.to_string()),
            _ => AgentError::Fatal(e.to_string()),
        }
    }
}

impl From<ProviderError> for AgentError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Transient(_) => AgentError::Transient(e.to_string()),
            ProviderError::InvalidConfig(_) => AgentError::ConfigInvalid(e.to_string()),
            _ => AgentError::Fatal(e.to_string()),
        }
    }
}

impl From<CredentialError> for AgentError {
    fn from(e: CredentialError) -> Self {
        AgentError::Fatal(e.to_string())
    }
}

impl From<ToolsError> for AgentError {
    fn from(e: ToolsError) -> Self {
        AgentError::Fatal(e.to_string())
    }
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        AgentError::ConfigInvalid(e.to_string())
    }
}

// =============================================================================
// Exit Cause
// =============================================================================

/// Significance of a task outcome, least significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitCause {
    /// Clean completion.
    None,
    /// Any error without a more specific meaning.
    GenericError,
    /// The agent must restart under new tools.
    UpgradeRequested,
    /// The agent's entity is gone; the agent must exit.
    TerminateRequested,
}

impl ExitCause {
    /// Rank a task outcome.
    pub fn of(result: &Result<(), AgentError>) -> Self {
        match result {
            Ok(()) => ExitCause::None,
            Err(AgentError::EntityGone(_)) => ExitCause::TerminateRequested,
            Err(AgentError::UpgradeReady { .. }) => ExitCause::UpgradeRequested,
            Err(_) => ExitCause::GenericError,
        }
    }
}

impl std::fmt::Display for ExitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitCause::None => "none",
            ExitCause::GenericError => "error",
            ExitCause::UpgradeRequested => "upgrade",
            ExitCause::TerminateRequested => "terminate",
        };
        f.write_str(s)
    }
}
