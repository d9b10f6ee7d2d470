//! Fleet Machine Agent Library
//!
//! The machine agent runs on every fleet member. It authenticates to the shared
//! state store, runs the responsibilities its machine record declares, and
//! restarts them together whenever one of them ends.
//!
//! ## Architecture
//!
//! ```text
//! MachineAgent (run loop, one epoch at a time)
//! └── Supervisor
//!     ├── Upgrader      (follows agent-version, requests restarts)
//!     ├── LifeWatcher   (ends the agent when its machine is dead)
//!     └── Provisioner   (ManageEnviron only: starts and stops instances)
//! ```
//!
//! ## Modules
//!
//! - `agent`: the run loop and its exit outcomes
//! - `supervisor`, `task`: epoch supervision and exit-cause arbitration
//! - `provisioner`: instance reconciliation against the provider
//! - `credentials`: credential file and password rotation
//! - `state`: state store contract and the in-memory store
//! - `provider`: provider contract and the mock provider

pub mod agent;
pub mod config;
pub mod credentials;
pub mod environ;
pub mod error;
pub mod lifecycle;
pub mod provider;
pub mod provisioner;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod tools;
pub mod upgrader;

// Re-export commonly used types
pub use agent::{AgentDeps, AgentExit, AgentPhase, AgentSettings, MachineAgent, StopHandle};
pub use error::{AgentError, ExitCause};
pub use provider::MockProvider;
pub use state::MemoryState;
