//! # fleet-id
//!
//! Typed identifiers for the fleet agent.
//!
//! ## Design Principles
//!
//! - Identifiers are assigned by their owner (the state store for machines,
//!   the infrastructure provider for instances) and never invented locally
//! - Every identifier has one canonical string form with strict parsing
//! - Identifiers are typed so a machine id can't be passed where an instance
//!   id is expected
//!
//! ## Formats
//!
//! - `MachineId`: a non-negative decimal integer without leading zeros (`0`, `17`)
//! - `InstanceId`: any non-empty provider string without whitespace (`i-7`)
//! - `EntityTag`: `{kind}-{id}`, e.g. `machine-0`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
