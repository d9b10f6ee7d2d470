//! Shared state store contract and an in-memory implementation.
//!
//! The state store is the fleet's single source of truth for desired state:
//! machine records, their life-cycle, and the environment configuration. The
//! agent only reads desired state and writes back the few facts it owns (its
//! password, its tools version, the instance id of a machine it provisioned).
//!
//! Watches carry no payload; consumers re-read state after every notification.

mod memory;
mod store;

pub use memory::MemoryState;
pub use store::{
    retry_call, EntityRecord, Job, Life, MachineRecord, StateConnector, StateStore, StoreError,
    Watch,
};
