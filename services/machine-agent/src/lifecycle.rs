//! Watches the agent's own entity and ends the epoch once it is gone.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_id::EntityTag;
use fleet_reconcile::AttemptStrategy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::state::{retry_call, EntityRecord, Life, StateStore, StoreError};
use crate::task::{TaskResult, Worker};

/// Check whether an entity lookup means the agent has nothing left to do.
pub fn check_entity(
    tag: &EntityTag,
    lookup: Result<EntityRecord, StoreError>,
) -> Result<EntityRecord, AgentError> {
    match lookup {
        Ok(entity) if entity.life == Life::Dead => Err(AgentError::EntityGone(tag.clone())),
        Ok(entity) => Ok(entity),
        Err(StoreError::NotFound(_)) => Err(AgentError::EntityGone(tag.clone())),
        Err(e) => Err(e.into()),
    }
}

/// Ends with [`AgentError::EntityGone`] once the entity dies or is removed.
pub struct LifeWatcher {
    tag: EntityTag,
    store: Arc<dyn StateStore>,
    attempt: AttemptStrategy,
}

impl LifeWatcher {
    pub fn new(tag: EntityTag, store: Arc<dyn StateStore>, attempt: AttemptStrategy) -> Self {
        Self { tag, store, attempt }
    }
}

#[async_trait]
impl Worker for LifeWatcher {
    fn name(&self) -> &str {
        "lifecycle"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> TaskResult {
        let mut watch = self.store.watch_entity(&self.tag);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                changed = watch.changed() => changed?,
            }

            let entity = retry_call(&self.attempt, &cancel, || self.store.entity(&self.tag)).await;
            let lookup = match entity {
                Ok(Some(entity)) => Ok(entity),
                Ok(None) => return Ok(()),
                Err(e) => Err(e),
            };
            match check_entity(&self.tag, lookup) {
                Ok(entity) => debug!(tag = %self.tag, life = %entity.life, "Entity checked"),
                Err(e) => {
                    info!(tag = %self.tag, error = %e, "Entity is gone");
                    return Err(e);
                }
            }
        }
    }
}
