//! Infrastructure provider interface and mock implementation.
//!
//! The provider abstracts instance lifecycle operations:
//! - Accepting the environment configuration
//! - Starting an instance for a machine
//! - Stopping instances
//! - Listing every instance it runs
//!
//! A mock implementation is provided for testing and development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_id::{InstanceId, MachineId};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::environ::EnvironConfig;

/// Errors from provider operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying: rate limits, timeouts, flaky API.
    #[error("provider temporarily unavailable: {0}")]
    Transient(String),

    /// The provider rejected the environment configuration.
    #[error("provider rejected configuration: {0}")]
    InvalidConfig(String),

    #[error("provider operation failed: {0}")]
    Failed(String),

    #[error("provider has no configuration")]
    NotConfigured,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// An instance running at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,

    /// Machine the instance was started for.
    pub machine_id: MachineId,
}

/// Parameters for a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConstraints {
    pub series: String,
}

impl InstanceConstraints {
    pub fn from_config(config: &EnvironConfig) -> Self {
        Self {
            series: config.default_series.clone(),
        }
    }
}

/// Infrastructure provider interface.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Apply a validated environment configuration.
    async fn set_config(&self, config: &EnvironConfig) -> Result<(), ProviderError>;

    /// Start an instance for a machine.
    async fn start_instance(
        &self,
        machine_id: &MachineId,
        constraints: &InstanceConstraints,
    ) -> Result<Instance, ProviderError>;

    /// Stop instances. Ids the provider doesn't know are ignored.
    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), ProviderError>;

    /// Every instance the provider runs.
    async fn all_instances(&self) -> Result<Vec<Instance>, ProviderError>;
}

// =============================================================================
// Mock Provider
// =============================================================================

/// Provider calls observed by a [`MockProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    SetConfig {
        name: String,
    },
    StartInstance {
        machine_id: MachineId,
        instance_id: InstanceId,
    },
    StopInstances {
        ids: Vec<InstanceId>,
    },
}

/// Mock provider for testing and development.
pub struct MockProvider {
    inner: Mutex<MockInner>,
    ops: Option<mpsc::UnboundedSender<Operation>>,
}

#[derive(Default)]
struct MockInner {
    instances: BTreeMap<InstanceId, Instance>,
    next_instance: u64,
    config: Option<EnvironConfig>,
    fail_starts: bool,
    reject_config: bool,
    unavailable: bool,
}

impl MockProvider {
    /// Create a new mock provider.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner::default()),
            ops: None,
        }
    }

    /// Create a mock provider that reports every successful mutation.
    pub fn with_operations() -> (Self, mpsc::UnboundedReceiver<Operation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Self {
            inner: Mutex::new(MockInner::default()),
            ops: Some(tx),
        };
        (provider, rx)
    }

    /// Create a mock provider that fails all starts.
    pub fn failing() -> Self {
        let provider = Self::new();
        provider.set_fail_starts(true);
        provider
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.inner.lock().fail_starts = fail;
    }

    /// Make `set_config` reject every configuration.
    pub fn set_reject_config(&self, reject: bool) {
        self.inner.lock().reject_config = reject;
    }

    /// Make every call fail with [`ProviderError::Transient`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Seed an instance without reporting an operation.
    pub fn insert_instance(&self, machine_id: &MachineId) -> Result<InstanceId, ProviderError> {
        let mut inner = self.inner.lock();
        let id = inner.allocate_id()?;
        inner.instances.insert(
            id.clone(),
            Instance {
                id: id.clone(),
                machine_id: machine_id.clone(),
            },
        );
        Ok(id)
    }

    /// Ids of running instances, in order.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.inner.lock().instances.keys().cloned().collect()
    }

    /// Configuration last accepted.
    pub fn config(&self) -> Option<EnvironConfig> {
        self.inner.lock().config.clone()
    }

    fn report(&self, op: Operation) {
        if let Some(tx) = &self.ops {
            // Tests may drop the receiver early.
            let _ = tx.send(op);
        }
    }
}

impl MockInner {
    fn allocate_id(&mut self) -> Result<InstanceId, ProviderError> {
        let n = self.next_instance;
        self.next_instance += 1;
        InstanceId::parse(&format!("i-{n}")).map_err(|e| ProviderError::Failed(e.to_string()))
    }

    fn check_available(&self) -> Result<(), ProviderError> {
        if self.unavailable {
            return Err(ProviderError::Transient("mock provider offline".into()));
        }
        Ok(())
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn set_config(&self, config: &EnvironConfig) -> Result<(), ProviderError> {
        {
            let mut inner = self.inner.lock();
            inner.check_available()?;
            if inner.reject_config {
                return Err(ProviderError::InvalidConfig(format!(
                    "environment {:?} not supported by mock provider",
                    config.name
                )));
            }
            inner.config = Some(config.clone());
        }

        debug!(environ = %config.name, "[MOCK] Configuration applied");
        self.report(Operation::SetConfig {
            name: config.name.clone(),
        });
        Ok(())
    }

    async fn start_instance(
        &self,
        machine_id: &MachineId,
        constraints: &InstanceConstraints,
    ) -> Result<Instance, ProviderError> {
        let instance = {
            let mut inner = self.inner.lock();
            inner.check_available()?;
            if inner.config.is_none() {
                return Err(ProviderError::NotConfigured);
            }
            if inner.fail_starts {
                return Err(ProviderError::Failed(
                    "mock provider configured to fail".into(),
                ));
            }
            let id = inner.allocate_id()?;
            let instance = Instance {
                id: id.clone(),
                machine_id: machine_id.clone(),
            };
            inner.instances.insert(id, instance.clone());
            instance
        };

        info!(
            machine_id = %machine_id,
            instance_id = %instance.id,
            series = %constraints.series,
            "[MOCK] Instance started"
        );
        self.report(Operation::StartInstance {
            machine_id: machine_id.clone(),
            instance_id: instance.id.clone(),
        });
        Ok(instance)
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), ProviderError> {
        {
            let mut inner = self.inner.lock();
            inner.check_available()?;
            for id in ids {
                inner.instances.remove(id);
            }
        }

        info!(count = ids.len(), "[MOCK] Instances stopped");
        self.report(Operation::StopInstances { ids: ids.to_vec() });
        Ok(())
    }

    async fn all_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.instances.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environ::attrs;
    use serde_json::json;

    fn config() -> EnvironConfig {
        EnvironConfig::from_attrs(&attrs([("name", json!("testing")), ("type", json!("mock"))]))
            .unwrap()
    }

    fn constraints() -> InstanceConstraints {
        InstanceConstraints {
            series: "precise".into(),
        }
    }

    #[tokio::test]
    async fn test_mock_provider_start_requires_config() {
        let provider = MockProvider::new();
        let machine = MachineId::from_index(1);
        assert_eq!(
            provider.start_instance(&machine, &constraints()).await,
            Err(ProviderError::NotConfigured)
        );

        provider.set_config(&config()).await.unwrap();
        let instance = provider
            .start_instance(&machine, &constraints())
            .await
            .unwrap();
        assert_eq!(instance.machine_id, machine);
        assert_eq!(provider.all_instances().await.unwrap(), vec![instance]);
    }

    #[tokio::test]
    async fn test_mock_provider_operations() {
        let (provider, mut ops) = MockProvider::with_operations();
        let seeded = provider.insert_instance(&MachineId::from_index(7)).unwrap();

        provider.set_config(&config()).await.unwrap();
        provider.stop_instances(&[seeded.clone()]).await.unwrap();

        assert_eq!(
            ops.recv().await,
            Some(Operation::SetConfig {
                name: "testing".into()
            })
        );
        assert_eq!(
            ops.recv().await,
            Some(Operation::StopInstances { ids: vec![seeded] })
        );
        assert!(provider.instance_ids().is_empty());
    }

    #[tokio::test]
    async fn test_mock_provider_failing() {
        let provider = MockProvider::failing();
        provider.set_config(&config()).await.unwrap();
        let result = provider
            .start_instance(&MachineId::from_index(1), &constraints())
            .await;
        assert!(matches!(result, Err(ProviderError::Failed(_))));
    }

    #[tokio::test]
    async fn test_mock_provider_rejects_config() {
        let provider = MockProvider::new();
        provider.set_reject_config(true);
        let result = provider.set_config(&config()).await;
        assert!(matches!(result, Err(ProviderError::InvalidConfig(_))));
        assert!(provider.config().is_none());
    }

    #[tokio::test]
    async fn test_mock_provider_unavailable_is_transient() {
        let provider = MockProvider::new();
        provider.set_unavailable(true);
        let err = provider.all_instances().await.unwrap_err();
        assert!(err.is_transient());
    }
}
