//! Instance provisioning for the environment.
//!
//! The provisioner keeps provider instances congruent with the machine
//! records in the state store:
//! - Every Alive machine without an instance gets one started
//! - Every instance not recorded on a live machine is stopped
//!
//! A pass runs once at startup and again after every machine or configuration
//! change. Passes never overlap; changes that arrive during a pass are folded
//! into one follow-up pass. Nothing is remembered across restarts except what
//! the store and the provider report, so an interrupted pass is simply
//! recomputed.

mod view;

pub use view::ReconciliationView;

use std::sync::Arc;

use async_trait::async_trait;
use fleet_reconcile::{retry, AttemptStrategy, RetryError, RetryTracker};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::environ::EnvironConfig;
use crate::error::AgentError;
use crate::provider::{InstanceConstraints, Provider, ProviderError};
use crate::state::{retry_call, StateStore};
use crate::task::{TaskResult, Worker};

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub started: usize,
    pub stopped: usize,
    pub failed: usize,
    /// The pass made no provider calls because the configuration is unusable.
    pub suspended: bool,
}

/// Drives provider instances toward the machine records.
pub struct Provisioner {
    store: Arc<dyn StateStore>,
    provider: Arc<dyn Provider>,
    attempt: AttemptStrategy,
    failures: RetryTracker,
    /// Configuration the provider last accepted.
    applied: Option<EnvironConfig>,
    suspended: bool,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn StateStore>,
        provider: Arc<dyn Provider>,
        attempt: AttemptStrategy,
    ) -> Self {
        Self {
            store,
            provider,
            attempt,
            failures: RetryTracker::default(),
            applied: None,
            suspended: false,
        }
    }

    fn suspend(&mut self, reason: &dyn std::fmt::Display) -> PassStats {
        if self.suspended {
            debug!(reason = %reason, "Reconciliation still suspended");
        } else {
            warn!(reason = %reason, "Reconciliation suspended");
            self.suspended = true;
        }
        PassStats {
            suspended: true,
            ..PassStats::default()
        }
    }

    fn record_failure(&mut self, key: &str, what: &str, e: &dyn std::fmt::Display) {
        if self.failures.record_failure(key) {
            error!(resource = %key, error = %e, "{what} keeps failing");
        } else {
            warn!(resource = %key, error = %e, "{what} failed");
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Individual start and stop failures are logged and counted. Errors
    /// reading desired or actual state end the pass with an error. A
    /// cancelled pass returns what it got done so far.
    pub async fn reconcile(&mut self, cancel: &CancellationToken) -> Result<PassStats, AgentError> {
        let Some(attrs) =
            retry_call(&self.attempt, cancel, || self.store.environ_config()).await?
        else {
            return Ok(PassStats::default());
        };
        let config = match EnvironConfig::from_attrs(&attrs) {
            Ok(config) => config,
            Err(e) => return Ok(self.suspend(&e)),
        };

        if self.applied.as_ref() != Some(&config) {
            let result = retry(&self.attempt, cancel, ProviderError::is_transient, || {
                self.provider.set_config(&config)
            })
            .await;
            match result {
                Ok(()) => {
                    info!(environ = %config.name, kind = %config.kind, "Provider configured");
                    self.applied = Some(config.clone());
                }
                Err(RetryError::Cancelled) => return Ok(PassStats::default()),
                Err(RetryError::Permanent(ProviderError::InvalidConfig(reason))) => {
                    return Ok(self.suspend(&reason));
                }
                Err(e) => return Err(e.into_inner().map(Into::into).unwrap_or_else(cancelled)),
            }
        }
        if self.suspended {
            info!(environ = %config.name, "Reconciliation resumed");
            self.suspended = false;
        }

        let Some(machines) =
            retry_call(&self.attempt, cancel, || self.store.all_machines()).await?
        else {
            return Ok(PassStats::default());
        };
        let instances = match retry(&self.attempt, cancel, ProviderError::is_transient, || {
            self.provider.all_instances()
        })
        .await
        {
            Ok(instances) => instances,
            Err(RetryError::Cancelled) => return Ok(PassStats::default()),
            Err(e) => return Err(e.into_inner().map(Into::into).unwrap_or_else(cancelled)),
        };

        let view = ReconciliationView::compute(&machines, &instances);
        for (machine_id, instance_id) in &view.missing {
            warn!(machine_id = %machine_id, instance_id = %instance_id, "Recorded instance not running");
        }
        if view.is_converged() {
            debug!(machines = machines.len(), instances = view.known, "Nothing to reconcile");
            return Ok(PassStats::default());
        }

        let mut stats = PassStats::default();
        let constraints = InstanceConstraints::from_config(&config);

        for machine_id in &view.unprovisioned {
            if cancel.is_cancelled() {
                return Ok(stats);
            }
            let started = retry(&self.attempt, cancel, ProviderError::is_transient, || {
                self.provider.start_instance(machine_id, &constraints)
            })
            .await;

            let key = format!("machine-{machine_id}");
            let instance = match started {
                Ok(instance) => instance,
                Err(RetryError::Cancelled) => return Ok(stats),
                Err(e) => {
                    stats.failed += 1;
                    self.record_failure(&key, "Instance start", &e);
                    continue;
                }
            };

            // A failed write leaves the instance unrecorded; a later pass
            // stops it and starts a replacement.
            let recorded = retry_call(&self.attempt, cancel, || {
                self.store.set_instance_id(machine_id, &instance.id)
            })
            .await;
            match recorded {
                Ok(Some(())) => {}
                Ok(None) => return Ok(stats),
                Err(e) => {
                    stats.failed += 1;
                    error!(
                        machine_id = %machine_id,
                        instance_id = %instance.id,
                        error = %e,
                        "Started instance but could not record it"
                    );
                    continue;
                }
            }

            self.failures.clear(&key);
            stats.started += 1;
            info!(machine_id = %machine_id, instance_id = %instance.id, "Instance started");
        }

        if !view.to_stop.is_empty() {
            let stopped = retry(&self.attempt, cancel, ProviderError::is_transient, || {
                self.provider.stop_instances(&view.to_stop)
            })
            .await;
            match stopped {
                Ok(()) => {
                    stats.stopped = view.to_stop.len();
                    self.failures.clear("stop-instances");
                    info!(instances = ?view.to_stop, "Unknown instances stopped");
                }
                Err(RetryError::Cancelled) => return Ok(stats),
                Err(e) => {
                    stats.failed += 1;
                    self.record_failure("stop-instances", "Instance stop", &e);
                }
            }
        }

        self.failures.prune();
        Ok(stats)
    }
}

fn cancelled() -> AgentError {
    AgentError::Transient("provider call cancelled".into())
}

#[async_trait]
impl Worker for Provisioner {
    fn name(&self) -> &str {
        "provisioner"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> TaskResult {
        let mut this = *self;
        let mut machines = this.store.watch_machines();
        let mut config = this.store.watch_environ_config();
        info!("Provisioner started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = machines.changed() => changed?,
                changed = config.changed() => changed?,
            }

            let stats = this.reconcile(&cancel).await?;
            if stats.started + stats.stopped + stats.failed > 0 {
                info!(
                    started = stats.started,
                    stopped = stats.stopped,
                    failed = stats.failed,
                    "Reconciliation pass complete"
                );
            }
        }

        info!("Provisioner stopped");
        Ok(())
    }
}
