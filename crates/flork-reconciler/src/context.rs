//! Shared state handed to every phaser of one resource kind

use std::sync::Arc;
use std::time::Duration;

use flork_common::crd::ManagedResource;
use flork_common::leader_election::{
    KubeLeaseStore, LeaderElectionConfig, LeaseStore, DEFAULT_LEASE_DURATION,
};
use kube::Client;

use crate::capabilities::{KubeWorkloadWatcher, WorkloadCapabilities, WorkloadWatcher};
use crate::operations::ResourceOperations;

/// Settings of the reconciliation engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Identity this process uses as lease holder
    pub identity: String,
    /// Namespace the per-resource leases live in
    pub lease_namespace: String,
    /// Validity of a lease without renewal
    pub lease_duration: Duration,
}

impl ReconcilerConfig {
    /// Config with the default lease duration
    pub fn new(identity: impl Into<String>, lease_namespace: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lease_namespace: lease_namespace.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }

    /// Override the lease duration
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Election timing derived from the lease duration
    pub fn election(&self) -> LeaderElectionConfig {
        LeaderElectionConfig::from_lease_duration(self.lease_duration)
    }
}

/// Collaborators of the engine for resources of kind `R`
///
/// Use [`ReconcilerContext::builder`] to construct instances:
///
/// ```ignore
/// let ctx = ReconcilerContext::builder(client, config, operations, capabilities).build();
/// ```
pub struct ReconcilerContext<R: ManagedResource> {
    /// Engine settings
    pub config: ReconcilerConfig,
    /// Status persistence
    pub operations: Arc<dyn ResourceOperations<R>>,
    /// Workload deployment and management
    pub capabilities: Arc<dyn WorkloadCapabilities<R>>,
    /// Observations of the workload Deployment
    pub watcher: Arc<dyn WorkloadWatcher>,
    /// Lease storage for per-resource leader election
    pub leases: Arc<dyn LeaseStore>,
}

impl<R: ManagedResource> ReconcilerContext<R> {
    /// Create a builder; the workload watcher is always Kubernetes-backed,
    /// the lease store defaults to one
    pub fn builder(
        client: Client,
        config: ReconcilerConfig,
        operations: Arc<dyn ResourceOperations<R>>,
        capabilities: Arc<dyn WorkloadCapabilities<R>>,
    ) -> ReconcilerContextBuilder<R> {
        ReconcilerContextBuilder {
            client,
            config,
            operations,
            capabilities,
            leases: None,
        }
    }

    /// Create a context from explicit collaborators
    ///
    /// Primarily for unit tests where no Kubernetes client is available.
    #[cfg(test)]
    pub fn for_testing(
        config: ReconcilerConfig,
        operations: Arc<dyn ResourceOperations<R>>,
        capabilities: Arc<dyn WorkloadCapabilities<R>>,
        watcher: Arc<dyn WorkloadWatcher>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            config,
            operations,
            capabilities,
            watcher,
            leases,
        }
    }
}

/// Builder for [`ReconcilerContext`]
pub struct ReconcilerContextBuilder<R: ManagedResource> {
    client: Client,
    config: ReconcilerConfig,
    operations: Arc<dyn ResourceOperations<R>>,
    capabilities: Arc<dyn WorkloadCapabilities<R>>,
    leases: Option<Arc<dyn LeaseStore>>,
}

impl<R: ManagedResource> ReconcilerContextBuilder<R> {
    /// Override the lease store
    pub fn lease_store(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Build the context
    pub fn build(self) -> ReconcilerContext<R> {
        let client = self.client;
        let lease_namespace = self.config.lease_namespace.clone();
        ReconcilerContext {
            watcher: Arc::new(KubeWorkloadWatcher::new(client.clone())),
            leases: self
                .leases
                .unwrap_or_else(|| Arc::new(KubeLeaseStore::new(client, &lease_namespace))),
            config: self.config,
            operations: self.operations,
            capabilities: self.capabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_timing_follows_lease_duration() {
        let config = ReconcilerConfig::new("pod-0", "flork").with_lease_duration(Duration::from_secs(30));
        let election = config.election();
        assert_eq!(election.lease_duration, Duration::from_secs(30));
        assert_eq!(election.renew_deadline, Duration::from_secs(20));
        assert_eq!(election.retry_period, Duration::from_secs(5));
    }

    #[test]
    fn default_lease_duration() {
        let config = ReconcilerConfig::new("pod-0", "flork");
        assert_eq!(config.lease_duration, DEFAULT_LEASE_DURATION);
    }
}
