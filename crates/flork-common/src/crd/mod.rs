//! Custom Resource Definitions for flork
//!
//! Both resource kinds share one status model and are handled by the same
//! reconciliation engine through the [`ManagedResource`] trait.

mod job;
mod session;
mod types;

use std::fmt::Debug;

use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use job::{FlinkJob, FlinkJobSpec};
pub use session::{FlinkSession, FlinkSessionSpec};
pub use types::{
    preserve_unknown_fields, DeletionPolicy, DeletionTrigger, FlinkConf, FlorkConf, FlorkPhase,
    FlorkPolicies, FlorkStatus, SavepointPolicy,
};

/// Runtime configuration key enabling HA services
pub const HIGH_AVAILABILITY_KEY: &str = "high-availability";

/// Unique identity of a managed resource within the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Resource namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the Lease guarding this resource.
    ///
    /// Any process can compute it independently from the key.
    pub fn lease_name(&self) -> String {
        format!("flork-lease-{}-{}", self.namespace, self.name)
    }

    /// Prefix for scratch directories created on behalf of this resource
    pub fn scratch_prefix(&self) -> String {
        format!("{}_{}_", self.namespace, self.name)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A custom resource whose lifecycle the reconciliation engine drives.
///
/// Implementors only expose their status slot and spec pieces; everything
/// the engine needs is derived from those.
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Stored status, if any was ever written
    fn status_field(&self) -> Option<&FlorkStatus>;

    /// Mutable access to the stored status
    fn status_field_mut(&mut self) -> &mut Option<FlorkStatus>;

    /// Controller-level switches
    fn flork_conf(&self) -> &FlorkConf;

    /// Runtime configuration overrides
    fn flink_conf(&self) -> &FlinkConf;

    /// Declared policies
    fn policies(&self) -> Option<&FlorkPolicies>;

    /// Kind name for logs and errors
    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }

    /// Key of this resource
    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Generation of the declared spec, absent generations count as 1
    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(1)
    }

    /// Status, defaulting to `CREATED` when none is stored
    fn flork_status(&self) -> FlorkStatus {
        self.status_field().cloned().unwrap_or_default()
    }

    /// Current phase
    fn phase(&self) -> FlorkPhase {
        self.status_field()
            .map(|s| s.flork_phase)
            .unwrap_or_default()
    }

    /// Status for modification, initialized to the default when absent
    fn flork_status_mut(&mut self) -> &mut FlorkStatus {
        self.status_field_mut().get_or_insert_with(FlorkStatus::default)
    }

    /// Whether the resource itself is deleted once its workload completes
    fn delete_on_termination(&self) -> bool {
        self.policies()
            .and_then(|p| p.deletion.as_ref())
            .and_then(|d| d.trigger)
            == Some(DeletionTrigger::Termination)
    }

    /// Whether stop savepoints advance to the end of event time
    fn advance_to_end_of_event_time(&self) -> bool {
        self.policies()
            .and_then(|p| p.savepoint.as_ref())
            .is_some_and(|s| s.advance_to_end_of_event_time)
    }

    /// Whether HA records must be removed when the workload goes away
    fn wants_high_availability_cleanup(&self) -> bool {
        self.flink_conf().contains_key(HIGH_AVAILABILITY_KEY)
            && self.flork_conf().clean_high_availability
    }
}

impl ManagedResource for FlinkJob {
    fn status_field(&self) -> Option<&FlorkStatus> {
        self.status.as_ref()
    }

    fn status_field_mut(&mut self) -> &mut Option<FlorkStatus> {
        &mut self.status
    }

    fn flork_conf(&self) -> &FlorkConf {
        &self.spec.flork_conf
    }

    fn flink_conf(&self) -> &FlinkConf {
        &self.spec.flink_conf
    }

    fn policies(&self) -> Option<&FlorkPolicies> {
        self.spec.policies.as_ref()
    }
}

impl ManagedResource for FlinkSession {
    fn status_field(&self) -> Option<&FlorkStatus> {
        self.status.as_ref()
    }

    fn status_field_mut(&mut self) -> &mut Option<FlorkStatus> {
        &mut self.status
    }

    fn flork_conf(&self) -> &FlorkConf {
        &self.spec.flork_conf
    }

    fn flink_conf(&self) -> &FlinkConf {
        &self.spec.flink_conf
    }

    fn policies(&self) -> Option<&FlorkPolicies> {
        self.spec.policies.as_ref()
    }
}
