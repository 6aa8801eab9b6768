//! Shared types used by both flork custom resources

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a flork resource
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlorkPhase {
    /// Observed but not yet submitted
    #[default]
    Created,
    /// Workload submitted, waiting for it to report running
    Deploying,
    /// Workload running
    Deployed,
    /// Workload finished or was shut down
    Completed,
    /// Workload could not be deployed or vanished unexpectedly
    Failed,
}

impl FlorkPhase {
    /// Terminal phases never transition on their own
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for FlorkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Deploying => write!(f, "DEPLOYING"),
            Self::Deployed => write!(f, "DEPLOYED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status shared by FlinkJob and FlinkSession.
///
/// Only what is needed to resume after a crash or leadership handoff is
/// persisted. Optional fields serialize as `null` so that merge patches
/// clear them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlorkStatus {
    /// Current phase of the resource lifecycle
    #[serde(default)]
    pub flork_phase: FlorkPhase,

    /// Generation under which the last phase transition happened
    #[serde(default)]
    pub generation_during_last_transition: Option<i64>,

    /// Savepoint to restore from on the next deployment
    #[serde(default)]
    pub known_savepoint_path: Option<String>,
}

impl FlorkStatus {
    /// Status with the given phase and nothing else recorded
    pub fn with_phase(phase: FlorkPhase) -> Self {
        Self {
            flork_phase: phase,
            ..Default::default()
        }
    }
}

// =============================================================================
// Spec pieces
// =============================================================================

/// Controller-level switches for a resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlorkConf {
    /// Mount configuration files under a shadow path
    #[serde(default)]
    pub shadow_config_files: bool,

    /// Talk to the management endpoint through the in-cluster service
    #[serde(default = "default_true")]
    pub prefer_cluster_internal_service: bool,

    /// Remove HA records once the workload terminates
    #[serde(default = "default_true")]
    pub clean_high_availability: bool,
}

impl Default for FlorkConf {
    fn default() -> Self {
        Self {
            shadow_config_files: false,
            prefer_cluster_internal_service: true,
            clean_high_availability: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// What triggers automatic deletion of a resource
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionTrigger {
    /// Delete the resource once its workload completes
    Termination,
}

/// Deletion policy of a resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeletionPolicy {
    /// Trigger for automatic deletion, none keeps the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<DeletionTrigger>,
}

/// Savepoint policy of a resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavepointPolicy {
    /// Emit MAX_WATERMARK before taking the stop savepoint
    #[serde(default)]
    pub advance_to_end_of_event_time: bool,
}

/// Policies attached to a resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlorkPolicies {
    /// Deletion policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion: Option<DeletionPolicy>,

    /// Savepoint policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint: Option<SavepointPolicy>,
}

/// Free-form runtime configuration overrides
pub type FlinkConf = BTreeMap<String, serde_json::Value>;

/// Schema for free-form objects the API server must not prune
pub fn preserve_unknown_fields(
    _: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schema.into()
}
