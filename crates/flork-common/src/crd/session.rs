//! FlinkSession CRD types
//!
//! A `FlinkSession` is a long-lived session cluster that accepts jobs
//! submitted out of band.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{FlinkConf, FlorkConf, FlorkPolicies, FlorkStatus};

/// Flink session cluster managed by flork
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "flork.itom.com",
    version = "v1",
    kind = "FlinkSession",
    plural = "flinksessions",
    shortname = "fs",
    namespaced,
    status = "FlorkStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.florkPhase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlinkSessionSpec {
    /// Controller-level switches
    #[serde(default)]
    pub flork_conf: FlorkConf,

    /// Runtime configuration overrides
    #[serde(default)]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub flink_conf: FlinkConf,

    /// Overrides for the JobManager pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub job_manager_pod_spec: Option<serde_json::Value>,

    /// Overrides for the TaskManager pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub task_manager_pod_spec: Option<serde_json::Value>,

    /// Deletion and savepoint policies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<FlorkPolicies>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_names() {
        let crd = FlinkSession::crd();
        assert_eq!(crd.spec.names.plural, "flinksessions");
        assert_eq!(crd.spec.names.short_names, Some(vec!["fs".to_string()]));
    }
}
