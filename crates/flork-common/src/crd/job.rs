//! FlinkJob CRD types
//!
//! A `FlinkJob` is a one-shot job running on its own application-mode
//! cluster: one JobManager Deployment plus TaskManager pods it spawns.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{FlinkConf, FlorkConf, FlorkPolicies, FlorkStatus};

/// Flink job managed by flork
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "flork.itom.com",
    version = "v1",
    kind = "FlinkJob",
    plural = "flinkjobs",
    shortname = "fj",
    namespaced,
    status = "FlorkStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.florkPhase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlinkJobSpec {
    /// Controller-level switches
    #[serde(default)]
    pub flork_conf: FlorkConf,

    /// Runtime configuration overrides
    #[serde(default)]
    #[schemars(schema_with = "super::types::preserve_unknown_fields")]
    pub flink_conf: FlinkConf,

    /// Entry class of the job, defaults to the jar manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_class_name: Option<String>,

    /// Arguments passed to the job's entry point
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_args: Vec<String>,

    /// Extra files written next to the runtime configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_conf_files: BTreeMap<String, String>,

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
    fn crd_is_namespaced_with_status() {
        let crd = FlinkJob::crd();
        assert_eq!(crd.spec.group, "flork.itom.com");
        assert_eq!(crd.spec.names.kind, "FlinkJob");
        assert_eq!(crd.spec.names.short_names, Some(vec!["fj".to_string()]));
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }

    #[test]
    fn flink_conf_keeps_unknown_fields() {
        let crd = serde_json::to_value(FlinkJob::crd()).unwrap();
        let flink_conf = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"]["flinkConf"];
        assert_eq!(flink_conf["x-kubernetes-preserve-unknown-fields"], true);
    }

    #[test]
    fn spec_parses_from_camel_case() {
        let spec: FlinkJobSpec = serde_json::from_value(serde_json::json!({
            "jobClassName": "com.example.WordCount",
            "jobArgs": ["--input", "s3://in"],
            "flinkConf": {"state.savepoints.dir": "s3://sp", "parallelism.default": 4},
            "policies": {"savepoint": {"advanceToEndOfEventTime": true}}
        }))
        .unwrap();

        assert_eq!(spec.job_class_name.as_deref(), Some("com.example.WordCount"));
        assert_eq!(spec.job_args.len(), 2);
        assert_eq!(spec.flink_conf["parallelism.default"], 4);
        assert!(spec.flork_conf.clean_high_availability);
        assert!(
            spec.policies
                .and_then(|p| p.savepoint)
                .map(|s| s.advance_to_end_of_event_time)
                == Some(true)
        );
    }
}
