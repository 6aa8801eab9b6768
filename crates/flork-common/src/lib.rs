//! Common types for flork: CRDs, errors, leader election and Kubernetes utilities

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod retry;
pub mod telemetry;

pub use error::{DeployError, Error};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the flork custom resources
pub const CRD_GROUP: &str = "flork.itom.com";

/// Label marking ConfigMaps that carry a FlinkJob definition
pub const FLINK_JOB_CM_LABEL: &str = "flork.itom.com/flink-job";

/// Label marking ConfigMaps that hold a FlinkJob's status record
pub const FLINK_JOB_STATUS_CM_LABEL: &str = "flork.itom.com/flink-job-status";

/// Label marking ConfigMaps that carry a FlinkSession definition
pub const FLINK_SESSION_CM_LABEL: &str = "flork.itom.com/flink-session";

/// Label on status records mirroring the last synced resourceVersion
pub const METADATA_CM_VALIDITY_LABEL: &str = "validity.flork.itom.com";

/// Field manager used for every write the controller performs
pub const FIELD_MANAGER: &str = "flork-controller";

/// Namespace used for leases when none is configured
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "flork";

/// Identity of this process for lease ownership.
///
/// Uses `POD_NAME` (downward API) when set so that the identity survives
/// container restarts, otherwise a random one.
pub fn process_identity() -> String {
    std::env::var("POD_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("flork-{}", uuid::Uuid::new_v4()))
}
