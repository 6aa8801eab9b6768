//! What the engine needs from a resource kind's workload
//!
//! The phases never talk to the runtime or the Kubernetes API directly.
//! Each resource kind supplies a [`WorkloadCapabilities`] implementation:
//! [`JobCapabilities`] deploys standalone application clusters,
//! [`SessionCapabilities`] only knows how to tear one down.

mod job;
mod manifests;
mod rest;
mod session;
mod watcher;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flork_common::crd::{FlinkConf, ManagedResource};
use flork_common::{Error, Result};
use serde::Deserialize;

pub use job::JobCapabilities;
pub use rest::RestManagementClient;
pub use session::SessionCapabilities;
pub use watcher::{KubeWorkloadWatcher, WorkloadWatcher};

/// Directory new savepoints are written to
pub const SAVEPOINT_DIR_KEY: &str = "state.savepoints.dir";
/// Savepoint a new deployment restores from
pub const SAVEPOINT_PATH_KEY: &str = "execution.savepoint.path";
/// TLS for the management REST endpoint
pub const REST_SSL_ENABLED_KEY: &str = "security.ssl.rest.enabled";
/// Keystore for the management REST endpoint
pub const REST_SSL_KEYSTORE_KEY: &str = "security.ssl.rest.keystore";

/// Effective runtime configuration of one deployment attempt
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeConfig {
    entries: BTreeMap<String, String>,
    conf_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Configuration from a resource's declared overrides.
    ///
    /// String values are taken verbatim, anything else in its JSON form.
    pub fn from_flink_conf(conf: &FlinkConf) -> Self {
        let entries = conf
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();
        Self {
            entries,
            conf_dir: None,
        }
    }

    /// Attach the directory the configuration files were written to
    pub fn with_conf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.conf_dir = Some(dir.into());
        self
    }

    /// Directory holding the materialized configuration files
    pub fn conf_dir(&self) -> Option<&Path> {
        self.conf_dir.as_deref()
    }

    /// Value of a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Set a key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Set a key unless it is already present
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_insert_with(|| value.into());
    }

    /// All entries
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Savepoint directory, if one is configured
    pub fn savepoint_dir(&self) -> Option<&str> {
        self.get(SAVEPOINT_DIR_KEY).filter(|dir| !dir.is_empty())
    }

    /// Whether the management endpoint uses TLS
    pub fn rest_tls_enabled(&self) -> bool {
        self.get(REST_SSL_ENABLED_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Restore the next deployment from `path`
    pub fn set_savepoint_path(&mut self, path: impl Into<String>) {
        self.set(SAVEPOINT_PATH_KEY, path);
    }

    /// Render as a flat YAML mapping, quoting values where YAML needs it
    pub fn render_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.entries)
            .map_err(|e| Error::serialization(format!("{}: {e}", manifests::CONF_FILE_NAME)))
    }
}

/// State of a job as reported by the management endpoint
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Initializing,
    Created,
    Running,
    Failing,
    Failed,
    Cancelling,
    Canceled,
    Finished,
    Restarting,
    Suspended,
    Reconciling,
    #[serde(other)]
    Unknown,
}

impl RunState {
    /// The job was accepted and is (about to be) processing
    pub fn is_up(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

/// A job known to the management endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInfo {
    /// Job id
    pub id: String,
    /// Current state
    pub state: RunState,
}

/// Client for a deployed cluster's management endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Jobs known to the cluster
    async fn list_jobs(&self) -> Result<Vec<JobInfo>>;

    /// Stop a job after taking a savepoint into `target_dir`, returning its path
    async fn stop_with_savepoint(
        &self,
        job_id: &str,
        target_dir: &str,
        advance_to_end_of_event_time: bool,
    ) -> Result<String>;

    /// Cancel a job without a savepoint
    async fn cancel(&self, job_id: &str) -> Result<()>;

    /// Delete a savepoint that is no longer needed
    async fn dispose_savepoint(&self, path: &str) -> Result<()>;
}

/// Workload operations a resource kind supplies to the engine
#[async_trait]
pub trait WorkloadCapabilities<R: ManagedResource>: Send + Sync {
    /// Materialize the runtime configuration into `scratch`
    async fn prepare(&self, resource: &R, scratch: &Path) -> Result<RuntimeConfig>;

    /// Deploy the workload. Deployment failures are reported as
    /// [`flork_common::Error::Deploy`] so callers can inspect the root cause.
    async fn submit(&self, resource: &R, config: &RuntimeConfig) -> Result<()>;

    /// Open a client for the deployed workload's management endpoint
    async fn connect(
        &self,
        resource: &R,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn ManagementClient>>;

    /// Delete the workload Deployment with foreground propagation,
    /// returning false when there was nothing to delete
    async fn delete_workload(&self, resource: &R) -> Result<bool>;

    /// Remove HA records left behind by the terminated workload
    async fn clean_high_availability(&self, resource: &R) -> Result<()>;
}
