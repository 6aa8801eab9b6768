//! flork - Kubernetes operator for Flink jobs and sessions
//!
//! Every `FlinkJob` and `FlinkSession` is driven by a per-resource state
//! machine from [`flork_reconciler`]. This crate holds the operator's
//! command line and the watch wiring that feeds resource events into the
//! engine.
//!
//! # Modules
//!
//! - [`runner`] - watches, caches and the controller loop

#![deny(missing_docs)]

pub mod runner;

use std::time::Duration;

use clap::{Parser, ValueEnum};
use flork_common::crd::{FlinkJob, FlinkSession};
use flork_common::DEFAULT_CONTROLLER_NAMESPACE;
use flork_reconciler::ReconcilerConfig;
use kube::CustomResourceExt;

/// Watch every namespace
pub const ALL_NAMESPACES: &str = "*";

/// Where resource definitions and their status live
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// FlinkJob/FlinkSession custom resources with a status subresource
    #[default]
    Crd,
    /// FlinkJob definitions carried by labelled ConfigMaps, status kept in
    /// sibling status records
    ConfigMap,
}

/// flork - lifecycle management of Flink workloads on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "flork", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Namespace holding the per-resource leases
    #[arg(long, env = "FLORK_NAMESPACE", default_value = DEFAULT_CONTROLLER_NAMESPACE)]
    pub namespace: String,

    /// Lease holder identity; a random one is generated when unset
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace whose resources are managed, `*` for all
    #[arg(long, env = "FLORK_WATCH_NAMESPACE", default_value = ALL_NAMESPACES)]
    pub watch_namespace: String,

    /// Validity of a per-resource lease without renewal
    #[arg(long, env = "FLORK_LEASE_DURATION_SECS", default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// Persistence backend
    #[arg(long, env = "FLORK_BACKEND", value_enum, default_value_t = Backend::Crd)]
    pub backend: Backend,

    /// Log JSON lines instead of human-readable output
    #[arg(long, env = "FLORK_JSON_LOGS")]
    pub json_logs: bool,
}

impl Cli {
    /// Identity used as lease holder
    pub fn identity(&self) -> String {
        self.pod_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(flork_common::process_identity)
    }

    /// Namespace to watch, None for all of them
    pub fn watched_namespace(&self) -> Option<&str> {
        match self.watch_namespace.as_str() {
            "" | ALL_NAMESPACES => None,
            namespace => Some(namespace),
        }
    }

    /// Engine settings derived from the command line
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::new(self.identity(), &self.namespace)
            .with_lease_duration(Duration::from_secs(self.lease_duration_secs))
    }
}

/// CRD manifests of both resource kinds as a multi-document YAML stream
pub fn crd_manifests() -> Result<String, serde_yaml::Error> {
    Ok(format!(
        "{}---\n{}",
        serde_yaml::to_string(&FlinkJob::crd())?,
        serde_yaml::to_string(&FlinkSession::crd())?
    ))
}
