//! Capabilities of `FlinkSession`
//!
//! Session clusters can be torn down but not yet deployed; the deployment
//! side reports itself as not implemented so the resource ends up FAILED
//! with a clear reason instead of sitting in CREATED forever.

use std::path::Path;

use async_trait::async_trait;
use flork_common::crd::{FlinkSession, ManagedResource};
use flork_common::kube_utils::delete_deployment_foreground;
use flork_common::{Error, Result};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{ManagementClient, RuntimeConfig, WorkloadCapabilities};

/// [`WorkloadCapabilities`] for `FlinkSession`
#[derive(Clone)]
pub struct SessionCapabilities {
    client: Client,
}

impl SessionCapabilities {
    /// Capabilities acting through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadCapabilities<FlinkSession> for SessionCapabilities {
    async fn prepare(&self, _session: &FlinkSession, _scratch: &Path) -> Result<RuntimeConfig> {
        Err(Error::not_implemented(FlinkSession::kind_name(), "prepare"))
    }

    async fn submit(&self, _session: &FlinkSession, _config: &RuntimeConfig) -> Result<()> {
        Err(Error::not_implemented(FlinkSession::kind_name(), "submit"))
    }

    async fn connect(
        &self,
        _session: &FlinkSession,
        _config: &RuntimeConfig,
    ) -> Result<Box<dyn ManagementClient>> {
        Err(Error::not_implemented(FlinkSession::kind_name(), "connect"))
    }

    async fn delete_workload(&self, session: &FlinkSession) -> Result<bool> {
        delete_deployment_foreground(
            &self.client,
            &session.namespace().unwrap_or_default(),
            &session.name_any(),
        )
        .await
    }

    async fn clean_high_availability(&self, session: &FlinkSession) -> Result<()> {
        debug!(key = %session.key(), "Sessions keep their HA records");
        Ok(())
    }
}
