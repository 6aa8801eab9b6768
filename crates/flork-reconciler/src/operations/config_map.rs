//! Status persistence in sibling ConfigMaps
//!
//! Used when the custom resources cannot be installed: the resource
//! definition lives in a carrier ConfigMap under [`RESOURCE_DATA_KEY`], and
//! the metadata and status the controller maintains live in a status record
//! named after it. Only the holder of the resource's lease writes records.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flork_common::crd::{FlorkStatus, ManagedResource, ResourceKey};
use flork_common::leader_election::{lease_holder, LeaseStore};
use flork_common::retry::{retry_with_backoff_when, RetryConfig};
use flork_common::{Error, Result, METADATA_CM_VALIDITY_LABEL};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, trace, warn};

use super::ResourceOperations;

/// Carrier ConfigMap key holding the resource definition
pub const RESOURCE_DATA_KEY: &str = "customResource";

const METADATA_DATA_KEY: &str = "crMetadata";
const STATUS_DATA_KEY: &str = "crStatus";
const EXCEPTION_DATA_KEY: &str = "exception";
const STATUS_RECORD_SUFFIX: &str = "flork-status";

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Name of the status record belonging to `resource_name`
pub fn status_record_name(resource_name: &str) -> String {
    format!("{resource_name}-{STATUS_RECORD_SUFFIX}")
}

/// Name of the resource a status record belongs to
pub fn carrier_name(record_name: &str) -> Option<&str> {
    record_name
        .strip_suffix(STATUS_RECORD_SUFFIX)
        .and_then(|rest| rest.strip_suffix('-'))
        .filter(|name| !name.is_empty())
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| Error::serialization(e.to_string()))
}

fn from_yaml<T: DeserializeOwned>(kind: &str, yaml: &str) -> Result<T> {
    serde_yaml::from_str(yaml).map_err(|e| Error::serialization_for(kind, e.to_string()))
}

/// Initial status record for the resource carried by `carrier`.
///
/// Starts at generation 0 so the first reconstruction bumps it to 1.
pub fn build_status_record(carrier: &ConfigMap, status_label: &str) -> Result<ConfigMap> {
    let name = carrier.name_any();
    let meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: carrier.namespace(),
        creation_timestamp: carrier.metadata.creation_timestamp.clone(),
        generation: Some(0),
        ..Default::default()
    };

    let labels = BTreeMap::from([
        (status_label.to_string(), "true".to_string()),
        (METADATA_CM_VALIDITY_LABEL.to_string(), "false".to_string()),
    ]);
    let data = BTreeMap::from([
        (METADATA_DATA_KEY.to_string(), to_yaml(&meta)?),
        (STATUS_DATA_KEY.to_string(), to_yaml(&FlorkStatus::default())?),
    ]);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(status_record_name(&name)),
            namespace: carrier.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Reconstruct a resource from its carrier and (if present) status record.
///
/// Metadata and status come from the record. When the carrier changed since
/// the record was last synced, the generation advances by one.
pub fn resource_from_records<R: ManagedResource>(
    carrier: &ConfigMap,
    record: Option<&ConfigMap>,
) -> Result<R> {
    let kind = R::kind_name();
    let definition = carrier
        .data
        .as_ref()
        .and_then(|d| d.get(RESOURCE_DATA_KEY))
        .ok_or_else(|| {
            Error::serialization_for(
                &kind,
                format!(
                    "config map {} has no key '{RESOURCE_DATA_KEY}'",
                    carrier.name_any()
                ),
            )
        })?;
    let mut resource: R = from_yaml(&kind, definition)?;

    if let Some(data) = record.and_then(|r| r.data.as_ref()) {
        if let Some(meta) = data.get(METADATA_DATA_KEY) {
            *resource.meta_mut() = from_yaml(&kind, meta)?;
        }
        if let Some(status) = data.get(STATUS_DATA_KEY) {
            *resource.status_field_mut() = Some(from_yaml(&kind, status)?);
        }
        if resource.meta().resource_version != carrier.metadata.resource_version {
            let meta = resource.meta_mut();
            meta.generation = Some(meta.generation.unwrap_or(0) + 1);
            meta.resource_version = carrier.metadata.resource_version.clone();
        }
    }

    if resource.meta().namespace.is_none() {
        resource.meta_mut().namespace = carrier.namespace();
    }
    Ok(resource)
}

fn status_data_patch(status: &FlorkStatus) -> Result<serde_json::Value> {
    Ok(json!({ "data": { STATUS_DATA_KEY: to_yaml(status)? } }))
}

fn metadata_sync_patch(meta: &ObjectMeta) -> Result<serde_json::Value> {
    Ok(json!({
        "metadata": { "labels": { METADATA_CM_VALIDITY_LABEL: meta.resource_version } },
        "data": { METADATA_DATA_KEY: to_yaml(meta)?, EXCEPTION_DATA_KEY: null },
    }))
}

fn exception_patch(message: &str) -> serde_json::Value {
    json!({
        "metadata": { "labels": { METADATA_CM_VALIDITY_LABEL: "false" } },
        "data": { EXCEPTION_DATA_KEY: message.replace('\t', "  ") },
    })
}

/// Whether `identity` may write records guarded by `lease_name`.
///
/// Waits for the lease to exist, since writes before the first election
/// cannot be attributed to anyone.
async fn lease_permits_write(store: &dyn LeaseStore, lease_name: &str, identity: &str) -> Result<bool> {
    loop {
        match store.get(lease_name).await? {
            Some(lease) => {
                let leading = lease_holder(&lease) == Some(identity);
                trace!(lease = %lease_name, leading, "Checked lease before status write");
                return Ok(leading);
            }
            None => {
                warn!(lease = %lease_name, "Status write before a leader was elected, retrying");
                tokio::time::sleep(LEASE_POLL_INTERVAL).await;
            }
        }
    }
}

/// [`ResourceOperations`] storing status in per-resource records
pub struct ConfigMapResourceOperations<R: ManagedResource> {
    client: Client,
    leases: Arc<dyn LeaseStore>,
    identity: String,
    _kind: PhantomData<fn() -> R>,
}

impl<R: ManagedResource> ConfigMapResourceOperations<R> {
    /// Operations writing as `identity`, gated by leases in `leases`
    pub fn new(client: Client, leases: Arc<dyn LeaseStore>, identity: impl Into<String>) -> Self {
        Self {
            client,
            leases,
            identity: identity.into(),
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn leads(&self, key: &ResourceKey) -> Result<bool> {
        lease_permits_write(self.leases.as_ref(), &key.lease_name(), &self.identity).await
    }

    /// Create the status record for `carrier` unless it exists
    pub async fn ensure_status_record(&self, carrier: &ConfigMap, status_label: &str) -> Result<()> {
        let namespace = carrier.namespace().unwrap_or_default();
        let api = self.api(&namespace);
        let name = status_record_name(&carrier.name_any());
        if api.get_opt(&name).await?.is_some() {
            return Ok(());
        }

        info!(namespace = %namespace, record = %name, "Creating status record");
        match api
            .create(&PostParams::default(), &build_status_record(carrier, status_label)?)
            .await
        {
            Ok(_) => Ok(()),
            // another replica won the race
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resource carried by `carrier`, merged with its status record
    pub async fn load(&self, carrier: &ConfigMap) -> Result<R> {
        let namespace = carrier.namespace().unwrap_or_default();
        let record = self
            .api(&namespace)
            .get_opt(&status_record_name(&carrier.name_any()))
            .await?;
        resource_from_records(carrier, record.as_ref())
    }

    /// Store the resource's metadata in its record and clear any error
    pub async fn sync_metadata(&self, resource: &R) -> Result<()> {
        let key = resource.key();
        if !self.leads(&key).await? {
            return Ok(());
        }

        let api = self.api(&key.namespace);
        let name = status_record_name(&key.name);
        let stored: Option<ObjectMeta> = match api.get_opt(&name).await? {
            Some(record) => record
                .data
                .as_ref()
                .and_then(|d| d.get(METADATA_DATA_KEY))
                .map(|meta| from_yaml(&R::kind_name(), meta))
                .transpose()?,
            None => None,
        };

        let meta = resource.meta();
        if stored.as_ref().is_some_and(|s| {
            s.resource_version == meta.resource_version && s.generation == meta.generation
        }) {
            return Ok(());
        }

        api.patch(&name, &PatchParams::default(), &Patch::Merge(&metadata_sync_patch(meta)?))
            .await?;
        debug!(key = %key, generation = ?meta.generation, "Status record metadata synced");
        Ok(())
    }

    /// Record a processing error for the resource called `key`
    pub async fn record_exception(&self, key: &ResourceKey, message: &str) -> Result<()> {
        if !self.leads(key).await? {
            return Ok(());
        }
        self.api(&key.namespace)
            .patch(
                &status_record_name(&key.name),
                &PatchParams::default(),
                &Patch::Merge(&exception_patch(message)),
            )
            .await?;
        Ok(())
    }

    /// Delete the status record of the resource called `key`
    pub async fn delete_status_record(&self, key: &ResourceKey) -> Result<()> {
        match self
            .api(&key.namespace)
            .delete(&status_record_name(&key.name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<R: ManagedResource> ResourceOperations<R> for ConfigMapResourceOperations<R> {
    async fn reload(&self, resource: &R) -> Result<R> {
        Ok(resource.clone())
    }

    async fn patch_status(&self, resource: &R) -> Result<R> {
        let key = resource.key();
        if !self.leads(&key).await? {
            debug!(key = %key, "Not leading, skipping status write");
            return Ok(resource.clone());
        }

        let api = self.api(&key.namespace);
        let name = status_record_name(&key.name);
        let patch = status_data_patch(&resource.flork_status())?;

        retry_with_backoff_when(
            &RetryConfig::fixed(WRITE_RETRY_INTERVAL),
            "patch_status_record",
            |e: &Error| !e.is_cancelled(),
            || {
                let api = api.clone();
                let name = name.clone();
                let patch = patch.clone();
                async move {
                    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                        .map_err(Error::from)
                }
            },
        )
        .await?;

        debug!(key = %key, phase = %resource.phase(), "Status record patched");
        Ok(resource.clone())
    }

    async fn delete(&self, resource: &R) -> Result<bool> {
        let key = resource.key();
        match self
            .api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
