//! Status persistence through the custom resource's status subresource

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flork_common::crd::{FlorkStatus, ManagedResource, ResourceKey};
use flork_common::retry::{Backoff, RetryConfig};
use flork_common::{Error, Result};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};

use super::ResourceOperations;

/// Pause between checks for the cache to be published
const CACHE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Informer cache of resources, published once its reflector is running
pub struct ResourceCache<R: ManagedResource> {
    store: Arc<RwLock<Option<Store<R>>>>,
}

impl<R: ManagedResource> Clone for ResourceCache<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<R: ManagedResource> Default for ResourceCache<R> {
    fn default() -> Self {
        Self {
            store: Arc::new(RwLock::new(None)),
        }
    }
}

impl<R: ManagedResource> ResourceCache<R> {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the reflector's store available to readers
    pub fn publish(&self, store: Store<R>) {
        *self.store.write() = Some(store);
    }

    fn current(&self) -> Option<Store<R>> {
        self.store.read().clone()
    }

    /// Wait until a store was published and has completed its first listing
    pub async fn ready(&self) -> Result<Store<R>> {
        loop {
            if let Some(store) = self.current() {
                store
                    .wait_until_ready()
                    .await
                    .map_err(|e| Error::internal("resource_cache", format!("{e:?}")))?;
                return Ok(store);
            }
            tokio::time::sleep(CACHE_POLL_INTERVAL).await;
        }
    }

    /// Cached copy of the resource with `key`, if any
    pub fn lookup(&self, key: &ResourceKey) -> Option<R> {
        let store = self.current()?;
        store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
            .map(|r| (*r).clone())
    }
}

/// Merge patch writing `status`, guarded by `resource_version` when known
fn status_patch(resource_version: Option<&str>, status: &FlorkStatus) -> Result<serde_json::Value> {
    let status = serde_json::to_value(status)?;
    Ok(match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": status }),
        None => json!({ "status": status }),
    })
}

/// [`ResourceOperations`] on the custom resource itself
pub struct CrdResourceOperations<R: ManagedResource> {
    client: Client,
    cache: ResourceCache<R>,
    retry: RetryConfig,
}

impl<R: ManagedResource> CrdResourceOperations<R> {
    /// Operations reading through `cache` and writing through `client`
    pub fn new(client: Client, cache: ResourceCache<R>) -> Self {
        Self {
            client,
            cache,
            retry: RetryConfig::infinite(),
        }
    }

    fn api(&self, namespace: &str) -> Api<R> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<R: ManagedResource> ResourceOperations<R> for CrdResourceOperations<R> {
    async fn reload(&self, resource: &R) -> Result<R> {
        let key = resource.key();
        let store = self.cache.ready().await?;
        store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
            .map(|r| (*r).clone())
            .ok_or_else(|| Error::NotFound {
                key: key.to_string(),
            })
    }

    async fn patch_status(&self, resource: &R) -> Result<R> {
        let key = resource.key();
        let api = self.api(&key.namespace);
        let status = resource.flork_status();
        let mut resource_version = resource.meta().resource_version.clone();
        let mut backoff = Backoff::from_config(&self.retry);

        loop {
            let body = status_patch(resource_version.as_deref(), &status)?;
            match api
                .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&body))
                .await
            {
                Ok(patched) => {
                    debug!(key = %key, phase = %status.flork_phase, "Status patched");
                    return Ok(patched);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        key = %key,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Could not patch status, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    // Only the status is reapplied, on top of the freshest copy.
                    if let Some(latest) = self.cache.lookup(&key) {
                        resource_version = latest.meta().resource_version.clone();
                    }
                }
            }
        }
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
