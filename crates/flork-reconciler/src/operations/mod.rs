//! Status persistence for managed resources
//!
//! Two backends exist: [`CrdResourceOperations`] writes the status
//! subresource of the custom resource itself, [`ConfigMapResourceOperations`]
//! keeps the status in a sibling record for clusters where the CRDs cannot be
//! installed.

mod config_map;
mod crd;

use async_trait::async_trait;
use flork_common::crd::ManagedResource;
use flork_common::Result;

pub use config_map::{
    build_status_record, carrier_name, resource_from_records, status_record_name,
    ConfigMapResourceOperations, RESOURCE_DATA_KEY,
};
pub use crd::{CrdResourceOperations, ResourceCache};

/// Reads and writes of a managed resource's persisted state
#[async_trait]
pub trait ResourceOperations<R: ManagedResource>: Send + Sync {
    /// Latest known snapshot of `resource`
    async fn reload(&self, resource: &R) -> Result<R>;

    /// Persist the status carried by `resource`, retrying until it sticks
    async fn patch_status(&self, resource: &R) -> Result<R>;

    /// Delete the resource, false when it was already gone
    async fn delete(&self, resource: &R) -> Result<bool>;
}
