//! Routing of resource events to per-key phasers

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flork_common::crd::{ManagedResource, ResourceKey};
use flork_common::Result;
use tracing::{debug, info};

use crate::context::ReconcilerContext;
use crate::phaser::Phaser;

/// Owns the phasers of one resource kind within this process.
///
/// Phasers are created lazily on the first event for a key and leave the
/// registry only through [`ReconcilerRegistry::delete`] or
/// [`ReconcilerRegistry::reset_all`].
pub struct ReconcilerRegistry<R: ManagedResource> {
    ctx: Arc<ReconcilerContext<R>>,
    phasers: DashMap<ResourceKey, Arc<Phaser<R>>>,
}

impl<R: ManagedResource> ReconcilerRegistry<R> {
    /// Empty registry handing `ctx` to every phaser it creates
    pub fn new(ctx: Arc<ReconcilerContext<R>>) -> Self {
        Self {
            ctx,
            phasers: DashMap::new(),
        }
    }

    /// Route a snapshot of `resource` to its phaser, creating one if needed.
    ///
    /// An existing phaser is kept while it is active or when it already
    /// handled this generation; otherwise it is replaced by a fresh one.
    pub fn reconcile(&self, resource: R) {
        let key = resource.key();
        let candidate = Arc::new(Phaser::new(key.clone(), Arc::clone(&self.ctx)));

        let phaser = match self.phasers.entry(key.clone()) {
            Entry::Vacant(entry) => Arc::clone(&entry.insert(candidate)),
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.is_active() || existing.was_generation_observed(&resource) {
                    candidate.cancel();
                    Arc::clone(existing)
                } else {
                    debug!(key = %key, "Replacing stopped phaser");
                    existing.cancel();
                    entry.insert(Arc::clone(&candidate));
                    candidate
                }
            }
        };

        if phaser.start() || phaser.is_active() {
            phaser.push(resource);
        } else {
            debug!(key = %key, generation = resource.generation(), "Phaser stopped, dropping snapshot");
        }
    }

    /// Forget a deleted resource and tear its workload down.
    ///
    /// Runs regardless of leadership: the resource is gone for every process.
    pub async fn delete(&self, resource: &R) -> Result<()> {
        let key = resource.key();
        if let Some((_, phaser)) = self.phasers.remove(&key) {
            phaser.cancel();
        }

        let deleted = self.ctx.capabilities.delete_workload(resource).await?;
        info!(key = %key, deleted, "Resource deleted, workload removed");

        if resource.wants_high_availability_cleanup() {
            self.ctx.capabilities.clean_high_availability(resource).await?;
        }
        Ok(())
    }

    /// Cancel every phaser and forget them all
    pub fn reset_all(&self) {
        for entry in self.phasers.iter() {
            entry.value().cancel();
        }
        self.phasers.clear();
        debug!("Registry reset");
    }

    /// Phaser currently registered for `key`
    pub fn phaser(&self, key: &ResourceKey) -> Option<Arc<Phaser<R>>> {
        self.phasers.get(key).map(|p| Arc::clone(p.value()))
    }

    /// Number of registered phasers
    pub fn len(&self) -> usize {
        self.phasers.len()
    }

    /// Whether no phaser is registered
    pub fn is_empty(&self) -> bool {
        self.phasers.is_empty()
    }
}
