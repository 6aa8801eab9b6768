//! Feeding Deployment observations into a [`DeploymentMonitor`]

use std::sync::Arc;

use async_trait::async_trait;
use flork_common::crd::ResourceKey;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::monitor::DeploymentMonitor;

/// Source of add/delete observations for a resource's workload Deployment
#[async_trait]
pub trait WorkloadWatcher: Send + Sync {
    /// Report observations of the Deployment for `key` into `monitor`
    /// until `cancel` fires
    async fn watch(&self, key: ResourceKey, monitor: Arc<DeploymentMonitor>, cancel: CancellationToken);
}

/// [`WorkloadWatcher`] backed by a kube-rs watcher on a single Deployment
#[derive(Clone)]
pub struct KubeWorkloadWatcher {
    client: Client,
}

impl KubeWorkloadWatcher {
    /// Watcher using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Tracks whether the Deployment showed up during a (re)listing
#[derive(Default)]
struct ListingState {
    seen: bool,
}

/// Translate one watch event into monitor updates.
///
/// A listing that completes without the Deployment counts as a deletion,
/// since the delete event may have happened while the watch was down.
fn observe(monitor: &DeploymentMonitor, listing: &mut ListingState, event: Event<Deployment>) {
    match event {
        Event::Apply(_) => monitor.on_added(),
        Event::Delete(_) => monitor.on_deleted(),
        Event::Init => listing.seen = false,
        Event::InitApply(_) => {
            listing.seen = true;
            monitor.on_added();
        }
        Event::InitDone => {
            if !listing.seen {
                monitor.on_deleted();
            }
        }
    }
}

#[async_trait]
impl WorkloadWatcher for KubeWorkloadWatcher {
    async fn watch(&self, key: ResourceKey, monitor: Arc<DeploymentMonitor>, cancel: CancellationToken) {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", key.name));
        let stream = watcher(api, config).default_backoff();
        tokio::pin!(stream);

        let mut listing = ListingState::default();
        debug!(key = %key, "Watching workload deployment");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => observe(&monitor, &mut listing, event),
                    Some(Err(e)) => warn!(key = %key, error = %e, "Workload watch error"),
                    None => break,
                },
            }
        }

        debug!(key = %key, "Stopped watching workload deployment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Deployment {
        Deployment::default()
    }

    #[test]
    fn initial_listing_with_deployment_marks_it_present() {
        let monitor = DeploymentMonitor::new(ResourceKey::new("ns", "job"));
        let mut listing = ListingState::default();

        observe(&monitor, &mut listing, Event::Init);
        observe(&monitor, &mut listing, Event::InitApply(deployment()));
        observe(&monitor, &mut listing, Event::InitDone);

        assert!(monitor.exists());
    }

    #[test]
    fn relisting_without_deployment_counts_as_deletion() {
        let monitor = DeploymentMonitor::new(ResourceKey::new("ns", "job"));
        let mut listing = ListingState::default();
        observe(&monitor, &mut listing, Event::Apply(deployment()));
        let signal = monitor.deletion_signal();

        observe(&monitor, &mut listing, Event::Init);
        observe(&monitor, &mut listing, Event::InitDone);

        assert!(!monitor.exists());
        assert!(signal.has_fired());
    }

    #[test]
    fn delete_event_fires_signal() {
        let monitor = DeploymentMonitor::new(ResourceKey::new("ns", "job"));
        let mut listing = ListingState::default();
        observe(&monitor, &mut listing, Event::Apply(deployment()));
        let signal = monitor.deletion_signal();

        observe(&monitor, &mut listing, Event::Delete(deployment()));

        assert!(signal.has_fired());
    }
}
