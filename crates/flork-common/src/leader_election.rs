//! Per-resource leader election using Kubernetes Leases
//!
//! Every managed resource has its own Lease, so different controller
//! replicas can lead different resources. The elector runs for as long as
//! its cancellation token is alive and reports transitions through
//! [`LeaderCallbacks`]; losing leadership puts it back into candidacy.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and the
//! attempt counts as not leading.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Default lease duration
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Storage of Lease records.
///
/// `create` and `replace` return `Ok(false)` when the write lost a
/// compare-and-swap race.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Fetch a lease, `None` when absent
    async fn get(&self, name: &str) -> Result<Option<Lease>>;

    /// Create a lease
    async fn create(&self, lease: &Lease) -> Result<bool>;

    /// Replace a lease, guarded by its resourceVersion
    async fn replace(&self, lease: &Lease) -> Result<bool>;

    /// Delete a lease, absent leases are not an error
    async fn delete(&self, name: &str) -> Result<()>;
}

/// [`LeaseStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeLeaseStore {
    api: Api<Lease>,
}

impl KubeLeaseStore {
    /// Store for leases in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<Lease>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<bool> {
        match self.api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<bool> {
        let name = lease.metadata.name.as_deref().unwrap_or_default();
        match self.api.replace(name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Holder identity recorded in a lease
pub fn lease_holder(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
}

/// Whether `identity` currently holds the lease called `name`
pub async fn holds_lease(store: &dyn LeaseStore, name: &str, identity: &str) -> Result<bool> {
    Ok(store
        .get(name)
        .await?
        .is_some_and(|lease| lease_holder(&lease) == Some(identity)))
}

/// Leadership transitions reported by [`LeaderElector::run`]
pub trait LeaderCallbacks: Send + Sync {
    /// This process acquired the lease
    fn on_started_leading(&self);

    /// This process lost the lease, or the elector stopped while leading
    fn on_stopped_leading(&self);

    /// The observed lease holder changed (may be this process)
    fn on_new_leader(&self, identity: &str);
}

/// Timing of the election loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Pause between acquire/renew attempts
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Renew deadline is 2/3 of the lease duration, retry period 1/4 of that
    pub fn from_lease_duration(lease_duration: Duration) -> Self {
        let renew_deadline = lease_duration * 2 / 3;
        Self {
            lease_duration,
            renew_deadline,
            retry_period: renew_deadline / 4,
        }
    }
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self::from_lease_duration(DEFAULT_LEASE_DURATION)
    }
}

/// Result of one acquire/renew attempt
#[derive(Debug, PartialEq, Eq)]
struct Attempt {
    leading: bool,
    holder: Option<String>,
}

/// Leader elector for a single lease
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    lease_name: String,
    identity: String,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    /// Create an elector for `lease_name` competing as `identity`
    pub fn new(
        store: Arc<dyn LeaseStore>,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
        config: LeaderElectionConfig,
    ) -> Self {
        Self {
            store,
            lease_name: lease_name.into(),
            identity: identity.into(),
            config,
        }
    }

    /// Lease this elector competes for
    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    /// Take part in the election until `cancel` fires.
    ///
    /// Transient API errors never end the loop. A leader that cannot renew
    /// within the renew deadline steps down and keeps competing.
    pub async fn run(&self, callbacks: &dyn LeaderCallbacks, cancel: CancellationToken) {
        let mut leading = false;
        let mut observed_holder: Option<String> = None;
        let mut last_renew = Instant::now();

        debug!(lease = %self.lease_name, identity = %self.identity, "Entering leader election");

        loop {
            match self.try_acquire_or_renew().await {
                Ok(attempt) => {
                    if leading && !attempt.leading {
                        warn!(lease = %self.lease_name, identity = %self.identity, "Leadership lost");
                        leading = false;
                        callbacks.on_stopped_leading();
                    }
                    if attempt.holder.is_some() && attempt.holder != observed_holder {
                        observed_holder = attempt.holder.clone();
                        if let Some(holder) = &observed_holder {
                            debug!(lease = %self.lease_name, holder = %holder, "New leader observed");
                            callbacks.on_new_leader(holder);
                        }
                    }
                    if attempt.leading {
                        last_renew = Instant::now();
                        if !leading {
                            info!(lease = %self.lease_name, identity = %self.identity, "Leadership acquired");
                            leading = true;
                            callbacks.on_started_leading();
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        lease = %self.lease_name,
                        identity = %self.identity,
                        error = %e,
                        "Failed to acquire or renew lease"
                    );
                    if leading && last_renew.elapsed() >= self.config.renew_deadline {
                        warn!(lease = %self.lease_name, "Renew deadline exceeded, stepping down");
                        leading = false;
                        callbacks.on_stopped_leading();
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        if leading {
            callbacks.on_stopped_leading();
        }
        debug!(lease = %self.lease_name, identity = %self.identity, "Left leader election");
    }

    /// Try to acquire or renew the lease atomically
    async fn try_acquire_or_renew(&self) -> Result<Attempt> {
        let now = Utc::now();

        let Some(lease) = self.store.get(&self.lease_name).await? else {
            let created = self.store.create(&self.new_lease(None, now, 0)).await?;
            if created {
                info!(lease = %self.lease_name, identity = %self.identity, "Created new lease");
            }
            return Ok(self.attempt(created, None));
        };

        let spec = lease.spec.as_ref();
        let holder = lease_holder(&lease).map(str::to_string);

        if holder.as_deref() == Some(self.identity.as_str()) {
            let mut renewed = lease.clone();
            if let Some(spec) = renewed.spec.as_mut() {
                spec.renew_time = Some(MicroTime(now));
            }
            let ok = self.store.replace(&renewed).await?;
            if !ok {
                debug!(lease = %self.lease_name, "Lease renewal conflict");
            }
            return Ok(self.attempt(ok, None));
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let expired = match (renew_time, duration_secs) {
            (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
            _ => true,
        };

        if !expired {
            return Ok(Attempt {
                leading: false,
                holder,
            });
        }

        let resource_version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| Error::lease(&self.lease_name, "lease missing resourceVersion"))?;
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1;
        let took_over = self
            .store
            .replace(&self.new_lease(Some(resource_version), now, transitions))
            .await?;
        if took_over {
            info!(
                lease = %self.lease_name,
                identity = %self.identity,
                transitions,
                "Took over expired lease"
            );
        }
        Ok(self.attempt(took_over, holder))
    }

    fn attempt(&self, won: bool, previous_holder: Option<String>) -> Attempt {
        Attempt {
            leading: won,
            holder: if won {
                Some(self.identity.clone())
            } else {
                previous_holder
            },
        }
    }

    fn new_lease(
        &self,
        resource_version: Option<String>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

/// Delete a lease one full lease duration after its elector stopped.
///
/// Does nothing unless `identity` holds the lease, both before and after the
/// wait, so a successor that took over in the meantime keeps its lease.
/// Meant to be spawned detached from any cancellation scope.
pub async fn release_lease_after(
    store: Arc<dyn LeaseStore>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
) {
    match holds_lease(store.as_ref(), &lease_name, &identity).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(lease = %lease_name, "Not the lease holder, nothing to release");
            return;
        }
        Err(e) => {
            warn!(lease = %lease_name, error = %e, "Could not read lease before release");
            return;
        }
    }

    tokio::time::sleep(lease_duration).await;

    match holds_lease(store.as_ref(), &lease_name, &identity).await {
        Ok(true) => match store.delete(&lease_name).await {
            Ok(()) => info!(lease = %lease_name, "Lease released"),
            Err(e) => warn!(lease = %lease_name, error = %e, "Failed to delete lease"),
        },
        Ok(false) => debug!(lease = %lease_name, "Lease changed hands, leaving it"),
        Err(e) => warn!(lease = %lease_name, error = %e, "Could not read lease before release"),
    }
}
