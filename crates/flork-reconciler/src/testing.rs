//! In-memory collaborators for driving phases and phasers in tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flork_common::crd::{
    FlinkJob, FlinkJobSpec, FlorkPhase, FlorkStatus, ManagedResource, ResourceKey,
};
use flork_common::leader_election::{lease_holder, LeaseStore};
use flork_common::{Error, Result};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Resource;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{
    JobInfo, ManagementClient, RunState, RuntimeConfig, WorkloadCapabilities, WorkloadWatcher,
};
use crate::context::{ReconcilerConfig, ReconcilerContext};
use crate::monitor::DeploymentMonitor;
use crate::operations::ResourceOperations;
use crate::registry::ReconcilerRegistry;

pub(crate) const NAMESPACE: &str = "analytics";
pub(crate) const IDENTITY: &str = "pod-0";

/// Job at `generation` without any status
pub(crate) fn job(name: &str, generation: i64) -> FlinkJob {
    let mut job = FlinkJob::new(name, FlinkJobSpec::default());
    job.metadata.namespace = Some(NAMESPACE.to_string());
    job.metadata.generation = Some(generation);
    job
}

/// Job at `generation` whose last transition happened at `transition`
pub(crate) fn job_in_phase(name: &str, generation: i64, phase: FlorkPhase, transition: i64) -> FlinkJob {
    let mut job = job(name, generation);
    job.status = Some(FlorkStatus {
        flork_phase: phase,
        generation_during_last_transition: Some(transition),
        known_savepoint_path: None,
    });
    job
}

pub(crate) fn config() -> ReconcilerConfig {
    ReconcilerConfig::new(IDENTITY, "flork")
}

/// Poll `condition` every 100ms, panicking after a minute of (virtual) time
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Lease store with resourceVersion checks, like the API server
#[derive(Default)]
pub(crate) struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    version: AtomicU64,
}

impl MemoryLeaseStore {
    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store a freshly renewed lease held by `holder`
    pub(crate) fn insert_held(&self, name: &str, holder: &str) {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(self.next_version()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(chrono::Utc::now())),
                ..Default::default()
            }),
        };
        self.leases.lock().insert(name.to_string(), lease);
    }

    pub(crate) fn holder(&self, name: &str) -> Option<String> {
        self.leases
            .lock()
            .get(name)
            .and_then(|l| lease_holder(l).map(str::to_string))
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<Lease>> {
        Ok(self.leases.lock().get(name).cloned())
    }

    async fn create(&self, lease: &Lease) -> Result<bool> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let mut leases = self.leases.lock();
        if leases.contains_key(&name) {
            return Ok(false);
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_version());
        leases.insert(name, stored);
        Ok(true)
    }

    async fn replace(&self, lease: &Lease) -> Result<bool> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let mut leases = self.leases.lock();
        let current = leases.get(&name).and_then(|l| l.metadata.resource_version.clone());
        if current.is_none() || current != lease.metadata.resource_version {
            return Ok(false);
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_version());
        leases.insert(name, stored);
        Ok(true)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.leases.lock().remove(name);
        Ok(())
    }
}

/// Resource storage that records every status write.
///
/// Written snapshots can be echoed back, standing in for the watch
/// delivering the controller's own updates.
pub(crate) struct FakeOperations<R: ManagedResource> {
    stored: Mutex<Option<R>>,
    patches: Mutex<Vec<FlorkStatus>>,
    deletes: AtomicUsize,
    version: AtomicU64,
    echo: Mutex<Option<mpsc::UnboundedSender<R>>>,
}

impl<R: ManagedResource> Default for FakeOperations<R> {
    fn default() -> Self {
        Self {
            stored: Mutex::new(None),
            patches: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
            version: AtomicU64::new(0),
            echo: Mutex::new(None),
        }
    }
}

impl<R: ManagedResource> FakeOperations<R> {
    /// Make `resource` the stored copy, as if a user applied it
    pub(crate) fn seed(&self, resource: R) {
        *self.stored.lock() = Some(resource);
    }

    pub(crate) fn echo_to(&self, tx: mpsc::UnboundedSender<R>) {
        *self.echo.lock() = Some(tx);
    }

    pub(crate) fn stored(&self) -> Option<R> {
        self.stored.lock().clone()
    }

    pub(crate) fn patches(&self) -> Vec<FlorkStatus> {
        self.patches.lock().clone()
    }

    pub(crate) fn phases(&self) -> Vec<FlorkPhase> {
        self.patches.lock().iter().map(|s| s.flork_phase).collect()
    }

    pub(crate) fn stored_phase(&self) -> Option<FlorkPhase> {
        self.stored.lock().as_ref().map(|r| r.phase())
    }

    pub(crate) fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: ManagedResource> ResourceOperations<R> for FakeOperations<R> {
    async fn reload(&self, resource: &R) -> Result<R> {
        Ok(self.stored.lock().clone().unwrap_or_else(|| resource.clone()))
    }

    async fn patch_status(&self, resource: &R) -> Result<R> {
        let mut written = resource.clone();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        written.meta_mut().resource_version = Some(format!("status-{version}"));

        self.patches.lock().push(resource.flork_status());
        *self.stored.lock() = Some(written.clone());
        if let Some(tx) = self.echo.lock().as_ref() {
            let _ = tx.send(written.clone());
        }
        Ok(written)
    }

    async fn delete(&self, _resource: &R) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// State of the runtime's management endpoint
#[derive(Default)]
pub(crate) struct FakeRuntime {
    jobs: Mutex<Vec<JobInfo>>,
    pub(crate) stops: Mutex<Vec<(String, String, bool)>>,
    pub(crate) cancels: Mutex<Vec<String>>,
    pub(crate) disposed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub(crate) fn set_job_state(&self, state: RunState) {
        *self.jobs.lock() = vec![JobInfo {
            id: "a1b2c3".to_string(),
            state,
        }];
    }
}

struct FakeManagement {
    runtime: Arc<FakeRuntime>,
}

#[async_trait]
impl ManagementClient for FakeManagement {
    async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        Ok(self.runtime.jobs.lock().clone())
    }

    async fn stop_with_savepoint(
        &self,
        job_id: &str,
        target_dir: &str,
        advance_to_end_of_event_time: bool,
    ) -> Result<String> {
        self.runtime.stops.lock().push((
            job_id.to_string(),
            target_dir.to_string(),
            advance_to_end_of_event_time,
        ));
        Ok(format!("{target_dir}/savepoint-{job_id}"))
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.runtime.cancels.lock().push(job_id.to_string());
        Ok(())
    }

    async fn dispose_savepoint(&self, path: &str) -> Result<()> {
        self.runtime.disposed.lock().push(path.to_string());
        Ok(())
    }
}

/// Cluster holding workload Deployments, acting as both deployer and watch
#[derive(Default)]
pub(crate) struct FakeCluster {
    monitors: Mutex<HashMap<ResourceKey, Arc<DeploymentMonitor>>>,
    deployments: Mutex<HashSet<ResourceKey>>,
    submit_errors: Mutex<VecDeque<Error>>,
    submits: AtomicUsize,
    deletions: AtomicUsize,
    ha_cleanups: AtomicUsize,
    pub(crate) runtime: Arc<FakeRuntime>,
}

impl FakeCluster {
    /// Make the next submission fail with `error`
    pub(crate) fn fail_next_submit(&self, error: Error) {
        self.submit_errors.lock().push_back(error);
    }

    pub(crate) fn deployment_exists(&self, key: &ResourceKey) -> bool {
        self.deployments.lock().contains(key)
    }

    pub(crate) fn add_deployment(&self, key: &ResourceKey) {
        self.deployments.lock().insert(key.clone());
        if let Some(monitor) = self.monitors.lock().get(key) {
            monitor.on_added();
        }
    }

    /// Workload ended on its own: the Deployment disappears
    pub(crate) fn terminate(&self, key: &ResourceKey) {
        let existed = self.deployments.lock().remove(key);
        if existed {
            if let Some(monitor) = self.monitors.lock().get(key) {
                monitor.on_deleted();
            }
        }
    }

    pub(crate) fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub(crate) fn deletions(&self) -> usize {
        self.deletions.load(Ordering::SeqCst)
    }

    pub(crate) fn ha_cleanups(&self) -> usize {
        self.ha_cleanups.load(Ordering::SeqCst)
    }

    /// Report the Deployment of `key` into `monitor` from now on
    pub(crate) fn attach(&self, key: &ResourceKey, monitor: Arc<DeploymentMonitor>) {
        self.monitors.lock().insert(key.clone(), Arc::clone(&monitor));
        if self.deployments.lock().contains(key) {
            monitor.on_added();
        } else {
            monitor.on_deleted();
        }
    }

    pub(crate) fn monitor(&self, key: &ResourceKey) -> Option<Arc<DeploymentMonitor>> {
        self.monitors.lock().get(key).cloned()
    }
}

#[async_trait]
impl WorkloadCapabilities<FlinkJob> for FakeCluster {
    async fn prepare(&self, job: &FlinkJob, scratch: &Path) -> Result<RuntimeConfig> {
        Ok(RuntimeConfig::from_flink_conf(&job.spec.flink_conf).with_conf_dir(scratch))
    }

    async fn submit(&self, job: &FlinkJob, _config: &RuntimeConfig) -> Result<()> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let scripted = self.submit_errors.lock().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        self.add_deployment(&job.key());
        Ok(())
    }

    async fn connect(
        &self,
        _job: &FlinkJob,
        _config: &RuntimeConfig,
    ) -> Result<Box<dyn ManagementClient>> {
        Ok(Box::new(FakeManagement {
            runtime: Arc::clone(&self.runtime),
        }))
    }

    async fn delete_workload(&self, job: &FlinkJob) -> Result<bool> {
        self.deletions.fetch_add(1, Ordering::SeqCst);
        let key = job.key();
        let existed = self.deployments.lock().remove(&key);
        if existed {
            if let Some(monitor) = self.monitors.lock().get(&key) {
                monitor.on_deleted();
            }
        }
        Ok(existed)
    }

    async fn clean_high_availability(&self, _job: &FlinkJob) -> Result<()> {
        self.ha_cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl WorkloadWatcher for FakeCluster {
    async fn watch(&self, key: ResourceKey, monitor: Arc<DeploymentMonitor>, cancel: CancellationToken) {
        self.attach(&key, monitor);
        cancel.cancelled().await;
    }
}

/// Registry wired to fakes
pub(crate) struct Harness {
    pub(crate) registry: Arc<ReconcilerRegistry<FlinkJob>>,
    pub(crate) cluster: Arc<FakeCluster>,
    pub(crate) operations: Arc<FakeOperations<FlinkJob>>,
    pub(crate) leases: Arc<MemoryLeaseStore>,
}

impl Harness {
    /// Harness whose status writes come back as new snapshots
    pub(crate) fn new() -> Self {
        let harness = Self::without_echo();
        let (tx, mut rx) = mpsc::unbounded_channel();
        harness.operations.echo_to(tx);
        let registry = Arc::clone(&harness.registry);
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                registry.reconcile(snapshot);
            }
        });
        harness
    }

    /// Harness where nothing but the test feeds snapshots
    pub(crate) fn without_echo() -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let operations = Arc::new(FakeOperations::default());
        let leases = Arc::new(MemoryLeaseStore::default());
        let ctx = ReconcilerContext::for_testing(
            config(),
            operations.clone(),
            cluster.clone(),
            cluster.clone(),
            leases.clone(),
        );
        Self {
            registry: Arc::new(ReconcilerRegistry::new(Arc::new(ctx))),
            cluster,
            operations,
            leases,
        }
    }

    /// Store `job` and deliver it to the registry, like an apply plus watch event
    pub(crate) fn apply(&self, job: FlinkJob) {
        self.operations.seed(job.clone());
        self.registry.reconcile(job);
    }
}
