//! Watch wiring between the Kubernetes API and the reconciliation engine
//!
//! With the CRD backend each resource kind gets a reflector-backed cache and
//! its own [`ReconcilerRegistry`]. With the ConfigMap backend `FlinkJob`
//! definitions arrive in labelled carrier ConfigMaps and their status lives
//! in status records; changes to either re-reconcile the carried resource.

use std::sync::Arc;

use dashmap::DashMap;
use flork_common::crd::{FlinkJob, FlinkSession, ManagedResource, ResourceKey};
use flork_common::kube_utils::create_client;
use flork_common::leader_election::{KubeLeaseStore, LeaseStore};
use flork_common::{Result, FIELD_MANAGER, FLINK_JOB_CM_LABEL, FLINK_JOB_STATUS_CM_LABEL};
use flork_reconciler::capabilities::{JobCapabilities, SessionCapabilities, WorkloadCapabilities};
use flork_reconciler::operations::{
    carrier_name, resource_from_records, ConfigMapResourceOperations, CrdResourceOperations,
    ResourceCache, ResourceOperations,
};
use flork_reconciler::{ReconcilerConfig, ReconcilerContext, ReconcilerRegistry};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, CustomResourceExt, ResourceExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{Backend, Cli};

/// Run the controller until ctrl-c
pub async fn run_controller(cli: &Cli) -> Result<()> {
    let client = create_client(None).await?;
    let config = cli.reconciler_config();
    let leases: Arc<dyn LeaseStore> =
        Arc::new(KubeLeaseStore::new(client.clone(), &config.lease_namespace));
    let namespace = cli.watched_namespace().map(str::to_string);
    let shutdown = CancellationToken::new();

    info!(
        identity = %config.identity,
        backend = ?cli.backend,
        watch_namespace = namespace.as_deref().unwrap_or("*"),
        "Starting flork controller"
    );

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    match cli.backend {
        Backend::Crd => {
            ensure_crds_installed(&client).await?;
            tasks.push(tokio::spawn(run_crd_kind::<FlinkJob>(
                client.clone(),
                config.clone(),
                Arc::new(JobCapabilities::new(client.clone())),
                Arc::clone(&leases),
                namespace.clone(),
                shutdown.clone(),
            )));
            tasks.push(tokio::spawn(run_crd_kind::<FlinkSession>(
                client.clone(),
                config,
                Arc::new(SessionCapabilities::new(client.clone())),
                leases,
                namespace,
                shutdown.clone(),
            )));
        }
        Backend::ConfigMap => {
            tasks.push(tokio::spawn(run_config_map_jobs(
                client,
                config,
                leases,
                namespace,
                shutdown.clone(),
            )));
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not listen for shutdown signal");
    }
    info!("Shutdown signal received, stopping controllers");
    shutdown.cancel();

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "Controller task ended abnormally");
        }
    }
    Ok(())
}

/// Install both CRDs with server-side apply so their schema always matches
/// this binary
async fn ensure_crds_installed(client: &Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [FlinkJob::crd(), FlinkSession::crd()] {
        let name = crd.name_any();
        info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }

    info!("All flork CRDs installed/updated");
    Ok(())
}

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Reconcile resources of kind `R` stored as custom resources
async fn run_crd_kind<R: ManagedResource>(
    client: Client,
    config: ReconcilerConfig,
    capabilities: Arc<dyn WorkloadCapabilities<R>>,
    leases: Arc<dyn LeaseStore>,
    namespace: Option<String>,
    shutdown: CancellationToken,
) {
    let kind = R::kind_name();
    let (reader, writer) = reflector::store();
    let cache = ResourceCache::new();
    cache.publish(reader);

    let operations: Arc<dyn ResourceOperations<R>> =
        Arc::new(CrdResourceOperations::new(client.clone(), cache));
    let ctx = ReconcilerContext::builder(client.clone(), config, operations, capabilities)
        .lease_store(leases)
        .build();
    let registry = Arc::new(ReconcilerRegistry::new(Arc::new(ctx)));

    let api: Api<R> = scoped_api(client, namespace.as_deref());
    let mut events = std::pin::pin!(watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer));

    info!(kind = %kind, "Watching resources");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(event)) => dispatch(&registry, event),
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                None => {
                    error!(kind = %kind, "Watch stream ended");
                    break;
                }
            },
        }
    }

    registry.reset_all();
    info!(kind = %kind, "Controller stopped");
}

/// Route one watch event into `registry`
fn dispatch<R: ManagedResource>(registry: &Arc<ReconcilerRegistry<R>>, event: Event<R>) {
    match event {
        Event::Apply(resource) | Event::InitApply(resource) => registry.reconcile(resource),
        Event::Delete(resource) => {
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                if let Err(e) = registry.delete(&resource).await {
                    warn!(key = %resource.key(), error = %e, "Cleanup of deleted resource failed");
                }
            });
        }
        Event::Init => trace!("Watch (re)listing started"),
        Event::InitDone => debug!("Watch listing done"),
    }
}

/// Handles carrier and status record events of ConfigMap-backed jobs
struct CarrierHandler {
    registry: ReconcilerRegistry<FlinkJob>,
    operations: Arc<ConfigMapResourceOperations<FlinkJob>>,
    carriers: Store<ConfigMap>,
    /// Serializes the processing of one carrier
    locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
}

fn carrier_key(carrier: &ConfigMap) -> ResourceKey {
    ResourceKey::new(carrier.namespace().unwrap_or_default(), carrier.name_any())
}

impl CarrierHandler {
    fn lock(&self, key: &ResourceKey) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(key.clone()).or_default())
    }

    async fn applied(&self, carrier: ConfigMap) {
        let key = carrier_key(&carrier);
        let lock = self.lock(&key);
        let _guard = lock.lock().await;

        if let Err(e) = self.process(&carrier).await {
            warn!(key = %key, error = %e, "Could not process carried resource");
            if let Err(e) = self.operations.record_exception(&key, &e.to_string()).await {
                warn!(key = %key, error = %e, "Could not record processing error");
            }
        }
    }

    async fn process(&self, carrier: &ConfigMap) -> Result<()> {
        self.operations
            .ensure_status_record(carrier, FLINK_JOB_STATUS_CM_LABEL)
            .await?;
        let job = self.operations.load(carrier).await?;
        self.registry.reconcile(job.clone());
        self.operations.sync_metadata(&job).await
    }

    async fn deleted(&self, carrier: ConfigMap) {
        let key = carrier_key(&carrier);
        let lock = self.lock(&key);
        let guard = lock.lock().await;

        match resource_from_records::<FlinkJob>(&carrier, None) {
            Ok(job) => {
                if let Err(e) = self.registry.delete(&job).await {
                    warn!(key = %key, error = %e, "Cleanup of deleted resource failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Deleted carrier held no valid resource"),
        }
        if let Err(e) = self.operations.delete_status_record(&key).await {
            warn!(key = %key, error = %e, "Could not delete status record");
        }

        drop(guard);
        self.locks.remove(&key);
    }

    /// A status record changed; re-reconcile the resource it belongs to
    async fn record_changed(&self, record: ConfigMap) {
        let record_name = record.name_any();
        let Some(name) = carrier_name(&record_name) else {
            trace!(record = %record_name, "Ignoring record without carrier name");
            return;
        };
        let namespace = record.namespace().unwrap_or_default();
        match self.carriers.get(&ObjectRef::new(name).within(&namespace)) {
            Some(carrier) => self.applied((*carrier).clone()).await,
            None => trace!(record = %record_name, "No carrier for status record"),
        }
    }
}

/// Reconcile `FlinkJob`s carried by labelled ConfigMaps
async fn run_config_map_jobs(
    client: Client,
    config: ReconcilerConfig,
    leases: Arc<dyn LeaseStore>,
    namespace: Option<String>,
    shutdown: CancellationToken,
) {
    let operations = Arc::new(ConfigMapResourceOperations::<FlinkJob>::new(
        client.clone(),
        Arc::clone(&leases),
        config.identity.clone(),
    ));
    let capabilities: Arc<dyn WorkloadCapabilities<FlinkJob>> =
        Arc::new(JobCapabilities::new(client.clone()));
    let ctx = ReconcilerContext::builder(
        client.clone(),
        config,
        Arc::clone(&operations) as Arc<dyn ResourceOperations<FlinkJob>>,
        capabilities,
    )
    .lease_store(leases)
    .build();

    let (carriers, writer) = reflector::store();
    let handler = Arc::new(CarrierHandler {
        registry: ReconcilerRegistry::new(Arc::new(ctx)),
        operations,
        carriers,
        locks: DashMap::new(),
    });

    let api: Api<ConfigMap> = scoped_api(client, namespace.as_deref());
    let mut carrier_events = std::pin::pin!(watcher(
        api.clone(),
        watcher::Config::default().labels(FLINK_JOB_CM_LABEL)
    )
    .default_backoff()
    .reflect(writer));
    let mut record_events = std::pin::pin!(watcher(
        api,
        watcher::Config::default().labels(FLINK_JOB_STATUS_CM_LABEL)
    )
    .default_backoff());

    info!("Watching FlinkJob carrier config maps");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = carrier_events.next() => match event {
                Some(Ok(Event::Apply(carrier) | Event::InitApply(carrier))) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { handler.applied(carrier).await });
                }
                Some(Ok(Event::Delete(carrier))) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { handler.deleted(carrier).await });
                }
                Some(Ok(Event::Init | Event::InitDone)) => {}
                Some(Err(e)) => warn!(error = %e, "Carrier watch error"),
                None => {
                    error!("Carrier watch stream ended");
                    break;
                }
            },
            event = record_events.next() => match event {
                Some(Ok(Event::Apply(record) | Event::InitApply(record))) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { handler.record_changed(record).await });
                }
                Some(Ok(Event::Delete(record))) => trace!(record = %record.name_any(), "Status record deleted"),
                Some(Ok(Event::Init | Event::InitDone)) => {}
                Some(Err(e)) => warn!(error = %e, "Status record watch error"),
                None => {
                    error!("Status record watch stream ended");
                    break;
                }
            },
        }
    }

    handler.registry.reset_all();
    info!("ConfigMap controller stopped");
}
