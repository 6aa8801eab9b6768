//! Teardown of a resource's workload

use std::sync::Arc;

use flork_common::crd::{FlorkPhase, ManagedResource, ResourceKey};
use flork_common::Result;
use tracing::{info, warn};

use crate::context::ReconcilerContext;

/// Stops a running workload, keeping a savepoint when one can be taken
pub struct ShutdownPhase<R: ManagedResource> {
    key: ResourceKey,
    ctx: Arc<ReconcilerContext<R>>,
}

impl<R: ManagedResource> ShutdownPhase<R> {
    pub fn new(ctx: Arc<ReconcilerContext<R>>, resource: &R) -> Self {
        Self {
            key: resource.key(),
            ctx,
        }
    }

    /// Take a savepoint if the workload runs, then delete it.
    ///
    /// Savepoints are best effort: any failure other than cancellation is
    /// logged and the workload is deleted anyway. Returns the savepoint
    /// path when one was taken.
    pub async fn shut_down_cleanly(&self, resource: &R) -> Result<Option<String>> {
        let savepoint = if resource.phase() == FlorkPhase::Deployed {
            match self.take_savepoint(resource).await {
                Ok(path) => path,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Could not take savepoint, shutting down without one");
                    None
                }
            }
        } else {
            None
        };

        let deleted = self.ctx.capabilities.delete_workload(resource).await?;
        info!(key = %self.key, deleted, savepoint = ?savepoint, "Workload shut down");
        Ok(savepoint)
    }

    async fn take_savepoint(&self, resource: &R) -> Result<Option<String>> {
        let scratch = super::scratch_dir(&self.key)?;
        let config = self
            .ctx
            .capabilities
            .prepare(resource, scratch.path())
            .await?;
        let client = self.ctx.capabilities.connect(resource, &config).await?;

        let jobs = client.list_jobs().await?;
        let Some(job) = jobs.first() else {
            warn!(key = %self.key, "No job found, skipping savepoint");
            return Ok(None);
        };

        match config.savepoint_dir() {
            Some(dir) => {
                let path = client
                    .stop_with_savepoint(&job.id, dir, resource.advance_to_end_of_event_time())
                    .await?;
                info!(key = %self.key, job = %job.id, savepoint = %path, "Job stopped with savepoint");
                Ok(Some(path))
            }
            None => {
                info!(key = %self.key, job = %job.id, "No savepoint directory configured, cancelling job");
                client.cancel(&job.id).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::capabilities::{
        ManagementClient, MockManagementClient, RunState, RuntimeConfig, WorkloadCapabilities,
    };
    use crate::testing::{config, job_in_phase, FakeCluster, FakeOperations, MemoryLeaseStore};
    use async_trait::async_trait;
    use flork_common::crd::{FlinkJob, SavepointPolicy};
    use flork_common::Error;

    fn context(capabilities: Arc<dyn WorkloadCapabilities<FlinkJob>>) -> Arc<ReconcilerContext<FlinkJob>> {
        Arc::new(ReconcilerContext::for_testing(
            config(),
            Arc::new(FakeOperations::default()),
            capabilities,
            Arc::new(FakeCluster::default()),
            Arc::new(MemoryLeaseStore::default()),
        ))
    }

    fn deployed(savepoint_dir: Option<&str>) -> FlinkJob {
        let mut job = job_in_phase("wordcount", 1, FlorkPhase::Deployed, 1);
        if let Some(dir) = savepoint_dir {
            job.spec
                .flink_conf
                .insert("state.savepoints.dir".to_string(), serde_json::json!(dir));
        }
        job
    }

    fn running_cluster(job: &FlinkJob) -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_deployment(&job.key());
        cluster.runtime.set_job_state(RunState::Running);
        cluster
    }

    #[tokio::test]
    async fn stops_with_savepoint_into_configured_dir() {
        let mut job = deployed(Some("s3://sp"));
        job.spec.policies = Some(flork_common::crd::FlorkPolicies {
            deletion: None,
            savepoint: Some(SavepointPolicy {
                advance_to_end_of_event_time: true,
            }),
        });
        let cluster = running_cluster(&job);
        let phase = ShutdownPhase::new(context(cluster.clone()), &job);

        let savepoint = phase.shut_down_cleanly(&job).await.unwrap();

        assert_eq!(savepoint.as_deref(), Some("s3://sp/savepoint-a1b2c3"));
        assert_eq!(
            *cluster.runtime.stops.lock(),
            vec![("a1b2c3".to_string(), "s3://sp".to_string(), true)]
        );
        assert!(!cluster.deployment_exists(&job.key()));
    }

    #[tokio::test]
    async fn cancels_without_savepoint_dir() {
        let job = deployed(None);
        let cluster = running_cluster(&job);
        let phase = ShutdownPhase::new(context(cluster.clone()), &job);

        let savepoint = phase.shut_down_cleanly(&job).await.unwrap();

        assert_eq!(savepoint, None);
        assert_eq!(*cluster.runtime.cancels.lock(), vec!["a1b2c3".to_string()]);
        assert!(cluster.runtime.stops.lock().is_empty());
        assert_eq!(cluster.deletions(), 1);
    }

    #[tokio::test]
    async fn missing_job_skips_savepoint() {
        let job = deployed(Some("s3://sp"));
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_deployment(&job.key());
        let phase = ShutdownPhase::new(context(cluster.clone()), &job);

        assert_eq!(phase.shut_down_cleanly(&job).await.unwrap(), None);
        assert!(cluster.runtime.stops.lock().is_empty());
        assert_eq!(cluster.deletions(), 1);
    }

    #[tokio::test]
    async fn only_deployed_workloads_get_a_savepoint() {
        let job = job_in_phase("wordcount", 2, FlorkPhase::Deploying, 2);
        let cluster = running_cluster(&job);
        let phase = ShutdownPhase::new(context(cluster.clone()), &job);

        assert_eq!(phase.shut_down_cleanly(&job).await.unwrap(), None);
        assert!(cluster.runtime.stops.lock().is_empty());
        assert!(cluster.runtime.cancels.lock().is_empty());
        assert_eq!(cluster.deletions(), 1);
    }

    /// Cluster whose management endpoint answers with a fixed error
    struct Unreachable {
        cluster: FakeCluster,
        error: fn() -> Error,
    }

    #[async_trait]
    impl WorkloadCapabilities<FlinkJob> for Unreachable {
        async fn prepare(&self, job: &FlinkJob, scratch: &Path) -> Result<RuntimeConfig> {
            self.cluster.prepare(job, scratch).await
        }

        async fn submit(&self, job: &FlinkJob, config: &RuntimeConfig) -> Result<()> {
            self.cluster.submit(job, config).await
        }

        async fn connect(&self, _job: &FlinkJob, _config: &RuntimeConfig) -> Result<Box<dyn ManagementClient>> {
            let error = self.error;
            let mut client = MockManagementClient::new();
            client.expect_list_jobs().returning(move || Err(error()));
            Ok(Box::new(client))
        }

        async fn delete_workload(&self, job: &FlinkJob) -> Result<bool> {
            self.cluster.delete_workload(job).await
        }

        async fn clean_high_availability(&self, job: &FlinkJob) -> Result<()> {
            self.cluster.clean_high_availability(job).await
        }
    }

    #[tokio::test]
    async fn savepoint_failure_does_not_block_deletion() {
        let job = deployed(Some("s3://sp"));
        let unreachable = Arc::new(Unreachable {
            cluster: FakeCluster::default(),
            error: || Error::runtime("analytics/wordcount", "connection refused"),
        });
        let phase = ShutdownPhase::new(context(unreachable.clone()), &job);

        assert_eq!(phase.shut_down_cleanly(&job).await.unwrap(), None);
        assert_eq!(unreachable.cluster.deletions(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_shutdown() {
        let job = deployed(Some("s3://sp"));
        let unreachable = Arc::new(Unreachable {
            cluster: FakeCluster::default(),
            error: || Error::cancelled("list_jobs"),
        });
        let phase = ShutdownPhase::new(context(unreachable.clone()), &job);

        assert!(phase.shut_down_cleanly(&job).await.unwrap_err().is_cancelled());
        assert_eq!(unreachable.cluster.deletions(), 0);
    }
}
