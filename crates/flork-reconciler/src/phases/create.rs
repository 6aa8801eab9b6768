//! Initial deployment of a resource's workload

use std::sync::Arc;
use std::time::Duration;

use flork_common::crd::{FlorkPhase, ManagedResource, ResourceKey};
use flork_common::retry::Backoff;
use flork_common::{DeployError, Error, Result};
use tracing::{debug, error, info, warn};

use crate::capabilities::{RuntimeConfig, REST_SSL_KEYSTORE_KEY};
use crate::context::ReconcilerContext;
use crate::monitor::DeploymentMonitor;

/// Pause between run-state checks, and after a failed check
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// First wait after a deployment collided with leftovers
const COLLISION_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Longest wait after a deployment collided with leftovers
const COLLISION_BACKOFF_MAX: Duration = Duration::from_secs(15);

/// Submits a resource's workload and follows it until it runs.
///
/// Every status write of one phase instance records the generation the
/// phase was created for, so a redeploy racing a spec change is detected
/// on the next reconciliation.
pub struct CreatePhase<R: ManagedResource> {
    key: ResourceKey,
    generation: i64,
    ctx: Arc<ReconcilerContext<R>>,
    monitor: Arc<DeploymentMonitor>,
}

impl<R: ManagedResource> CreatePhase<R> {
    /// Phase deploying `resource` at its current generation
    pub fn new(ctx: Arc<ReconcilerContext<R>>, monitor: Arc<DeploymentMonitor>, resource: &R) -> Self {
        Self {
            key: resource.key(),
            generation: resource.generation(),
            ctx,
            monitor,
        }
    }

    /// Submit the workload and persist `DEPLOYING`.
    ///
    /// Returns the persisted snapshot together with the configuration the
    /// workload was deployed with. Genuine failures are persisted as
    /// `FAILED` before they are returned.
    pub async fn perform_initial_deployment(&self, resource: &R) -> Result<(R, RuntimeConfig)> {
        let config = match self.deploy(resource).await {
            Ok(config) => config,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return Err(self.fail(resource, e).await),
        };

        let mut latest = self.ctx.operations.reload(resource).await?;
        self.transition(&mut latest, FlorkPhase::Deploying);
        let persisted = self.ctx.operations.patch_status(&latest).await?;
        info!(key = %self.key, generation = self.generation, "Workload submitted");
        Ok((persisted, config))
    }

    async fn deploy(&self, resource: &R) -> Result<RuntimeConfig> {
        let scratch = super::scratch_dir(&self.key)?;
        let mut config = self
            .ctx
            .capabilities
            .prepare(resource, scratch.path())
            .await?;
        if let Some(path) = resource.flork_status().known_savepoint_path {
            info!(key = %self.key, savepoint = %path, "Restoring from savepoint");
            config.set_savepoint_path(path);
        }

        let mut backoff = Backoff::new(COLLISION_BACKOFF_INITIAL, COLLISION_BACKOFF_MAX);
        loop {
            let deletion = self.monitor.deletion_signal();
            match self.ctx.capabilities.submit(resource, &config).await {
                Ok(()) => return Ok(config),
                Err(Error::Deploy { source, .. }) if source.is_already_exists() => {
                    let delay = backoff.next_delay();
                    warn!(
                        key = %self.key,
                        error = %source,
                        delay_ms = delay.as_millis() as u64,
                        "Leftovers of a previous deployment still present, waiting for their deletion"
                    );
                    deletion.wait_timeout(delay).await;
                }
                Err(Error::Deploy { source, .. }) if self.is_false_negative(&source, &config) => {
                    info!(
                        key = %self.key,
                        error = %source,
                        "Deployment reported a missing REST keystore, expecting it to be injected at runtime"
                    );
                    return Ok(config);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A failure reported although the workload was created: TLS is on for
    /// the REST endpoint and only the keystore setting is missing.
    fn is_false_negative(&self, error: &DeployError, config: &RuntimeConfig) -> bool {
        self.monitor.exists()
            && config.rest_tls_enabled()
            && matches!(
                error.root_cause(),
                DeployError::IllegalConfiguration(message) if message.contains(REST_SSL_KEYSTORE_KEY)
            )
    }

    /// Persist `FAILED` and hand back the error that caused it
    async fn fail(&self, resource: &R, cause: Error) -> Error {
        error!(key = %self.key, generation = self.generation, error = %cause, "Deployment failed");
        let mut failed = match self.ctx.operations.reload(resource).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Could not reload before marking failed");
                resource.clone()
            }
        };
        self.transition(&mut failed, FlorkPhase::Failed);
        if let Err(e) = self.ctx.operations.patch_status(&failed).await {
            error!(key = %self.key, error = %e, "Could not persist failed phase");
        }
        cause
    }

    fn transition(&self, resource: &mut R, phase: FlorkPhase) {
        let status = resource.flork_status_mut();
        status.flork_phase = phase;
        status.generation_during_last_transition = Some(self.generation);
    }

    /// Wait for the workload to report running, then persist `DEPLOYED`.
    ///
    /// The savepoint the workload was restored from is disposed of once it
    /// runs, on a best-effort basis. Only cancellation ends the wait early.
    pub async fn await_running(&self, resource: R, config: RuntimeConfig) -> Result<()> {
        loop {
            match self.check_running(&resource, &config).await {
                Ok(true) => break,
                Ok(false) => debug!(key = %self.key, "Workload not running yet"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(key = %self.key, error = %e, "Could not check workload state"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let mut latest = self.ctx.operations.reload(&resource).await?;
        if let Some(path) = latest.flork_status().known_savepoint_path {
            match self.dispose_savepoint(&latest, &config, &path).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(key = %self.key, savepoint = %path, error = %e, "Could not dispose savepoint"),
            }
        }
        latest.flork_status_mut().known_savepoint_path = None;
        self.transition(&mut latest, FlorkPhase::Deployed);
        self.ctx.operations.patch_status(&latest).await?;
        info!(key = %self.key, generation = self.generation, "Workload running");
        Ok(())
    }

    async fn check_running(&self, resource: &R, config: &RuntimeConfig) -> Result<bool> {
        let client = self.ctx.capabilities.connect(resource, config).await?;
        let jobs = client.list_jobs().await?;
        Ok(jobs.first().is_some_and(|job| job.state.is_up()))
    }

    async fn dispose_savepoint(&self, resource: &R, config: &RuntimeConfig, path: &str) -> Result<()> {
        let client = self.ctx.capabilities.connect(resource, config).await?;
        client.dispose_savepoint(path).await?;
        info!(key = %self.key, savepoint = %path, "Disposed savepoint the workload was restored from");
        Ok(())
    }
}
