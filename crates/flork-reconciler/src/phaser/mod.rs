//! Per-resource state machine
//!
//! A [`Phaser`] owns everything this process does for one resource key: a
//! leader elector on the resource's lease, a watch on the workload
//! Deployment, the single-slot snapshot queue and the background tasks that
//! follow a deployment. Snapshots are consumed by exactly one loop; only the
//! leader acts on them, every other process just tracks the generation it
//! has seen.
//!
//! Task tree:
//!
//! ```text
//! root token (Phaser::cancel)
//!  ├── workload watch
//!  ├── leader elector
//!  └── leadership token (replaced whenever leadership is lost)
//!       ├── dispatch of the current snapshot
//!       ├── become-deployed
//!       └── await-completion
//! ```
//!
//! The lease release that follows a stopped phaser runs detached from this
//! tree so that it cannot be cancelled.

mod queue;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use flork_common::crd::{FlorkPhase, ManagedResource, ResourceKey};
use flork_common::leader_election::{release_lease_after, LeaderCallbacks, LeaderElector};
use flork_common::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::RuntimeConfig;
use crate::context::ReconcilerContext;
use crate::monitor::{DeletionSignal, DeploymentMonitor};
use crate::phases::{CreatePhase, ShutdownPhase};

pub use queue::{snapshot_queue, SnapshotQueue, SnapshotReceiver};

/// A spawned task following the workload, cancelled as a unit
struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

type TaskSlot = Mutex<Option<BackgroundTask>>;

fn slot_tracked(slot: &TaskSlot) -> bool {
    slot.lock().is_some()
}

fn slot_active(slot: &TaskSlot) -> bool {
    slot.lock().as_ref().is_some_and(BackgroundTask::is_active)
}

fn cancel_slot(slot: &TaskSlot) {
    if let Some(task) = slot.lock().take() {
        task.token.cancel();
    }
}

/// State machine for a single resource key
pub struct Phaser<R: ManagedResource> {
    key: ResourceKey,
    ctx: Arc<ReconcilerContext<R>>,
    queue: SnapshotQueue<R>,
    receiver: Mutex<Option<SnapshotReceiver<R>>>,
    monitor: Arc<DeploymentMonitor>,
    leading: AtomicBool,
    ready: watch::Sender<bool>,
    observed_generation: AtomicI64,
    started: AtomicBool,
    cancel: CancellationToken,
    leadership: Mutex<CancellationToken>,
    become_deployed: TaskSlot,
    await_completion: TaskSlot,
}

impl<R: ManagedResource> Phaser<R> {
    /// Idle phaser for `key`; nothing runs until [`Phaser::start`]
    pub fn new(key: ResourceKey, ctx: Arc<ReconcilerContext<R>>) -> Self {
        let (queue, receiver) = snapshot_queue();
        let (ready, _) = watch::channel(false);
        let cancel = CancellationToken::new();
        let leadership = cancel.child_token();
        Self {
            monitor: Arc::new(DeploymentMonitor::new(key.clone())),
            key,
            ctx,
            queue,
            receiver: Mutex::new(Some(receiver)),
            leading: AtomicBool::new(false),
            ready,
            observed_generation: AtomicI64::new(0),
            started: AtomicBool::new(false),
            cancel,
            leadership: Mutex::new(leadership),
            become_deployed: Mutex::new(None),
            await_completion: Mutex::new(None),
        }
    }

    /// Key of the resource this phaser drives
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Spawn the task tree.
    ///
    /// Returns true only for the call that actually started it; a phaser
    /// cancelled before starting never runs.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return false;
        };

        let phaser = Arc::clone(self);
        let handle = tokio::spawn(async move { phaser.run(receiver).await });

        let leases = Arc::clone(&self.ctx.leases);
        let lease_name = self.key.lease_name();
        let identity = self.ctx.config.identity.clone();
        let lease_duration = self.ctx.config.lease_duration;
        let key = self.key.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                warn!(key = %key, error = %e, "Phaser task ended abnormally");
            }
            release_lease_after(leases, lease_name, identity, lease_duration).await;
        });

        debug!(key = %self.key, "Phaser started");
        true
    }

    /// Started and not cancelled yet
    pub fn is_active(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Tear down the whole task tree
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Queue a snapshot, replacing any that was not consumed yet
    pub fn push(&self, resource: R) {
        self.queue.push(resource);
    }

    /// Last generation this phaser acted on or skipped as already handled
    pub fn observed_generation(&self) -> i64 {
        self.observed_generation.load(Ordering::SeqCst)
    }

    /// Whether this process currently holds the resource's lease
    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    /// Whether `resource`'s generation was observed and is the one its last
    /// transition happened under
    pub fn was_generation_observed(&self, resource: &R) -> bool {
        let generation = resource.generation();
        generation == self.observed_generation()
            && resource.flork_status().generation_during_last_transition == Some(generation)
    }

    fn observe(&self, generation: i64) {
        self.observed_generation.store(generation, Ordering::SeqCst);
    }

    fn leadership_token(&self) -> CancellationToken {
        self.leadership.lock().clone()
    }

    async fn until_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as the phaser.
        let _ = ready.wait_for(|ready| *ready).await.map(|_| ());
    }

    async fn run(self: Arc<Self>, mut receiver: SnapshotReceiver<R>) {
        let watcher = Arc::clone(&self.ctx.watcher);
        let key = self.key.clone();
        let monitor = Arc::clone(&self.monitor);
        let token = self.cancel.child_token();
        tokio::spawn(async move { watcher.watch(key, monitor, token).await });

        let elector = LeaderElector::new(
            Arc::clone(&self.ctx.leases),
            self.key.lease_name(),
            self.ctx.config.identity.clone(),
            self.ctx.config.election(),
        );
        let phaser = Arc::clone(&self);
        let token = self.cancel.child_token();
        tokio::spawn(async move { elector.run(phaser.as_ref(), token).await });

        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = self.until_ready() => {}
        }
        debug!(key = %self.key, leading = self.is_leading(), "Leadership settled, consuming snapshots");

        loop {
            let snapshot = tokio::select! {
                _ = self.cancel.cancelled() => break,
                snapshot = receiver.recv() => match snapshot {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };

            let before = self.observed_generation();
            let leadership = self.leadership_token();
            let result = tokio::select! {
                result = self.reconcile_if_necessary(&mut receiver, snapshot) => result,
                _ = leadership.cancelled() => Err(Error::cancelled(format!("reconciliation of {}", self.key))),
            };
            if let Err(e) = result {
                self.observe(before);
                if e.is_cancelled() {
                    debug!(key = %self.key, error = %e, "Reconciliation interrupted");
                } else {
                    error!(key = %self.key, error = %e, "Reconciliation failed");
                }
            }
        }

        self.cancel.cancel();
        debug!(key = %self.key, "Phaser stopped");
    }

    /// Decide whether and how to act on a snapshot
    async fn reconcile_if_necessary(
        self: &Arc<Self>,
        receiver: &mut SnapshotReceiver<R>,
        mut resource: R,
    ) -> Result<()> {
        let generation = resource.generation();
        let status = resource.flork_status();
        let phase = status.flork_phase;
        let observed = self.observed_generation();
        let leading = self.is_leading();
        let spec_changed = observed > 0 && generation != observed;
        let transition_outdated = status
            .generation_during_last_transition
            .is_some_and(|g| g != generation);

        debug!(
            key = %self.key,
            generation,
            observed,
            phase = %phase,
            leading,
            "Snapshot received"
        );

        let outcome_recorded =
            phase.is_terminal() && status.generation_during_last_transition == Some(generation);

        if leading && phase == FlorkPhase::Created && !slot_tracked(&self.become_deployed) {
            // first deployment, or a crash before submission
        } else if outcome_recorded {
            // this generation already ended; a failed spec is not retried
        } else if leading && (spec_changed || transition_outdated) {
            info!(key = %self.key, generation, phase = %phase, "Spec changed, redeploying");
            if phase.is_terminal() {
                resource.flork_status_mut().flork_phase = FlorkPhase::Created;
            }
        } else if leading && phase == FlorkPhase::Deploying && !slot_tracked(&self.become_deployed) {
            info!(key = %self.key, generation, "Deployment was not confirmed, redeploying");
        } else if leading && phase == FlorkPhase::Deployed {
            self.resume_deployed(&resource).await?;
            self.observe(generation);
            return Ok(());
        } else if phase.is_terminal() {
            // the self-cancel below happens whether or not this process leads
        } else if generation == observed {
            debug!(key = %self.key, generation, "Generation already handled");
            return Ok(());
        }

        self.reconcile_if_leading(receiver, resource).await
    }

    /// Leader picking up a running workload: make sure its completion is
    /// watched, or fail the resource if the workload disappeared.
    async fn resume_deployed(self: &Arc<Self>, resource: &R) -> Result<()> {
        if slot_active(&self.await_completion) {
            return Ok(());
        }
        self.monitor.wait_observed().await;
        if self.monitor.exists() {
            info!(key = %self.key, "Resuming completion watch of running workload");
            self.start_completion_watch(resource.clone());
            return Ok(());
        }

        warn!(key = %self.key, "Workload vanished while deployed, marking failed");
        let mut failed = resource.clone();
        let status = failed.flork_status_mut();
        status.flork_phase = FlorkPhase::Failed;
        status.generation_during_last_transition = Some(resource.generation());
        self.ctx.operations.patch_status(&failed).await?;
        Ok(())
    }

    async fn reconcile_if_leading(
        self: &Arc<Self>,
        receiver: &mut SnapshotReceiver<R>,
        resource: R,
    ) -> Result<()> {
        self.observe(resource.generation());
        if self.is_leading() {
            self.dispatch(receiver, resource).await
        } else {
            if resource.phase().is_terminal() {
                debug!(key = %self.key, phase = %resource.phase(), "Terminal phase observed, stopping");
                self.cancel();
            }
            Ok(())
        }
    }

    async fn dispatch(self: &Arc<Self>, receiver: &mut SnapshotReceiver<R>, resource: R) -> Result<()> {
        match resource.phase() {
            FlorkPhase::Created => self.create(resource).await,
            FlorkPhase::Deploying | FlorkPhase::Deployed => self.redeploy(receiver, resource).await,
            FlorkPhase::Completed | FlorkPhase::Failed => {
                info!(key = %self.key, phase = %resource.phase(), "Resource reached a terminal phase, stopping");
                self.cancel();
                Ok(())
            }
        }
    }

    async fn create(self: &Arc<Self>, resource: R) -> Result<()> {
        let create = CreatePhase::new(Arc::clone(&self.ctx), Arc::clone(&self.monitor), &resource);
        let (deploying, config) = create.perform_initial_deployment(&resource).await?;
        self.start_become_deployed(create, deploying.clone(), config);
        self.start_completion_watch(deploying);
        Ok(())
    }

    /// Shut the workload down, confirm `COMPLETED`, create it again and
    /// confirm `DEPLOYING`. Each confirmation is a snapshot this process
    /// wrote, so stale cached copies are never acted on.
    async fn redeploy(self: &Arc<Self>, receiver: &mut SnapshotReceiver<R>, resource: R) -> Result<()> {
        let result = self.redeploy_steps(receiver, resource).await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                error!(key = %self.key, error = %e, "Redeployment failed");
            }
        }
        result
    }

    async fn redeploy_steps(
        self: &Arc<Self>,
        receiver: &mut SnapshotReceiver<R>,
        resource: R,
    ) -> Result<()> {
        cancel_slot(&self.await_completion);
        cancel_slot(&self.become_deployed);

        let existed = self.monitor.exists();
        let deletion = self.monitor.deletion_signal();
        let shutdown = ShutdownPhase::new(Arc::clone(&self.ctx), &resource);
        let savepoint = match shutdown.shut_down_cleanly(&resource).await {
            Ok(savepoint) => savepoint,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                error!(key = %self.key, error = %e, "Shutdown failed");
                None
            }
        };
        if existed {
            deletion.wait().await;
        }

        let mut completed = self.ctx.operations.reload(&resource).await?;
        let status = completed.flork_status_mut();
        status.flork_phase = FlorkPhase::Completed;
        if savepoint.is_some() {
            status.known_savepoint_path = savepoint;
        }
        self.ctx.operations.patch_status(&completed).await?;

        let confirmed = receiver
            .recv_until(|r| r.phase() == FlorkPhase::Completed)
            .await
            .ok_or_else(|| Error::cancelled(format!("waiting for {} to complete", self.key)))?;
        debug!(key = %self.key, "Shutdown confirmed");
        if confirmed.wants_high_availability_cleanup() {
            self.ctx.capabilities.clean_high_availability(&confirmed).await?;
        }

        let create = CreatePhase::new(Arc::clone(&self.ctx), Arc::clone(&self.monitor), &confirmed);
        let (_, config) = create.perform_initial_deployment(&confirmed).await?;
        let deploying = receiver
            .recv_until(|r| r.phase() == FlorkPhase::Deploying)
            .await
            .ok_or_else(|| Error::cancelled(format!("waiting for {} to deploy", self.key)))?;
        debug!(key = %self.key, "Deployment confirmed");

        self.start_become_deployed(create, deploying.clone(), config);
        self.start_completion_watch(deploying);
        Ok(())
    }

    /// Run `work` in `slot`, replacing whatever ran there before. `work`
    /// receives the task's token; once it is cancelled the task must not
    /// write anything.
    fn spawn_background<W, F>(&self, slot: &TaskSlot, task: &'static str, work: W)
    where
        W: FnOnce(CancellationToken) -> F,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.leadership.lock().child_token();
        let guard = token.clone();
        let work = work(token.clone());
        let key = self.key.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => debug!(key = %key, task, "Background task cancelled"),
                result = work => match result {
                    Ok(()) => debug!(key = %key, task, "Background task finished"),
                    Err(e) if e.is_cancelled() => debug!(key = %key, task, "Background task interrupted"),
                    Err(e) => error!(key = %key, task, error = %e, "Background task failed"),
                },
            }
        });
        if let Some(previous) = slot.lock().replace(BackgroundTask { token, handle }) {
            previous.token.cancel();
        }
    }

    fn start_become_deployed(&self, create: CreatePhase<R>, resource: R, config: RuntimeConfig) {
        self.spawn_background(&self.become_deployed, "become-deployed", |_| async move {
            create.await_running(resource, config).await
        });
    }

    fn start_completion_watch(self: &Arc<Self>, resource: R) {
        let deletion = self.monitor.deletion_signal();
        let phaser = Arc::clone(self);
        self.spawn_background(&self.await_completion, "await-completion", |token| async move {
            phaser.follow_completion(resource, deletion, token).await
        });
    }

    /// Wait for the workload to go away, then complete the resource and stop.
    ///
    /// A redeployment cancels this task before deleting the workload, so a
    /// deletion seen after cancellation belongs to the redeployment.
    async fn follow_completion(
        &self,
        resource: R,
        deletion: DeletionSignal,
        token: CancellationToken,
    ) -> Result<()> {
        deletion.wait().await;
        if token.is_cancelled() {
            return Err(Error::cancelled(format!("completion watch of {}", self.key)));
        }
        info!(key = %self.key, "Workload terminated");
        cancel_slot(&self.become_deployed);

        if resource.delete_on_termination() {
            let deleted = self.ctx.operations.delete(&resource).await?;
            info!(key = %self.key, deleted, "Deleted resource after termination");
        } else {
            let mut completed = self.ctx.operations.reload(&resource).await?;
            let status = completed.flork_status_mut();
            status.flork_phase = FlorkPhase::Completed;
            status.generation_during_last_transition = Some(self.observed_generation());
            let completed = self.ctx.operations.patch_status(&completed).await?;
            if completed.wants_high_availability_cleanup() {
                self.ctx.capabilities.clean_high_availability(&completed).await?;
            }
        }

        self.cancel();
        Ok(())
    }
}

impl<R: ManagedResource> LeaderCallbacks for Phaser<R> {
    fn on_started_leading(&self) {
        info!(key = %self.key, "Leading");
        self.leading.store(true, Ordering::SeqCst);
        self.ready.send_replace(true);
    }

    fn on_stopped_leading(&self) {
        info!(key = %self.key, "Stopped leading");
        self.leading.store(false, Ordering::SeqCst);
        cancel_slot(&self.await_completion);
        cancel_slot(&self.become_deployed);
        let fresh = self.cancel.child_token();
        let lost = std::mem::replace(&mut *self.leadership.lock(), fresh);
        lost.cancel();
        self.ready.send_replace(true);
    }

    fn on_new_leader(&self, identity: &str) {
        if identity == self.ctx.config.identity {
            return;
        }
        debug!(key = %self.key, leader = %identity, "Another process leads");
        self.leading.store(false, Ordering::SeqCst);
        self.ready.send_replace(true);
    }
}
