//! Tracking of the workload Deployment a resource submitted
//!
//! The monitor keeps two signals: whether the Deployment currently exists,
//! and a one-shot "fully deleted" signal that is replaced by a fresh one
//! every time it fires, so that create/delete cycles across redeploys each
//! get their own signal. Until the first observation arrives the existence
//! flag is meaningless; [`DeploymentMonitor::wait_observed`] gates on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flork_common::crd::ResourceKey;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

/// Existence tracker for a single workload Deployment
pub struct DeploymentMonitor {
    key: ResourceKey,
    exists: AtomicBool,
    observed: watch::Sender<bool>,
    deletion: Mutex<watch::Sender<bool>>,
}

impl DeploymentMonitor {
    /// Monitor for the workload of the resource called `key`
    pub fn new(key: ResourceKey) -> Self {
        let (tx, _) = watch::channel(false);
        let (observed, _) = watch::channel(false);
        Self {
            key,
            exists: AtomicBool::new(false),
            observed,
            deletion: Mutex::new(tx),
        }
    }

    /// Whether the Deployment was last seen present
    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    /// Wait until the Deployment was observed present or absent once
    pub async fn wait_observed(&self) {
        let mut rx = self.observed.subscribe();
        // The sender lives as long as the monitor.
        let _ = rx.wait_for(|seen| *seen).await.map(|_| ());
    }

    /// Record that the Deployment is present
    pub fn on_added(&self) {
        self.observed.send_replace(true);
        if self
            .exists
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(key = %self.key, "Workload deployment added");
        }
    }

    /// Record that the Deployment is gone.
    ///
    /// Fires the current deletion signal and installs a fresh one. Does
    /// nothing unless the Deployment was previously seen.
    pub fn on_deleted(&self) {
        self.observed.send_replace(true);
        if self
            .exists
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let (fresh, _) = watch::channel(false);
            let fired = std::mem::replace(&mut *self.deletion.lock(), fresh);
            fired.send_replace(true);
            info!(key = %self.key, "Workload deployment deleted");
        } else {
            debug!(key = %self.key, "Deletion observed for absent workload deployment");
        }
    }

    /// Signal that fires on the next observed deletion.
    ///
    /// Grab it before triggering the deletion, otherwise the firing may be
    /// missed.
    pub fn deletion_signal(&self) -> DeletionSignal {
        DeletionSignal {
            rx: self.deletion.lock().subscribe(),
        }
    }
}

/// One-shot signal for a single deletion of the workload Deployment
#[derive(Clone, Debug)]
pub struct DeletionSignal {
    rx: watch::Receiver<bool>,
}

impl DeletionSignal {
    /// Whether the deletion already happened
    pub fn has_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the deletion.
    ///
    /// A signal dropped without firing belongs to a monitor that went away;
    /// waiting on it never completes, the surrounding task is cancelled instead.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|fired| *fired).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Wait for the deletion at most `timeout`, returning whether it fired
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> DeploymentMonitor {
        DeploymentMonitor::new(ResourceKey::new("ns", "job"))
    }

    #[test]
    fn tracks_existence() {
        let monitor = monitor();
        assert!(!monitor.exists());
        monitor.on_added();
        assert!(monitor.exists());
        monitor.on_deleted();
        assert!(!monitor.exists());
    }

    #[test]
    fn deletion_fires_signal_grabbed_before() {
        let monitor = monitor();
        monitor.on_added();
        let signal = monitor.deletion_signal();
        assert!(!signal.has_fired());

        monitor.on_deleted();
        assert!(signal.has_fired());
    }

    #[test]
    fn signal_is_renewed_after_each_deletion() {
        let monitor = monitor();
        monitor.on_added();
        monitor.on_deleted();

        let second = monitor.deletion_signal();
        assert!(!second.has_fired());

        monitor.on_added();
        monitor.on_deleted();
        assert!(second.has_fired());
    }

    #[test]
    fn deletion_without_presence_does_not_fire() {
        let monitor = monitor();
        let signal = monitor.deletion_signal();
        monitor.on_deleted();
        assert!(!signal.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn absence_counts_as_observation() {
        let monitor = monitor();
        let pending = tokio::time::timeout(Duration::from_secs(1), monitor.wait_observed()).await;
        assert!(pending.is_err());

        monitor.on_deleted();
        monitor.wait_observed().await;
        assert!(!monitor.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_reports_firing() {
        let monitor = std::sync::Arc::new(monitor());
        monitor.on_added();
        let signal = monitor.deletion_signal();

        assert!(!signal.wait_timeout(Duration::from_secs(1)).await);

        let m = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            m.on_deleted();
        });
        assert!(signal.wait_timeout(Duration::from_secs(2)).await);
    }
}
