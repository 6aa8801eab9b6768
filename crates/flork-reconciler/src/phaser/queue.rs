//! Single-slot snapshot queue
//!
//! Holds at most one pending snapshot. Pushing overwrites whatever was not
//! consumed yet, so the consumer always acts on the freshest definition.

use tokio::sync::watch;

/// Producer side, cheap to share between event sources
pub struct SnapshotQueue<R> {
    tx: watch::Sender<Option<R>>,
}

/// Consumer side, owned by exactly one loop
pub struct SnapshotReceiver<R> {
    rx: watch::Receiver<Option<R>>,
}

/// Create an empty queue
pub fn snapshot_queue<R>() -> (SnapshotQueue<R>, SnapshotReceiver<R>) {
    let (tx, rx) = watch::channel(None);
    (SnapshotQueue { tx }, SnapshotReceiver { rx })
}

impl<R> SnapshotQueue<R> {
    /// Replace the pending snapshot
    pub fn push(&self, snapshot: R) {
        self.tx.send_replace(Some(snapshot));
    }
}

impl<R: Clone> SnapshotReceiver<R> {
    /// Next snapshot, None once the producer is gone
    pub async fn recv(&mut self) -> Option<R> {
        loop {
            self.rx.changed().await.ok()?;
            let pending = self.rx.borrow_and_update().clone();
            if pending.is_some() {
                return pending;
            }
        }
    }

    /// Skip snapshots until one satisfies `accept`, returning it
    pub async fn recv_until(&mut self, accept: impl Fn(&R) -> bool) -> Option<R> {
        loop {
            let snapshot = self.recv().await?;
            if accept(&snapshot) {
                return Some(snapshot);
            }
        }
    }
}
