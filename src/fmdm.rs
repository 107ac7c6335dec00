//! Fleet Management Data Model publisher: copy-on-write snapshot broadcast
//! to WebSocket clients. See `SPEC_FULL.md` §4 / spec.md §3, §9 ("Replace
//! thread-shared mutable snapshot with copy-on-write").

use crate::types::{FmdmSnapshot, FolderEntry};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Producers publish a new snapshot pointer; consumers read whatever pointer
/// they last observed rather than locking a shared mutable struct.
pub struct FmdmPublisher {
    current: ArcSwap<FmdmSnapshot>,
    revision: AtomicU64,
    tx: broadcast::Sender<Arc<FmdmSnapshot>>,
}

impl FmdmPublisher {
    pub fn new(daemon_version: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            current: ArcSwap::from_pointee(FmdmSnapshot::empty(daemon_version)),
            revision: AtomicU64::new(0),
            tx,
        }
    }

    pub fn current(&self) -> Arc<FmdmSnapshot> {
        self.current.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FmdmSnapshot>> {
        self.tx.subscribe()
    }

    /// Publishes a new snapshot built from `folders`, stamping it with the
    /// next monotonic revision. A client that applies snapshots out of
    /// transport order can always tell the stale one apart by `revision`.
    /// Does not itself fan out to subscribers — callers that want the rate
    /// cap / debounce guarantee of `BroadcastThrottler` go through
    /// `broadcast_current` instead of sending unconditionally here.
    pub fn publish(&self, folders: Vec<FolderEntry>) -> Arc<FmdmSnapshot> {
        let prev = self.current.load();
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(FmdmSnapshot {
            revision,
            folders,
            daemon_version: prev.daemon_version.clone(),
            hardware: prev.hardware.clone(),
        });
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }

    /// Sends whatever snapshot is currently published to subscribers. This
    /// is the `BroadcastThrottler`'s `emit` hook — the actual wire fan-out
    /// spec.md §4.7 rate-caps and debounces.
    pub fn broadcast_current(&self) {
        let _ = self.tx.send(self.current.load_full());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_is_monotonic() {
        let publisher = FmdmPublisher::new("0.1.0");
        let s1 = publisher.publish(vec![]);
        let s2 = publisher.publish(vec![]);
        assert!(s2.revision > s1.revision);
    }

    #[tokio::test]
    async fn subscribers_receive_broadcast_current() {
        let publisher = FmdmPublisher::new("0.1.0");
        let mut rx = publisher.subscribe();
        publisher.publish(vec![]);
        publisher.broadcast_current();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.revision, 1);
    }

    #[tokio::test]
    async fn publish_alone_does_not_broadcast() {
        let publisher = FmdmPublisher::new("0.1.0");
        let mut rx = publisher.subscribe();
        publisher.publish(vec![]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn current_reflects_latest_publish_without_locking() {
        let publisher = FmdmPublisher::new("0.1.0");
        publisher.publish(vec![]);
        publisher.publish(vec![]);
        assert_eq!(publisher.current().revision, 2);
    }
}
