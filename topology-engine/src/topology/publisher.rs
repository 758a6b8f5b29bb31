use arc_swap::ArcSwap;
use common::ClusterDescription;
use std::sync::Arc;
use tokio::sync::watch;

/// Holds the current cluster snapshot. Readers load it lock-free; every
/// publication also broadcasts the new version to subscribers.
pub struct TopologyPublisher {
    current: ArcSwap<ClusterDescription>,
    version: watch::Sender<u64>,
}

impl TopologyPublisher {
    pub fn new(initial: ClusterDescription) -> Self {
        let (version, _) = watch::channel(initial.version);
        Self {
            current: ArcSwap::from_pointee(initial),
            version,
        }
    }

    pub fn load(&self) -> Arc<ClusterDescription> {
        self.current.load_full()
    }

    pub fn publish(&self, description: ClusterDescription) -> Arc<ClusterDescription> {
        let version = description.version;
        let snapshot = Arc::new(description);
        self.current.store(snapshot.clone());
        self.version.send_replace(version);
        snapshot
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Wakes subscribers without a new snapshot, e.g. on shutdown.
    pub fn close(&self) {
        self.version.send_modify(|_| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ClusterType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_notifies_and_swaps() {
        let initial = ClusterDescription::new(ClusterType::Unknown, Vec::new(), None, false, Duration::from_secs(10));
        let publisher = TopologyPublisher::new(initial);
        let before = publisher.load();
        let mut rx = publisher.subscribe();

        let mut next = (*before).clone();
        next.version = 1;
        next.cluster_type = ClusterType::Sharded;
        publisher.publish(next);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        let after = publisher.load();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.cluster_type, ClusterType::Unknown);
        assert_eq!(after.cluster_type, ClusterType::Sharded);
    }
}
