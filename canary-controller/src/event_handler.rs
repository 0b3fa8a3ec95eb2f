use std::sync::Arc;

use canary_controller_apis::Canary;

use crate::{
    informer::{CacheEvent, CacheEventHandler},
    resource_key::ResourceKey,
    snapshot::SnapshotTable,
    workqueue::WorkQueue,
};

/// Turns cache notifications into work queue keys.
///
/// Adds and real updates are enqueued rate limited, updates which do not
/// change the resource version are dropped, and deletes remove the snapshot
/// entry right away without going through the queue.
pub(crate) struct EventNormalizer {
    queue: WorkQueue<ResourceKey>,
    snapshots: Arc<SnapshotTable>,
}

impl EventNormalizer {
    pub fn new(queue: WorkQueue<ResourceKey>, snapshots: Arc<SnapshotTable>) -> Self {
        Self { queue, snapshots }
    }

    fn key_of(canary: &Canary, op: &str) -> Option<ResourceKey> {
        let key = ResourceKey::from_object(canary);
        if key.is_none() {
            error!(
                "dropping {} event for malformed Canary without name or namespace: {:?}",
                op, canary.metadata
            );
        }
        key
    }

    fn on_add(&self, new: &Canary) {
        if let Some(key) = Self::key_of(new, "add") {
            self.queue.add_rate_limited(key);
        }
    }

    fn on_update(&self, old: &Canary, new: &Canary) {
        let (Some(_), Some(key)) = (Self::key_of(old, "update"), Self::key_of(new, "update"))
        else {
            return;
        };
        if old.metadata.resource_version == new.metadata.resource_version {
            trace!("ignoring update of {} with unchanged resource version", key);
            return;
        }
        self.queue.add_rate_limited(key);
    }

    fn on_delete(&self, old: &Canary) {
        if let Some(key) = Self::key_of(old, "delete") {
            info!("Deleting {} from cache", key);
            self.snapshots.delete(&key);
        }
    }
}

impl CacheEventHandler for EventNormalizer {
    fn handle(&self, event: CacheEvent) {
        match event {
            CacheEvent::Added(new) => self.on_add(&new),
            CacheEvent::Updated { old, new } => self.on_update(&old, &new),
            CacheEvent::Deleted(old) => self.on_delete(&old),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fixtures::canary, rate_limiter::ItemExponentialFailureRateLimiter};
    use std::time::Duration;

    fn normalizer() -> (EventNormalizer, WorkQueue<ResourceKey>, Arc<SnapshotTable>) {
        let queue = WorkQueue::new(
            "test",
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::ZERO,
                Duration::ZERO,
            )),
        );
        let snapshots = Arc::new(SnapshotTable::new());
        (
            EventNormalizer::new(queue.clone(), snapshots.clone()),
            queue,
            snapshots,
        )
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name).unwrap()
    }

    #[tokio::test]
    async fn add_enqueues_key() {
        let (normalizer, queue, _) = normalizer();
        normalizer.handle(CacheEvent::Added(Arc::new(canary("foo", "default", "1"))));
        assert_eq!(1, queue.len());
        assert_eq!(Some(key("foo")), queue.get().await);
    }

    #[tokio::test]
    async fn update_with_same_resource_version_is_dropped() {
        let (normalizer, queue, _) = normalizer();
        let before = queue.len();
        normalizer.handle(CacheEvent::Updated {
            old: Arc::new(canary("foo", "default", "1")),
            new: Arc::new(canary("foo", "default", "1")),
        });
        assert_eq!(before, queue.len());
    }

    #[tokio::test]
    async fn update_with_new_resource_version_enqueues() {
        let (normalizer, queue, _) = normalizer();
        normalizer.handle(CacheEvent::Updated {
            old: Arc::new(canary("foo", "default", "1")),
            new: Arc::new(canary("foo", "default", "2")),
        });
        assert_eq!(Some(key("foo")), queue.get().await);
    }

    #[tokio::test]
    async fn malformed_objects_are_dropped() {
        let (normalizer, queue, _) = normalizer();
        let mut nameless = canary("foo", "default", "2");
        nameless.metadata.name = None;
        normalizer.handle(CacheEvent::Added(Arc::new(nameless.clone())));
        normalizer.handle(CacheEvent::Updated {
            old: Arc::new(nameless),
            new: Arc::new(canary("foo", "default", "3")),
        });
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_snapshot_without_enqueue() {
        let (normalizer, queue, snapshots) = normalizer();
        snapshots
            .begin(&key("foo"))
            .commit(Arc::new(canary("foo", "default", "1")));
        normalizer.handle(CacheEvent::Deleted(Arc::new(canary("foo", "default", "1"))));
        assert!(snapshots.get(&key("foo")).is_none());
        assert!(queue.is_empty());
    }
}
