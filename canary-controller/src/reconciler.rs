use std::{sync::Arc, time::Instant};

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

use crate::{
    errors::ControllerError,
    events::{EventRecorder, Severity, REASON_SYNCED},
    informer::Lister,
    resource_key::ResourceKey,
    snapshot::SnapshotTable,
    utils::metric_name,
    worker_pool::SyncHandler,
};

const RECONCILER: &'static str = "reconciler";

/// Sync handler for [`Canary`](canary_controller_apis::Canary) keys.
///
/// Every pass starts from the object currently in the cache, never from what a
/// previous pass has seen.
pub(crate) struct Reconciler {
    lister: Lister,
    snapshots: Arc<SnapshotTable>,
    recorder: Arc<dyn EventRecorder>,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl Reconciler {
    pub fn new(
        lister: Lister,
        snapshots: Arc<SnapshotTable>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let meter: Meter = global::meter(RECONCILER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of Canary reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of Canary objects in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            lister,
            snapshots,
            recorder,
            reconcile_count,
            reconcile_duration,
        }
    }
}

impl SyncHandler<ResourceKey> for Reconciler {
    async fn sync(&self, key: &ResourceKey) -> Result<(), ControllerError> {
        let start = Instant::now();
        // Opened before the lookup, so a delete landing from here on wins.
        let fence = self.snapshots.begin(key);
        let canary = match self.lister.get(&key.namespace, &key.name) {
            Some(canary) => canary,
            None => {
                warn!("{} in work queue no longer exists", key);
                return Ok(());
            }
        };

        if let Some(previous) = self.snapshots.get(key) {
            if previous.metadata.resource_version != canary.metadata.resource_version {
                debug!(
                    "{} changed from resource version {:?} to {:?}",
                    key, previous.metadata.resource_version, canary.metadata.resource_version
                );
            }
        }

        self.recorder.record(
            &canary,
            Severity::Normal,
            REASON_SYNCED,
            format!("Synced canary {}", key),
        );

        if !fence.commit(canary) {
            debug!("{} was deleted while it was synced, not caching it", key);
            return Ok(());
        }
        info!("Synced {}", key);

        let labels = &[
            KeyValue::new("object_name", key.name.clone()),
            KeyValue::new("object_namespace", key.namespace.clone()),
        ];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(start.elapsed().as_millis() as u64, labels);
        Ok(())
    }
}
