use std::{sync::Arc, time::Duration};

use canary_controller_apis::Canary;
use futures::Stream;
use kube_runtime::watcher;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::ControllerError,
    event_handler::EventNormalizer,
    events::EventRecorder,
    informer::ResourceCache,
    reconciler::Reconciler,
    resource_key::ResourceKey,
    snapshot::SnapshotTable,
    worker_pool::WorkerPool,
    workqueue::WorkQueue,
};

const QUEUE_NAME: &str = "canaries";

/// Lifecycle of a [`CanaryController`], only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    Created,
    CacheSyncing,
    Running,
    Draining,
    Stopped,
}

/// Wires cache, queue, workers and reconciler for [`Canary`] objects and runs
/// them in order: no key is reconciled before the cache holds a complete
/// listing.
pub(crate) struct CanaryController {
    queue: WorkQueue<ResourceKey>,
    snapshots: Arc<SnapshotTable>,
    cache: ResourceCache,
    reconciler: Arc<Reconciler>,
    phase: watch::Sender<Phase>,
}

impl CanaryController {
    pub fn new(recorder: Arc<dyn EventRecorder>, resync_period: Option<Duration>) -> Self {
        let queue = WorkQueue::with_default_rate_limiter(QUEUE_NAME);
        let snapshots = Arc::new(SnapshotTable::new());
        let cache = ResourceCache::new(resync_period);
        let reconciler = Arc::new(Reconciler::new(
            cache.lister(),
            snapshots.clone(),
            recorder,
        ));
        let (phase, _) = watch::channel(Phase::Created);
        Self {
            queue,
            snapshots,
            cache,
            reconciler,
            phase,
        }
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    #[cfg(test)]
    pub fn snapshots(&self) -> Arc<SnapshotTable> {
        self.snapshots.clone()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails with [`ControllerError::CacheSync`] when shutdown is requested (or
    /// the watch ends) before the initial listing completed.
    pub async fn run<S>(
        self,
        events: S,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<Canary>, watcher::Error>> + Send + 'static,
    {
        let Self {
            queue,
            snapshots,
            cache,
            reconciler,
            phase,
        } = self;
        let enter = |next: Phase| {
            debug!("Canary controller phase {:?}", next);
            phase.send_replace(next);
        };

        info!("Starting Canary controller");
        enter(Phase::CacheSyncing);
        let sync_state = cache.synced();
        let normalizer = EventNormalizer::new(queue.clone(), snapshots.clone());
        let informer = tokio::spawn(cache.run(events, normalizer, shutdown.clone()));

        info!("Waiting for informer caches to sync");
        let cache_synced = tokio::select! {
            _ = shutdown.cancelled() => false,
            synced = wait_for_sync(sync_state) => synced,
        };
        if !cache_synced {
            queue.shut_down();
            if let Err(e) = informer.await {
                error!("Canary cache terminated abnormally: {}", e);
            }
            enter(Phase::Stopped);
            return Err(ControllerError::CacheSync("canary".to_string()));
        }

        info!("Starting workers");
        enter(Phase::Running);
        let pool = WorkerPool::start(workers, queue.clone(), reconciler);
        info!("Started {} workers", pool.len());
        shutdown.cancelled().await;

        info!("Shutting down workers");
        enter(Phase::Draining);
        queue.shut_down();
        pool.join().await;
        if let Err(e) = informer.await {
            error!("Canary cache terminated abnormally: {}", e);
        }
        info!(
            "Canary controller stopped with {} cached canaries",
            snapshots.len()
        );
        enter(Phase::Stopped);
        Ok(())
    }
}

/// `false` if the cache went away before it synced.
async fn wait_for_sync(mut synced: watch::Receiver<bool>) -> bool {
    synced.wait_for(|s| *s).await.is_ok()
}
