use std::{collections::HashMap, sync::Arc, time::Duration};

use canary_controller_apis::Canary;
use futures::{Stream, StreamExt};
use kube_runtime::{
    reflector::{self, store::Writer, ObjectRef, Store},
    watcher,
};
use tokio::{
    sync::watch,
    time::{interval_at, Instant, Interval},
};
use tokio_util::sync::CancellationToken;

/// Change notification derived from the watch stream.
#[derive(Debug, Clone)]
pub(crate) enum CacheEvent {
    Added(Arc<Canary>),
    Updated { old: Arc<Canary>, new: Arc<Canary> },
    Deleted(Arc<Canary>),
}

/// Consumer of [`CacheEvent`]s. Called serially from the cache task, after
/// the store reflects the change.
pub(crate) trait CacheEventHandler: Send + Sync {
    fn handle(&self, event: CacheEvent);
}

/// Read-only access to the cached [`Canary`] objects.
#[derive(Clone)]
pub(crate) struct Lister {
    store: Store<Canary>,
}

impl Lister {
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Canary>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }
}

/// Eventually consistent mirror of the watched [`Canary`] objects.
///
/// Feeds a reflector store from a watch stream and turns the raw watch events
/// into [`CacheEvent`]s, including the objects which vanished while the watch
/// was relisting.
pub(crate) struct ResourceCache {
    writer: Writer<Canary>,
    store: Store<Canary>,
    /// Objects seen by the relist in progress.
    relist: Option<Vec<ObjectRef<Canary>>>,
    synced: watch::Sender<bool>,
    resync_period: Option<Duration>,
}

impl ResourceCache {
    pub fn new(resync_period: Option<Duration>) -> Self {
        let (store, writer) = reflector::store();
        let (synced, _) = watch::channel(false);
        Self {
            writer,
            store,
            relist: None,
            synced,
            resync_period: resync_period.filter(|p| !p.is_zero()),
        }
    }

    pub fn lister(&self) -> Lister {
        Lister {
            store: self.store.clone(),
        }
    }

    /// Whether the first complete listing has been observed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub fn apply<H: CacheEventHandler + ?Sized>(
        &mut self,
        event: watcher::Event<Canary>,
        handler: &H,
    ) {
        match &event {
            watcher::Event::Init => {
                debug!("canary cache relist started");
                self.relist = Some(Vec::new());
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) => {
                self.relist
                    .get_or_insert_with(Vec::new)
                    .push(ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                let mut previous: HashMap<ObjectRef<Canary>, Arc<Canary>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect();
                self.writer.apply_watcher_event(&event);
                let relisted = self.relist.take().unwrap_or_default();
                debug!("canary cache relist done with {} objects", relisted.len());
                for obj_ref in relisted {
                    if let Some(new) = self.store.get(&obj_ref) {
                        match previous.remove(&obj_ref) {
                            Some(old) => handler.handle(CacheEvent::Updated { old, new }),
                            None => handler.handle(CacheEvent::Added(new)),
                        }
                    }
                }
                // Everything not relisted has been deleted while we were not watching.
                for (_, old) in previous {
                    handler.handle(CacheEvent::Deleted(old));
                }
                if !self.synced.send_replace(true) {
                    info!("canary cache synced");
                }
            }
            watcher::Event::Apply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.store.get(&obj_ref);
                self.writer.apply_watcher_event(&event);
                let new = self
                    .store
                    .get(&obj_ref)
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                match old {
                    Some(old) => handler.handle(CacheEvent::Updated { old, new }),
                    None => handler.handle(CacheEvent::Added(new)),
                }
            }
            watcher::Event::Delete(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.store.get(&obj_ref);
                self.writer.apply_watcher_event(&event);
                handler.handle(CacheEvent::Deleted(
                    old.unwrap_or_else(|| Arc::new(obj.clone())),
                ));
            }
        }
    }

    /// Re-deliver every cached object as an update to itself.
    pub fn resync<H: CacheEventHandler + ?Sized>(&self, handler: &H) {
        let objects = self.store.state();
        trace!("resyncing {} cached canaries", objects.len());
        for obj in objects {
            handler.handle(CacheEvent::Updated {
                old: obj.clone(),
                new: obj,
            });
        }
    }

    /// Consume the watch stream until it ends or `shutdown` fires.
    pub async fn run<S, H>(mut self, events: S, handler: H, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<Canary>, watcher::Error>> + Send,
        H: CacheEventHandler,
    {
        let mut events = std::pin::pin!(events);
        let mut resync = self
            .resync_period
            .map(|period| interval_at(Instant::now() + period, period));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event, &handler),
                    Some(Err(e)) => warn!("canary watch failed: {}", e),
                    None => {
                        warn!("canary watch stream ended");
                        break;
                    }
                },
                _ = tick(&mut resync), if self.has_synced() => self.resync(&handler),
            }
        }
        debug!("canary cache stopped");
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
