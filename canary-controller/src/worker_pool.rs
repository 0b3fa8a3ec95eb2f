use std::{any::Any, fmt::Display, future::Future, hash::Hash, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::{errors::ControllerError, workqueue::WorkQueue};

/// Processes a single key taken from the work queue.
pub(crate) trait SyncHandler<K>: Send + Sync + 'static {
    fn sync(&self, key: &K) -> impl Future<Output = Result<(), ControllerError>> + Send;
}

/// Fixed set of symmetric workers pulling from one [`WorkQueue`].
pub(crate) struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start<K, H>(threadiness: usize, queue: WorkQueue<K>, handler: Arc<H>) -> Self
    where
        K: Clone + Eq + Hash + Display + Send + Sync + 'static,
        H: SyncHandler<K>,
    {
        let workers = (0..threadiness.max(1))
            .map(|id| {
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    debug!("worker {} started", id);
                    while process_next_work_item(&queue, handler.as_ref()).await {}
                    debug!("worker {} stopped", id);
                })
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Wait until every worker has left its loop, which happens once the
    /// queue is shut down and the in-flight items are done.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("worker terminated abnormally: {}", e);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Returns `false` once the queue has been shut down.
async fn process_next_work_item<K, H>(queue: &WorkQueue<K>, handler: &H) -> bool
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    H: SyncHandler<K>,
{
    let key = match queue.get().await {
        Some(key) => key,
        None => return false,
    };
    match AssertUnwindSafe(handler.sync(&key)).catch_unwind().await {
        Ok(Ok(())) => {
            // No error, so stop tracking retries until the next failure.
            queue.forget(&key);
        }
        Ok(Err(e)) => {
            error!("error syncing '{}': {}, requeuing", key, e);
            queue.add_rate_limited(key.clone());
        }
        Err(panic) => {
            error!(
                "observed a panic while syncing '{}': {}, requeuing",
                key,
                panic_message(panic.as_ref())
            );
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::ItemExponentialFailureRateLimiter;
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use tokio::{sync::Semaphore, time::timeout};

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(
            "test",
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_millis(10),
            )),
        )
    }

    /// Fails (or panics) a configurable number of times per key, then succeeds.
    #[derive(Default)]
    struct FlakyHandler {
        failures: Mutex<HashMap<String, usize>>,
        panics: Mutex<HashMap<String, usize>>,
        synced: Mutex<Vec<String>>,
    }

    fn take_one(counts: &Mutex<HashMap<String, usize>>, key: &str) -> bool {
        match counts.lock().unwrap().get_mut(key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    impl SyncHandler<String> for FlakyHandler {
        async fn sync(&self, key: &String) -> Result<(), ControllerError> {
            if take_one(&self.panics, key) {
                panic!("boom {}", key);
            }
            if take_one(&self.failures, key) {
                return Err(ControllerError::Configuration("transient".to_string()));
            }
            self.synced.lock().unwrap().push(key.clone());
            Ok(())
        }
    }

    async fn wait_for(what: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !what() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn success_forgets_backoff_history() {
        let q = queue();
        let handler = Arc::new(FlakyHandler::default());
        let pool = WorkerPool::start(2, q.clone(), handler.clone());
        assert_eq!(2, pool.len());
        q.add_rate_limited("foo".to_string());
        wait_for(|| handler.synced.lock().unwrap().len() == 1).await;
        wait_for(|| q.num_requeues(&"foo".to_string()) == 0).await;
        q.shut_down();
        pool.join().await;
    }

    #[tokio::test]
    async fn errors_are_requeued_with_backoff() {
        let q = queue();
        let handler = Arc::new(FlakyHandler::default());
        handler.failures.lock().unwrap().insert("foo".to_string(), 3);
        let pool = WorkerPool::start(1, q.clone(), handler.clone());
        q.add("foo".to_string());
        wait_for(|| handler.synced.lock().unwrap().len() == 1).await;
        assert_eq!(0, handler.failures.lock().unwrap()["foo"]);
        q.shut_down();
        pool.join().await;
    }

    #[tokio::test]
    async fn panics_are_contained_to_the_item() {
        let q = queue();
        let handler = Arc::new(FlakyHandler::default());
        handler.panics.lock().unwrap().insert("bad".to_string(), 1);
        // a single worker must survive the panic to process both keys
        let pool = WorkerPool::start(1, q.clone(), handler.clone());
        q.add("bad".to_string());
        q.add("good".to_string());
        wait_for(|| {
            let synced = handler.synced.lock().unwrap();
            synced.contains(&"good".to_string()) && synced.contains(&"bad".to_string())
        })
        .await;
        q.shut_down();
        pool.join().await;
    }

    /// Blocks every sync until a permit is released.
    struct GatedHandler {
        gate: Semaphore,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl SyncHandler<String> for GatedHandler {
        async fn sync(&self, _key: &String) -> Result<(), ControllerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_and_abandons_queued() {
        let q = queue();
        let handler = Arc::new(GatedHandler {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let pool = WorkerPool::start(2, q.clone(), handler.clone());
        for key in ["a", "b", "c", "d", "e"] {
            q.add(key.to_string());
        }
        // two workers are mid-reconciliation, three items are queued
        wait_for(|| handler.started.load(Ordering::SeqCst) == 2).await;
        assert_eq!(3, q.len());
        q.shut_down();
        handler.gate.add_permits(2);
        timeout(Duration::from_secs(5), pool.join()).await.unwrap();
        assert_eq!(2, handler.finished.load(Ordering::SeqCst));
        assert_eq!(2, handler.started.load(Ordering::SeqCst));
    }
}
