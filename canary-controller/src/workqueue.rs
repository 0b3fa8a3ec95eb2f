use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Display,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use opentelemetry::{
    global,
    metrics::{Counter, Meter},
    KeyValue,
};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    rate_limiter::{default_controller_rate_limiter, RateLimiter},
    utils::metric_name,
};

const WORKQUEUE: &'static str = "workqueue";

struct State<K> {
    /// Items ready to be handed out, in order.
    queue: VecDeque<K>,
    /// Items which need processing, either queued or waiting for the
    /// in-flight processing of the same item to finish.
    dirty: HashSet<K>,
    /// Items currently handed out to a worker.
    processing: HashSet<K>,
    /// Delayed items and when they become ready, one entry per item.
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    /// Cancels pending delay timers on shutdown.
    timers: CancellationToken,
    rate_limiter: Box<dyn RateLimiter<K>>,
    adds: Counter<u64>,
    retries: Counter<u64>,
}

/// Rate limited, deduplicating FIFO of keys.
///
/// A key is handed out to at most one worker at a time. Adding a key while it
/// is being processed marks it dirty and it is handed out again after
/// [`WorkQueue::done`] was called for it. Cloning yields another handle to the
/// same queue.
pub(crate) struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub fn new(name: &str, rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        let meter: Meter = global::meter(WORKQUEUE);
        let adds = meter
            .u64_counter(metric_name("workqueue_adds"))
            .with_description("Count of items added to the work queue")
            .build();
        let retries = meter
            .u64_counter(metric_name("workqueue_retries"))
            .with_description("Count of rate limited re-adds to the work queue")
            .build();
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: Mutex::new(State {
                    queue: Default::default(),
                    dirty: Default::default(),
                    processing: Default::default(),
                    waiting: Default::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                timers: CancellationToken::new(),
                rate_limiter,
                adds,
                retries,
            }),
        }
    }

    /// Queue using [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: &str) -> Self {
        Self::new(name, Box::new(default_controller_rate_limiter()))
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("name", self.shared.name.clone())]
    }

    pub fn add(&self, item: K) {
        {
            let mut state = self.state();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                // handed out again by `done`
                return;
            }
            state.queue.push_back(item);
        }
        self.shared.adds.add(1, &self.labels());
        self.shared.notify.notify_one();
    }

    /// Add `item` once `delay` has passed.
    ///
    /// An item waits at most once: if it is already waiting, the earlier of
    /// both ready times is kept, so a burst of adds is delivered once.
    pub fn add_after(&self, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            if matches!(state.waiting.get(&item), Some(waiting) if *waiting <= ready_at) {
                return;
            }
            state.waiting.insert(item.clone(), ready_at);
        }
        let queue = self.clone();
        let timers = self.shared.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = tokio::time::sleep_until(ready_at) => queue.release(item, ready_at),
            }
        });
    }

    /// Move `item` from waiting to the queue, unless the timer firing at
    /// `ready_at` was superseded by an earlier one.
    fn release(&self, item: K, ready_at: Instant) {
        let due = {
            let mut state = self.state();
            let due = state.waiting.get(&item) == Some(&ready_at);
            if due {
                state.waiting.remove(&item);
            }
            due
        };
        if due {
            self.add(item);
        }
    }

    /// Add `item` after the delay the rate limiter decides on.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.shared.rate_limiter.when(&item);
        if self.num_requeues(&item) > 1 {
            self.shared.retries.add(1, &self.labels());
        }
        trace!(
            "{}: adding {} after {:?}",
            self.shared.name,
            item,
            delay
        );
        self.add_after(item, delay);
    }

    /// Stop tracking the backoff history of `item`.
    pub fn forget(&self, item: &K) {
        self.shared.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.shared.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down,
    /// items still queued at that point are abandoned.
    ///
    /// Every item returned must be released with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so no wakeup is lost.
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        // pass the baton to another waiting worker
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed. If it was added again in the meantime it is
    /// queued again.
    pub fn done(&self, item: &K) {
        let requeued = {
            let mut state = self.state();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items. All blocked and future [`WorkQueue::get`]
    /// calls return `None`; items already handed out may still finish.
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.shared.timers.cancel();
        self.shared.notify.notify_waiters();
        debug!("{}: work queue shut down", self.shared.name);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
