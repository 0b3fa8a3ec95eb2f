use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

/// Decides how long an item has to wait before it is (re-)added to a work queue.
pub(crate) trait RateLimiter<K>: Send + Sync {
    /// Delay for the next add of `item`, recording the attempt.
    fn when(&self, item: &K) -> Duration;
    /// Clear the history of `item`, the next delay starts from scratch.
    fn forget(&self, item: &K);
    /// How often `item` has been requeued since it was last forgotten.
    fn num_requeues(&self, item: &K) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per item exponential backoff: `base_delay * 2^failures`, capped at `max_delay`.
pub(crate) struct ItemExponentialFailureRateLimiter<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Default::default(),
        }
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Clone + Eq + Hash + Send,
{
    fn when(&self, item: &K) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };
        let backoff = self.base_delay.as_secs_f64() * 2f64.powi(exp.min(1024) as i32);
        if backoff >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(backoff)
        }
    }

    fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all items, `qps` tokens per second with
/// room for `burst` tokens.
pub(crate) struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        // Reserve a token, the deficit is paid back by waiting.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines several rate limiters, the longest delay wins.
pub(crate) struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        // Every limiter has to observe the attempt.
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &K) {
        self.limiters.iter().for_each(|l| l.forget(item));
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per item exponential backoff from 5ms up to 1000s, combined with an
/// overall limit of 10 qps and a burst of 100.
pub(crate) fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
