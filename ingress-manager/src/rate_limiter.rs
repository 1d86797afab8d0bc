//! Requeue delay policies for the [`WorkQueue`](crate::work_queue::WorkQueue).

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;

/// Computes how long a key has to wait before it is added back to the queue.
pub(crate) trait RateLimiter: Send + Sync {
    /// Delay for the next requeue of `key`, recording the attempt.
    fn when(&self, key: &str) -> Duration;
    /// Stop tracking `key`, resetting its requeue count.
    fn forget(&self, key: &str);
    /// Number of times `key` was requeued since the last [`RateLimiter::forget`].
    fn num_requeues(&self, key: &str) -> u32;
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Per-key exponential backoff driven by the number of failures of that key.
pub(crate) struct ItemExponentialFailureRateLimiter {
    backoff: ExponentialBackoff,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff { base, max },
            failures: Default::default(),
        }
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        // A poisoned map still holds valid counters.
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures();
        let count = failures.entry(key.to_string()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        self.backoff.delay_for(attempt)
    }

    fn forget(&self, key: &str) {
        self.failures().remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures().get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys, limiting the overall requeue rate.
pub(crate) struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub(crate) fn new(qps: f64, burst: u32) -> Self {
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

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &str) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        // Reserve a token, going into debt if the bucket is empty.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Combines rate limiters, always using the longest delay.
pub(crate) struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub(crate) fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        // Every limiter has to observe the attempt, so no short-circuiting here.
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &str) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff from 5ms up to 1000s, combined with an overall
/// limit of 10 requeues per second (burst 100).
pub(crate) fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
