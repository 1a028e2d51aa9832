//! Keyed token-bucket rate limiting.
//!
//! The registry is a two-level structure: a concurrent map of scopes (one per
//! limiter installation, e.g. `global` or `route:/api/users`), each holding a
//! concurrent map of per-caller buckets behind their own mutex. The common
//! path touches only the shard read lock and the bucket mutex; bucket
//! creation double-checks under the shard write lock.
//!
//! Buckets refill lazily on access and are swept by a background task once
//! idle past [`BUCKET_MAX_AGE`]. Eviction is an intentional forgetting
//! window: an evicted key simply recreates with a full burst.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::KeyStrategy;
use crate::context::RequestContext;

/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Idle age past which a bucket is evicted.
pub const BUCKET_MAX_AGE: Duration = Duration::from_secs(600);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Buckets for a single scope, sharing one rate configuration.
struct ScopeLimiter {
    rps: f64,
    burst: f64,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl ScopeLimiter {
    fn new(rps: u32, burst: u32) -> Self {
        Self {
            rps: f64::from(rps),
            burst: f64::from(burst),
            buckets: DashMap::new(),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if let Some(bucket) = self.buckets.get(key) {
            return self.consume(&bucket);
        }
        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(entry) => self.consume(entry.get()),
            Entry::Vacant(entry) => {
                // First request consumes one token out of a full burst.
                entry.insert(Mutex::new(Bucket {
                    tokens: self.burst - 1.0,
                    last_refill: Instant::now(),
                }));
                true
            }
        }
    }

    fn consume(&self, bucket: &Mutex<Bucket>) -> bool {
        let mut bucket = bucket.lock();
        let now = Instant::now();
        // Monotonic clock; saturation clamps any negative elapsed to zero.
        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_millis() as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * self.rps / 1000.0).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn sweep(&self, cutoff: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.lock().last_refill > cutoff);
        before - self.buckets.len()
    }
}

/// Process-wide registry of token-bucket limiters keyed by scope.
pub struct LimiterRegistry {
    scopes: DashMap<String, Arc<ScopeLimiter>>,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
        }
    }

    /// Check the bucket for `(scope, key)`, creating scope and bucket on
    /// first access. Returns whether the request is admitted.
    pub fn allow(&self, scope: &str, rps: u32, burst: u32, key: &str) -> bool {
        let limiter = match self.scopes.get(scope) {
            Some(limiter) => Arc::clone(&limiter),
            None => Arc::clone(
                self.scopes
                    .entry(scope.to_string())
                    .or_insert_with(|| Arc::new(ScopeLimiter::new(rps, burst)))
                    .value(),
            ),
        };
        limiter.allow(key)
    }

    /// Drop buckets idle longer than `max_age` across all scopes.
    /// Returns the number of buckets removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(max_age) else {
            return 0;
        };
        let mut removed = 0;
        for scope in self.scopes.iter() {
            removed += scope.value().sweep(cutoff);
        }
        if removed > 0 {
            debug!(removed, "evicted idle rate-limit buckets");
        }
        removed
    }

    /// Total buckets currently tracked, across all scopes.
    pub fn tracked_buckets(&self) -> usize {
        self.scopes.iter().map(|s| s.value().buckets.len()).sum()
    }

    /// Spawn the periodic eviction task; stops when `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        registry.sweep(BUCKET_MAX_AGE);
                    }
                    _ = shutdown.cancelled() => {
                        debug!("rate-limit sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Resolve the bucket key for a request under the given strategy.
///
/// `user` falls back to the client address when the caller is anonymous.
pub fn bucket_key(strategy: KeyStrategy, ctx: &RequestContext) -> String {
    match strategy {
        KeyStrategy::Global => "global".to_string(),
        KeyStrategy::Ip => format!("ip:{}", ctx.client_addr.ip()),
        KeyStrategy::User => match ctx.subject() {
            Some(subject) => format!("user:{subject}"),
            None => format!("ip:{}", ctx.client_addr.ip()),
        },
    }
}
