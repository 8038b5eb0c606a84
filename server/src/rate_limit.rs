//! Per-client rate limiting using the token bucket algorithm.
//!
//! Each client identity (see [`crate::identity`]) gets its own token bucket,
//! created lazily on first contact and dropped by a periodic sweep once the
//! identity has been quiet for longer than the retention window. This keeps
//! memory bounded under a churn of short-lived identities, which is what
//! IP-derived keys look like behind rotating proxies.
//!
//! # Algorithm
//!
//! - Each identity has a bucket that holds up to `capacity` tokens (the burst)
//! - Tokens are added continuously at `rate` tokens per second
//! - Each admitted request consumes one token
//! - If no token is available the request is denied with a retry hint
//!
//! # Locking
//!
//! The registry sits behind a single reader/writer lock. Lookups of existing
//! identities share the read lock; creating an entry or sweeping takes the
//! write lock. Every entry carries its own mutex so that refill-and-consume
//! is atomic per identity: two simultaneous requests can never both take the
//! last token.
//!
//! # Example
//!
//! ```rust
//! use askbox_server::rate_limit::RateLimiter;
//!
//! // 5 questions per hour, bursts of up to 3
//! let limiter = RateLimiter::per_hour(5, 3);
//!
//! assert!(limiter.admit("203.0.113.7"));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How often the eviction sweep runs by default (1 hour).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// How long an identity may stay idle before it is evicted (1 hour).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The request is allowed to proceed.
    Allowed,

    /// The request is rate limited.
    ///
    /// The client should wait for the specified number of seconds
    /// before retrying. This value is returned in the `Retry-After`
    /// HTTP header.
    Limited {
        /// Number of seconds until the client can retry.
        retry_after_secs: u64,
    },
}

impl RateLimitResult {
    /// Returns `true` if the request is allowed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns `true` if the request is rate limited.
    #[inline]
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Returns the retry-after duration if rate limited, or `None` if allowed.
    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// A token bucket for a single client identity.
///
/// The bucket starts full, refills at a constant rate and never holds more
/// than its capacity.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current number of tokens in the bucket.
    tokens: f64,

    /// Time of the last token refill.
    last_refill: Instant,

    /// Maximum number of tokens the bucket can hold.
    capacity: u32,

    /// Rate at which tokens are added (tokens per second).
    rate: f64,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Arguments
    ///
    /// * `rate` - Number of tokens added per second
    /// * `capacity` - Maximum number of tokens the bucket can hold
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self::new_at(rate, capacity, Instant::now())
    }

    fn new_at(rate: f64, capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
            capacity,
            rate,
        }
    }

    /// Attempts to consume a token from the bucket.
    ///
    /// Refills tokens for the time elapsed since the previous check, then
    /// takes one token if at least one is available.
    pub fn try_consume(&mut self) -> RateLimitResult {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> RateLimitResult {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitResult::Allowed;
        }

        let retry_after_secs = if self.rate > 0.0 {
            let seconds_until_token = (1.0 - self.tokens) / self.rate;
            (seconds_until_token.ceil() as u64).max(1)
        } else {
            u64::MAX
        };

        RateLimitResult::Limited { retry_after_secs }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_secs = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed_secs * self.rate).min(f64::from(self.capacity));
        self.last_refill = now;
    }

    /// Returns the current number of tokens (for testing/debugging).
    #[cfg(test)]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Registry entry: the bucket plus the last time the identity was seen.
#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    last_seen: Instant,
}

impl LimiterState {
    /// Touches `last_seen` whatever the outcome, so a client that keeps
    /// probing while denied is never evicted.
    fn check(&mut self, now: Instant) -> RateLimitResult {
        self.last_seen = now;
        self.bucket.try_consume_at(now)
    }
}

/// Thread-safe rate limiter with per-identity buckets.
///
/// Cloning is cheap: all clones share the same registry.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

#[derive(Debug)]
struct RateLimiterInner {
    /// Per-identity limiter state.
    entries: RwLock<HashMap<String, Mutex<LimiterState>>>,

    /// Token replenishment rate (tokens per second).
    rate: f64,

    /// Maximum bucket capacity (burst size).
    capacity: u32,

    /// Idle time after which an identity is evicted.
    retention: Duration,
}

impl RateLimiter {
    /// Creates a rate limiter with the default retention window.
    ///
    /// # Arguments
    ///
    /// * `rate` - Number of tokens added per second per identity
    /// * `capacity` - Maximum tokens per identity (burst capacity)
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self::with_retention(rate, capacity, DEFAULT_RETENTION)
    }

    /// Creates a rate limiter with an explicit retention window.
    pub fn with_retention(rate: f64, capacity: u32, retention: Duration) -> Self {
        debug!(rate, capacity, retention_secs = retention.as_secs(), "Created rate limiter");
        Self {
            inner: Arc::new(RateLimiterInner {
                entries: RwLock::new(HashMap::new()),
                rate,
                capacity,
                retention,
            }),
        }
    }

    /// Creates a rate limiter from an hourly allowance.
    ///
    /// The refill rate is `requests_per_hour / 3600` tokens per second.
    ///
    /// ```rust
    /// use askbox_server::rate_limit::RateLimiter;
    ///
    /// let limiter = RateLimiter::per_hour(1, 2);
    /// assert!(limiter.admit("1.2.3.4"));
    /// assert!(limiter.admit("1.2.3.4"));
    /// assert!(!limiter.admit("1.2.3.4"));
    /// ```
    pub fn per_hour(requests_per_hour: u32, burst: u32) -> Self {
        Self::new(f64::from(requests_per_hour) / SECONDS_PER_HOUR, burst)
    }

    /// Returns `true` if a request from `identity` may proceed.
    ///
    /// Denial is the only failure mode; this never errors.
    pub fn admit(&self, identity: &str) -> bool {
        self.check(identity).is_allowed()
    }

    /// Checks `identity` against its bucket and returns a retry hint on denial.
    pub fn check(&self, identity: &str) -> RateLimitResult {
        let now = Instant::now();

        {
            let entries = self.read_entries();
            if let Some(state) = entries.get(identity) {
                return state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .check(now);
            }
        }

        let mut entries = self.write_entries();
        // Another request for the same identity may have raced us to the write lock.
        let state = entries.entry(identity.to_owned()).or_insert_with(|| {
            trace!(identity = %identity, "Tracking new client identity");
            Mutex::new(LimiterState {
                bucket: TokenBucket::new_at(self.inner.rate, self.inner.capacity, now),
                last_seen: now,
            })
        });

        state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .check(now)
    }

    /// Removes every identity idle for longer than the retention window.
    ///
    /// Returns the number of entries removed.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_older_than(self.inner.retention)
    }

    /// Removes every identity idle for longer than `retention`.
    pub fn evict_idle_older_than(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.write_entries();
        let initial_count = entries.len();

        entries.retain(|_, state| {
            let state = state.get_mut().unwrap_or_else(PoisonError::into_inner);
            now.saturating_duration_since(state.last_seen) <= retention
        });

        initial_count - entries.len()
    }

    /// Returns the number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.read_entries().len()
    }

    /// Returns `true` if `identity` currently has limiter state.
    pub fn is_tracked(&self, identity: &str) -> bool {
        self.read_entries().contains_key(identity)
    }

    /// Burst capacity shared by every identity.
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Spawns the background eviction sweep.
    ///
    /// Every `cleanup_interval` the task drops identities idle for longer
    /// than the retention window. Abort the returned handle to stop it.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                let removed = limiter.evict_idle();
                if removed > 0 {
                    debug!(
                        removed_count = removed,
                        remaining = limiter.tracked_identities(),
                        "Evicted idle rate limit entries"
                    );
                }
            }
        })
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, Mutex<LimiterState>>> {
        self.inner.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, Mutex<LimiterState>>> {
        self.inner.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_limit() {
        let limiter = RateLimiter::new(10.0, 10);

        for i in 0..10 {
            assert!(limiter.admit("10.0.0.1"), "Request {} should be allowed", i + 1);
        }
    }

    #[test]
    fn blocks_requests_over_limit() {
        let limiter = RateLimiter::new(0.001, 5);

        for _ in 0..5 {
            assert!(limiter.admit("10.0.0.1"));
        }

        assert!(!limiter.admit("10.0.0.1"));
    }

    #[test]
    fn hourly_rate_gives_hour_scale_retry_hint() {
        let limiter = RateLimiter::per_hour(1, 1);

        assert!(limiter.check("10.0.0.1").is_allowed());

        let result = limiter.check("10.0.0.1");
        let retry_after = result.retry_after().expect("second request should be limited");
        assert!(
            (3590..=3600).contains(&retry_after),
            "expected roughly an hour, got {retry_after}"
        );
    }

    #[test]
    fn zero_rate_never_refills() {
        let limiter = RateLimiter::new(0.0, 1);

        assert!(limiter.admit("10.0.0.1"));
        assert_eq!(
            limiter.check("10.0.0.1"),
            RateLimitResult::Limited {
                retry_after_secs: u64::MAX
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(10.0, 2);

        assert!(limiter.admit("10.0.0.1"));
        assert!(limiter.admit("10.0.0.1"));
        assert!(!limiter.admit("10.0.0.1"));

        // 100ms = 1 token at 10 tokens/sec
        tokio::time::advance(Duration::from_millis(100)).await;

        assert!(limiter.admit("10.0.0.1"), "Should have refilled one token");
        assert!(!limiter.admit("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_capacity_respected() {
        let limiter = RateLimiter::new(1000.0, 5);
        assert!(limiter.admit("warmup"));

        tokio::time::advance(Duration::from_secs(60)).await;

        for i in 0..5 {
            assert!(limiter.admit("capped"), "Request {} should be allowed", i + 1);
        }
        assert!(!limiter.admit("capped"));
    }

    #[test]
    fn independent_identity_tracking() {
        let limiter = RateLimiter::new(0.001, 2);

        limiter.admit("10.0.0.1");
        limiter.admit("10.0.0.1");
        assert!(!limiter.admit("10.0.0.1"));

        assert!(limiter.admit("10.0.0.2"), "10.0.0.2 should have its own bucket");
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_idle_entries() {
        let limiter = RateLimiter::with_retention(1.0, 10, Duration::from_secs(3600));

        limiter.admit("a");
        limiter.admit("b");
        limiter.admit("c");
        assert_eq!(limiter.tracked_identities(), 3);

        tokio::time::advance(Duration::from_secs(3601)).await;

        assert_eq!(limiter.evict_idle(), 3);
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_exactly_at_retention_is_kept() {
        let limiter = RateLimiter::with_retention(1.0, 10, Duration::from_secs(3600));
        limiter.admit("a");

        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(limiter.evict_idle(), 0);
        assert!(limiter.is_tracked("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_identity_is_not_evicted_while_probing() {
        let limiter = RateLimiter::with_retention(0.0, 1, Duration::from_secs(600));

        assert!(limiter.admit("prober"));
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(300)).await;
            assert!(!limiter.admit("prober"));
            assert_eq!(limiter.evict_idle(), 0);
        }

        assert!(limiter.is_tracked("prober"));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_recent_entries() {
        let limiter = RateLimiter::new(10.0, 10);
        limiter.admit("recent");

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(limiter.evict_idle(), 0);
        assert_eq!(limiter.tracked_identities(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_sweeps_on_schedule() {
        let limiter = RateLimiter::with_retention(1.0, 1, Duration::from_secs(1800));
        let handle = limiter.spawn_cleanup_task(Duration::from_secs(3600));

        limiter.admit("short-lived");
        assert!(limiter.is_tracked("short-lived"));

        // Auto-advance runs the sweep scheduled at the one hour mark.
        tokio::time::sleep(Duration::from_secs(3601)).await;

        assert!(!limiter.is_tracked("short-lived"));
        handle.abort();
    }

    #[test]
    fn concurrent_checks_never_overspend_tokens() {
        let limiter = RateLimiter::new(0.0, 5);
        let admitted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        if limiter.admit("same-client") {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.into_inner(), 5);
    }

    #[test]
    fn cloneable_and_shareable() {
        let limiter = RateLimiter::new(0.001, 5);
        let limiter_clone = limiter.clone();

        for _ in 0..5 {
            limiter.admit("shared");
        }

        assert!(!limiter_clone.admit("shared"));
    }

    #[test]
    fn rate_limit_result_helpers() {
        let allowed = RateLimitResult::Allowed;
        assert!(allowed.is_allowed());
        assert!(!allowed.is_limited());
        assert_eq!(allowed.retry_after(), None);

        let limited = RateLimitResult::Limited {
            retry_after_secs: 5,
        };
        assert!(!limited.is_allowed());
        assert!(limited.is_limited());
        assert_eq!(limited.retry_after(), Some(5));
    }

    #[test]
    fn token_bucket_starts_full() {
        let bucket = TokenBucket::new(100.0, 50);
        assert_eq!(bucket.tokens(), 50.0);
    }

    #[test]
    fn token_bucket_consumes_tokens() {
        let mut bucket = TokenBucket::new(100.0, 10);

        assert!(bucket.try_consume().is_allowed());
        assert!((bucket.tokens() - 9.0).abs() < 0.1);
    }
}
