//! Fast-path accelerator cache (Redis).
//!
//! The teacher's own `aerolithdb-cache` crate is a bare `DashMap` with no
//! TTL or failure handling, which is not enough for a counter/rate-limit
//! accelerator that must fail open. This follows the connection-manager
//! pattern instead (grounded on the `redis` usage in
//! `harborgrid-justin-caddy`), wrapped in a process-wide circuit breaker
//! in the style of `aerolithdb_saas::usage_tracker`'s background-task
//! supervision: a small piece of shared atomic state, no external crate.
//!
//! Every call site goes through [`Cache::with_fallback`] so a cache
//! outage degrades to the store path instead of surfacing to callers as
//! an error. Nothing here is ever the source of truth.

use meterline_core::config::CacheConfig;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Cache {
    conn: Option<ConnectionManager>,
    breaker: Arc<Breaker>,
    op_timeout: Duration,
}

struct Breaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
}

impl Breaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }

    fn is_open(&self, now: Instant, epoch: Instant) -> bool {
        let opened = self.opened_at_millis.load(Ordering::Relaxed);
        if opened == 0 {
            return false;
        }
        let opened_at = epoch + Duration::from_millis(opened);
        if now.duration_since(opened_at) >= self.cooldown {
            // half-open: let the next call probe the backend again.
            self.opened_at_millis.store(0, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            false
        } else {
            true
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, now: Instant, epoch: Instant) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            let millis = now.duration_since(epoch).as_millis() as u64;
            self.opened_at_millis.store(millis.max(1), Ordering::Relaxed);
            warn!(failures, "fast-path cache circuit breaker opened");
        }
    }
}

impl Cache {
    pub async fn connect(url: &str, config: &CacheConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn: Some(conn),
            breaker: Arc::new(Breaker::new(config.circuit_breaker_threshold, config.circuit_breaker_cooldown())),
            op_timeout: config.op_timeout(),
        })
    }

    /// A cache-less instance: every call degrades straight to fallback.
    /// Used by tests and by operators who run without a cache tier.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            breaker: Arc::new(Breaker::new(u32::MAX, Duration::from_secs(1))),
            op_timeout: Duration::from_millis(100),
        }
    }

    fn epoch() -> Instant {
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        *EPOCH.get_or_init(Instant::now)
    }

    /// Whether the fast path is currently reachable: a connection was
    /// configured and the circuit breaker isn't open. Callers that must
    /// fail open rather than silently substitute a fallback value (e.g.
    /// admission control, §4.2) check this before running their own
    /// algorithm instead of going through [`Cache::with_fallback`].
    pub fn is_healthy(&self) -> bool {
        self.conn.is_some() && !self.breaker.is_open(Instant::now(), Self::epoch())
    }

    /// Run `fast` against the cache unless the breaker is open or no
    /// connection was configured; on timeout, error, or an open breaker,
    /// run `fallback` instead. This is the single chokepoint spec'd for
    /// every cache interaction — callers never touch `redis` directly.
    pub async fn with_fallback<T, Fast, FastFut, Fallback, FallbackFut>(
        &self,
        fast: Fast,
        fallback: Fallback,
    ) -> anyhow::Result<T>
    where
        Fast: FnOnce(ConnectionManager) -> FastFut,
        FastFut: Future<Output = redis::RedisResult<T>>,
        Fallback: FnOnce() -> FallbackFut,
        FallbackFut: Future<Output = anyhow::Result<T>>,
    {
        let epoch = Self::epoch();
        let now = Instant::now();

        let Some(conn) = self.conn.clone() else {
            return fallback().await;
        };
        if self.breaker.is_open(now, epoch) {
            debug!("cache circuit breaker open, using fallback");
            return fallback().await;
        }

        match tokio::time::timeout(self.op_timeout, fast(conn)).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                warn!(error = %err, "fast-path cache operation failed, using fallback");
                self.breaker.record_failure(Instant::now(), epoch);
                fallback().await
            }
            Err(_) => {
                warn!("fast-path cache operation timed out, using fallback");
                self.breaker.record_failure(Instant::now(), epoch);
                fallback().await
            }
        }
    }
}
