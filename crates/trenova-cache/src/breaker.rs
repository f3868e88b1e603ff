//! Three-state circuit breaker and the [`CacheStore`] decorator that applies it.
//!
//! State lives in atomics and every transition is a compare-and-swap, so the
//! breaker is shared by all callers without a lock.
//!
//! ```text
//!            failures >= threshold (within window)
//!   Closed ───────────────────────────────────────▶ Open
//!     ▲                                              │
//!     │ probe succeeds              reset_timeout    │
//!     │                             elapsed          ▼
//!     └────────────────────────────────────────── HalfOpen
//!                     probe fails ──▶ Open
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{BreakerConfig, RedisConfig};
use crate::error::{CacheError, CacheResult};
use crate::store::{CacheStore, PipelineOp, PubSubStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    /// Calls flow through; failures are counted.
    Closed = 0,
    /// Calls fail fast with [`CacheError::BreakerOpen`].
    Open = 1,
    /// A single probe call is allowed through.
    HalfOpen = 2,
}

impl BreakerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    window_started_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(BreakerState::Closed as u8),
            failures: AtomicU32::new(0),
            window_started_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn elapsed_since(&self, stamp_ms: u64) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(stamp_ms))
    }

    /// Current state. An Open breaker whose reset timeout has elapsed moves
    /// to HalfOpen here.
    pub fn state(&self) -> BreakerState {
        let current = BreakerState::from_u8(self.state.load(Ordering::Acquire));
        if current != BreakerState::Open {
            return current;
        }
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        if self.elapsed_since(opened_at) < self.config.reset_timeout {
            return BreakerState::Open;
        }
        match self.state.compare_exchange(
            BreakerState::Open as u8,
            BreakerState::HalfOpen as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::info!("circuit breaker half-open, allowing probe");
                BreakerState::HalfOpen
            }
            Err(actual) => BreakerState::from_u8(actual),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Admit a call or reject it with [`CacheError::BreakerOpen`].
    pub fn try_acquire(&self) -> CacheResult<Permit<'_>> {
        match self.state() {
            BreakerState::Closed => Ok(Permit::new(self, false)),
            BreakerState::Open => Err(CacheError::BreakerOpen),
            BreakerState::HalfOpen => self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| Permit::new(self, true))
                .map_err(|_| CacheError::BreakerOpen),
        }
    }

    fn record_success(&self, probe: bool) {
        if !probe {
            return;
        }
        self.failures.store(0, Ordering::Release);
        self.state
            .store(BreakerState::Closed as u8, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        tracing::info!("circuit breaker closed");
    }

    fn record_failure(&self, probe: bool) {
        let now = self.now_ms();
        if probe {
            self.opened_at_ms.store(now, Ordering::Release);
            self.state.store(BreakerState::Open as u8, Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
            tracing::warn!("circuit breaker probe failed, reopening");
            return;
        }
        if BreakerState::from_u8(self.state.load(Ordering::Acquire)) != BreakerState::Closed {
            return;
        }

        let window_started = self.window_started_ms.load(Ordering::Acquire);
        let window_ms = self.config.window.as_millis() as u64;
        if now.saturating_sub(window_started) > window_ms
            && self
                .window_started_ms
                .compare_exchange(window_started, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.failures.store(0, Ordering::Release);
        }

        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.config.failure_threshold {
            return;
        }
        self.opened_at_ms.store(now, Ordering::Release);
        if self
            .state
            .compare_exchange(
                BreakerState::Closed as u8,
                BreakerState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            tracing::warn!(
                failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }
}

/// Admission ticket for one guarded call.
///
/// Dropping an unsettled probe permit (the caller was cancelled) releases
/// the probe slot so the next caller can try.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Guards every call of an inner [`CacheStore`] with a [`CircuitBreaker`]
/// and a per-call deadline: the read timeout for queries, the write timeout
/// for mutations.
///
/// Only outage-class failures (connection errors, timeouts) count against
/// the breaker; `NotFound` and command errors prove the server is reachable.
pub struct BreakerCache<C> {
    inner: C,
    breaker: CircuitBreaker,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<C: CacheStore> BreakerCache<C> {
    /// Uses the default Redis read and write timeouts.
    pub fn new(inner: C, config: BreakerConfig) -> Self {
        let defaults = RedisConfig::default();
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
            read_timeout: defaults.read_timeout,
            write_timeout: defaults.write_timeout,
        }
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn read<T, F>(&self, operation: &'static str, call: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>> + Send,
    {
        self.guard(operation, self.read_timeout, call).await
    }

    async fn write<T, F>(&self, operation: &'static str, call: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>> + Send,
    {
        self.guard(operation, self.write_timeout, call).await
    }

    async fn guard<T, F>(
        &self,
        operation: &'static str,
        deadline: Duration,
        call: F,
    ) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>> + Send,
    {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                tracing::debug!(operation, "cache call rejected by circuit breaker");
                return Err(err);
            }
        };

        let result = tokio::time::timeout(deadline, call)
            .await
            .unwrap_or_else(|_| Err(CacheError::timeout(operation)));

        match &result {
            Err(err) if err.trips_breaker() => {
                tracing::warn!(
                    operation,
                    error = %err,
                    failures = self.breaker.failures() + 1,
                    "cache call failed"
                );
                permit.failure();
            }
            _ => permit.success(),
        }
        result
    }
}

#[async_trait]
impl<C: CacheStore> CacheStore for BreakerCache<C> {
    async fn get(&self, key: &str) -> CacheResult<String> {
        self.read("GET", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.write("SET", self.inner.set(key, value, ttl)).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        self.write("SETNX", self.inner.set_nx(key, value, ttl))
            .await
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.write("DEL", self.inner.del(keys)).await
    }

    async fn batch_get(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        self.read("MGET", self.inner.batch_get(keys)).await
    }

    async fn get_json(&self, path: &str, key: &str) -> CacheResult<Value> {
        self.read("JSON.GET", self.inner.get_json(path, key)).await
    }

    async fn set_json(
        &self,
        path: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.write("JSON.SET", self.inner.set_json(path, key, value, ttl))
            .await
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.write("INCR", self.inner.incr(key)).await
    }

    async fn increase_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        self.write("INCR_WITH_EXPIRY", self.inner.increase_with_expiry(key, ttl))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<String> {
        self.read("HGET", self.inner.hget(key, field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.write("HSET", self.inner.hset(key, field, value)).await
    }

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        self.read("HGETALL", self.inner.hget_all(key)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.write("SADD", self.inner.sadd(key, member)).await
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.write("SREM", self.inner.srem(key, member)).await
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        self.read("SMEMBERS", self.inner.smembers(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.write("EXPIRE", self.inner.expire(key, ttl)).await
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.read("PTTL", self.inner.ttl(key)).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.read("EXISTS", self.inner.exists(key)).await
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.read("KEYS", self.inner.keys(pattern)).await
    }

    async fn exec_pipeline(&self, ops: Vec<PipelineOp>) -> CacheResult<()> {
        self.write("EXEC", self.inner.exec_pipeline(ops)).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> CacheResult<()> {
        self.write("PUBLISH", self.inner.publish(channel, payload))
            .await
    }

    async fn subscribe(&self, channels: &[String]) -> CacheResult<PubSubStream> {
        self.read("SUBSCRIBE", self.inner.subscribe(channels)).await
    }

    async fn psubscribe(&self, patterns: &[String]) -> CacheResult<PubSubStream> {
        self.read("PSUBSCRIBE", self.inner.psubscribe(patterns))
            .await
    }

    async fn ping(&self) -> CacheResult<()> {
        self.read("PING", self.inner.ping()).await
    }

    fn breaker_state(&self) -> Option<BreakerState> {
        Some(self.breaker.state())
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCache;
    use std::sync::Arc;

    fn config(threshold: u32, reset: Duration) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(60),
            reset_timeout: reset,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(10)));
        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().unwrap_err().is_breaker_open());
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let mut cfg = config(2, Duration::from_secs(10));
        cfg.window = Duration::from_millis(20);
        let breaker = CircuitBreaker::new(cfg);
        breaker.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(40));
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failures(), 1);
    }

    #[test]
    fn half_open_allows_single_probe() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(20)));
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert!(breaker.try_acquire().unwrap_err().is_breaker_open());

        probe.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(20)));
        breaker.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(40));
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn dropped_probe_releases_slot() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(20)));
        breaker.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(40));
        drop(breaker.try_acquire().unwrap());
        assert!(breaker.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn concurrent_failures_open_exactly_once() {
        let breaker = Arc::new(CircuitBreaker::new(config(5, Duration::from_secs(10))));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if let Ok(permit) = breaker.try_acquire() {
                            permit.failure();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn decorator_trips_on_outage_and_recovers() {
        let cache = BreakerCache::new(InMemoryCache::new(), config(2, Duration::from_millis(30)));
        cache.set("k", "v", None).await.unwrap();

        cache.inner().set_offline(true);
        for _ in 0..2 {
            assert!(matches!(
                cache.get("k").await.unwrap_err(),
                CacheError::Connection(_)
            ));
        }
        assert!(cache.get("k").await.unwrap_err().is_breaker_open());

        cache.inner().set_offline(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.breaker().state(), BreakerState::HalfOpen);
        assert_eq!(cache.get("k").await.unwrap(), "v");
        assert_eq!(cache.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn not_found_does_not_count_as_failure() {
        let cache = BreakerCache::new(InMemoryCache::new(), config(1, Duration::from_secs(10)));
        for _ in 0..3 {
            assert!(cache.get("missing").await.unwrap_err().is_not_found());
        }
        assert_eq!(cache.breaker().state(), BreakerState::Closed);
    }

    struct Stalled;

    #[async_trait]
    impl CacheStore for Stalled {
        async fn get(&self, _key: &str) -> CacheResult<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> CacheResult<()> {
            Ok(())
        }
        async fn set_nx(&self, _: &str, _: &str, _: Option<Duration>) -> CacheResult<bool> {
            Ok(true)
        }
        async fn del(&self, _: &[String]) -> CacheResult<u64> {
            Ok(0)
        }
        async fn batch_get(&self, _: &[String]) -> CacheResult<Vec<Option<String>>> {
            Ok(Vec::new())
        }
        async fn get_json(&self, _: &str, key: &str) -> CacheResult<Value> {
            Err(CacheError::not_found(key))
        }
        async fn set_json(&self, _: &str, _: &str, _: &Value, _: Option<Duration>) -> CacheResult<()> {
            Ok(())
        }
        async fn incr(&self, _: &str) -> CacheResult<i64> {
            Ok(1)
        }
        async fn increase_with_expiry(&self, _: &str, _: Duration) -> CacheResult<i64> {
            Ok(1)
        }
        async fn hget(&self, _: &str, field: &str) -> CacheResult<String> {
            Err(CacheError::not_found(field))
        }
        async fn hset(&self, _: &str, _: &str, _: &str) -> CacheResult<()> {
            Ok(())
        }
        async fn hget_all(&self, _: &str) -> CacheResult<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn sadd(&self, _: &str, _: &str) -> CacheResult<bool> {
            Ok(true)
        }
        async fn srem(&self, _: &str, _: &str) -> CacheResult<bool> {
            Ok(true)
        }
        async fn smembers(&self, _: &str) -> CacheResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn expire(&self, _: &str, _: Duration) -> CacheResult<bool> {
            Ok(true)
        }
        async fn ttl(&self, _: &str) -> CacheResult<Option<Duration>> {
            Ok(None)
        }
        async fn exists(&self, _: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn keys(&self, _: &str) -> CacheResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn exec_pipeline(&self, _: Vec<PipelineOp>) -> CacheResult<()> {
            Ok(())
        }
        async fn publish(&self, _: &str, _: &[u8]) -> CacheResult<()> {
            Ok(())
        }
        async fn subscribe(&self, _: &[String]) -> CacheResult<PubSubStream> {
            Err(CacheError::Command("unsupported".into()))
        }
        async fn psubscribe(&self, _: &[String]) -> CacheResult<PubSubStream> {
            Err(CacheError::Command("unsupported".into()))
        }
        async fn ping(&self) -> CacheResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_count_as_failures() {
        let cache = BreakerCache::new(Stalled, config(1, Duration::from_secs(10)))
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
        assert_eq!(cache.breaker().state(), BreakerState::Open);
    }

    #[test]
    fn deadlines_default_to_redis_timeouts() {
        let cache = BreakerCache::new(InMemoryCache::new(), BreakerConfig::default());
        assert_eq!(cache.read_timeout(), Duration::from_secs(3));
        assert_eq!(cache.write_timeout(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn reads_use_the_read_deadline() {
        let cache = BreakerCache::new(Stalled, config(5, Duration::from_secs(10)))
            .with_timeouts(Duration::from_millis(50), Duration::from_secs(30));
        let started = Instant::now();
        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
