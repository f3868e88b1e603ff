//! The cache capability consumed by every component.
//!
//! Sessions, rate limiting and the WebSocket bus never talk to Redis
//! directly; they take an `Arc<dyn CacheStore>`. Production wires
//! [`RedisCache`](crate::RedisCache) behind a [`BreakerCache`](crate::BreakerCache),
//! tests use [`InMemoryCache`](crate::InMemoryCache).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::breaker::BreakerState;
use crate::error::{CacheError, CacheResult};

/// JSON path addressing the whole document.
pub const ROOT_PATH: &str = ".";

/// A message received from a pub/sub subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
}

pub type PubSubStream = BoxStream<'static, PubSubMessage>;

/// One command of an atomic pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    SetJson {
        key: String,
        path: String,
        value: serde_json::Value,
    },
    Del {
        key: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

impl PipelineOp {
    pub fn key(&self) -> &str {
        match self {
            PipelineOp::Set { key, .. }
            | PipelineOp::SetJson { key, .. }
            | PipelineOp::Del { key }
            | PipelineOp::SAdd { key, .. }
            | PipelineOp::SRem { key, .. }
            | PipelineOp::Expire { key, .. } => key,
        }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Returns [`CacheError::NotFound`] when the key is missing.
    async fn get(&self, key: &str) -> CacheResult<String>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Set only if absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool>;

    /// Returns the number of keys removed.
    async fn del(&self, keys: &[String]) -> CacheResult<u64>;

    /// Values in key order; missing keys yield `None`.
    async fn batch_get(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// Returns [`CacheError::NotFound`] when the key or path is missing.
    async fn get_json(&self, path: &str, key: &str) -> CacheResult<serde_json::Value>;

    /// `path = "."` replaces the whole document.
    async fn set_json(
        &self,
        path: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> CacheResult<()>;

    async fn incr(&self, key: &str) -> CacheResult<i64>;

    /// Atomically increments `key` and sets its TTL. Returns the new count.
    async fn increase_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64>;

    /// Returns [`CacheError::NotFound`] when the field is missing.
    async fn hget(&self, key: &str, field: &str) -> CacheResult<String>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()>;

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    /// Returns whether the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> CacheResult<bool>;

    /// Returns whether the member was present.
    async fn srem(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// `None` for a key without expiry; [`CacheError::NotFound`] for a missing key.
    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Glob-style key listing (`*`, `?`).
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Runs every op as one MULTI/EXEC unit: all apply or none do.
    async fn exec_pipeline(&self, ops: Vec<PipelineOp>) -> CacheResult<()>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> CacheResult<()>;

    async fn subscribe(&self, channels: &[String]) -> CacheResult<PubSubStream>;

    async fn psubscribe(&self, patterns: &[String]) -> CacheResult<PubSubStream>;

    async fn ping(&self) -> CacheResult<()>;

    /// State of the guarding circuit breaker, if any.
    fn breaker_state(&self) -> Option<BreakerState> {
        None
    }

    /// Release held connections.
    fn close(&self) {}
}

/// Typed JSON helpers over any [`CacheStore`].
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    async fn get_typed<T>(&self, key: &str) -> CacheResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let value = self.get_json(ROOT_PATH, key).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn set_typed<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(value)?;
        self.set_json(ROOT_PATH, key, &value, ttl).await
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}

/// Glob matching with Redis `KEYS`/`PSUBSCRIBE` semantics for `*` and `?`.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = input.chars().collect();
    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((sp, ss)) = star {
            pi = sp + 1;
            si = ss + 1;
            star = Some((sp, ss + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

pub(crate) fn not_found_if_none<T>(key: &str, value: Option<T>) -> CacheResult<T> {
    value.ok_or_else(|| CacheError::not_found(key))
}
