//! Shared cache tier for sessions, login throttling and cross-node fan-out.
//!
//! ## Layers
//!
//! ```text
//! Arc<dyn CacheStore>
//!   └─ BreakerCache      circuit breaker + per-call deadline
//!        └─ RedisCache   deadpool-redis pool, RedisJSON, Lua scripts, pub/sub
//! ```
//!
//! [`InMemoryCache`] implements the same capability for tests.

pub mod breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod scripts;
pub mod store;

use std::sync::Arc;

pub use breaker::{BreakerCache, BreakerState, CircuitBreaker};
pub use client::RedisCache;
pub use config::{BreakerConfig, RedisConfig};
pub use error::{CacheError, CacheResult};
pub use memory::InMemoryCache;
pub use scripts::{ScriptBackend, ScriptLoader};
pub use store::{CacheStore, CacheStoreExt, PipelineOp, PubSubMessage, PubSubStream, ROOT_PATH};

/// Connect to Redis and wrap the client in a circuit breaker.
///
/// Fails if the initial ping does not succeed.
pub async fn connect(
    redis: &RedisConfig,
    breaker: &BreakerConfig,
) -> CacheResult<Arc<dyn CacheStore>> {
    let client = RedisCache::connect(redis).await?;
    Ok(Arc::new(
        BreakerCache::new(client, breaker.clone())
            .with_timeouts(redis.read_timeout, redis.write_timeout),
    ))
}
