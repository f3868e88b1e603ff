//! Redis-backed [`CacheStore`] over a `deadpool-redis` pool.
//!
//! JSON documents use the RedisJSON module (`JSON.SET` / `JSON.GET`).
//! Pub/sub streams run on a dedicated client connection per subscription,
//! outside the pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde_json::Value;

use crate::config::RedisConfig;
use crate::error::{CacheError, CacheResult};
use crate::scripts::{INCR_WITH_EXPIRY, ScriptBackend, ScriptLoader};
use crate::store::{CacheStore, PipelineOp, PubSubMessage, PubSubStream};

pub struct RedisCache {
    pool: Pool,
    url: String,
    scripts: ScriptLoader,
    connect_timeout: Duration,
}

impl RedisCache {
    /// Build the pool, ping once, warm `min_idle` connections and load scripts.
    ///
    /// Any failure aborts startup.
    pub async fn connect(config: &RedisConfig) -> CacheResult<Self> {
        tracing::info!(url = %config.url, "connecting to Redis");

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let pool_config = redis_config
            .pool
            .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(config.connect_timeout);
        pool_config.timeouts.create = Some(config.connect_timeout);
        pool_config.timeouts.recycle = Some(config.command_timeout());

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Configuration(e.to_string()))?;

        let cache = Self {
            pool,
            url: config.url.clone(),
            scripts: ScriptLoader::embedded(),
            connect_timeout: config.connect_timeout,
        };

        tokio::time::timeout(config.connect_timeout, cache.ping())
            .await
            .map_err(|_| CacheError::timeout("initial PING"))??;

        cache.warm_up(config.min_idle.min(config.pool_size)).await;
        cache.scripts.load_all(&cache).await?;

        tracing::info!(url = %config.url, "connected to Redis");
        Ok(cache)
    }

    /// Open up to `count` connections so the first requests don't pay for dialing.
    async fn warm_up(&self, count: usize) {
        let mut held = Vec::with_capacity(count);
        for _ in 0..count {
            match self.pool.get().await {
                Ok(conn) => held.push(conn),
                Err(e) => {
                    tracing::warn!(error = %e, opened = held.len(), "Redis pool warm-up stopped early");
                    break;
                }
            }
        }
        tracing::debug!(connections = held.len(), "Redis pool warmed up");
    }

    pub fn scripts(&self) -> &ScriptLoader {
        &self.scripts
    }

    async fn conn(&self) -> CacheResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    async fn pubsub(&self) -> CacheResult<redis::aio::PubSub> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| CacheError::Configuration(e.to_string()))?;
        tokio::time::timeout(self.connect_timeout, client.get_async_pubsub())
            .await
            .map_err(|_| CacheError::timeout("pubsub connect"))?
            .map_err(CacheError::from)
    }
}

fn into_stream(pubsub: redis::aio::PubSub) -> PubSubStream {
    pubsub
        .into_on_message()
        .map(|msg| PubSubMessage {
            channel: msg.get_channel_name().to_string(),
            pattern: msg
                .from_pattern()
                .then(|| msg.get_pattern::<String>().ok())
                .flatten(),
            payload: msg.get_payload_bytes().to_vec(),
        })
        .boxed()
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl ScriptBackend for RedisCache {
    async fn script_load(&self, source: &str) -> CacheResult<String> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await?)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> CacheResult<redis::Value> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await?)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<String> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(v) => {
                tracing::debug!(key = %key, "cache hit");
                Ok(v)
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                Err(CacheError::not_found(key))
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.del(keys).await?)
    }

    async fn batch_get(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        Ok(redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?)
    }

    async fn get_json(&self, path: &str, key: &str) -> CacheResult<Value> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("JSON.GET")
            .arg(key)
            .arg(path)
            .query_async(&mut conn)
            .await?;
        let raw = raw.ok_or_else(|| CacheError::not_found(key))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn set_json(
        &self,
        path: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let payload = serde_json::to_string(value)?;
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("JSON.SET")
            .arg(key)
            .arg(path)
            .arg(payload)
            .ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.incr(key, 1).await?)
    }

    async fn increase_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let reply = self
            .scripts
            .exec(
                self,
                INCR_WITH_EXPIRY,
                &[key.to_string()],
                &[ttl_millis(ttl).to_string()],
            )
            .await?;
        Ok(redis::from_redis_value(&reply)?)
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<String> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        value.ok_or_else(|| CacheError::not_found(format!("{key}#{field}")))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.conn().await?;
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        match millis {
            -2 => Err(CacheError::not_found(key)),
            -1 => Ok(None),
            ms => Ok(Some(Duration::from_millis(ms.max(0) as u64))),
        }
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.keys(pattern).await?)
    }

    async fn exec_pipeline(&self, ops: Vec<PipelineOp>) -> CacheResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                PipelineOp::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(ttl_millis(ttl));
                    }
                    cmd.ignore();
                }
                PipelineOp::SetJson { key, path, value } => {
                    pipe.cmd("JSON.SET")
                        .arg(key)
                        .arg(path)
                        .arg(serde_json::to_string(&value)?)
                        .ignore();
                }
                PipelineOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                PipelineOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                PipelineOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                PipelineOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
                }
            }
        }
        let mut conn = self.conn().await?;
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> CacheResult<PubSubStream> {
        let mut pubsub = self.pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        tracing::info!(channels = ?channels, "subscribed to Redis channels");
        Ok(into_stream(pubsub))
    }

    async fn psubscribe(&self, patterns: &[String]) -> CacheResult<PubSubStream> {
        let mut pubsub = self.pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }
        tracing::info!(patterns = ?patterns, "subscribed to Redis patterns");
        Ok(into_stream(pubsub))
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(CacheError::Command(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    fn close(&self) {
        self.pool.close();
        tracing::info!("Redis pool closed");
    }
}
