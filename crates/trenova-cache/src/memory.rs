//! In-process [`CacheStore`] double.
//!
//! Honours TTLs, atomic pipelines, glob key listing and pattern pub/sub so
//! session, rate-limit and bus behaviour can be exercised without Redis.
//! Several components sharing one `Arc<InMemoryCache>` behave like several
//! nodes sharing one Redis. [`InMemoryCache::set_offline`] simulates an
//! outage: every call fails with [`CacheError::Connection`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{CacheError, CacheResult};
use crate::store::{
    CacheStore, PipelineOp, PubSubMessage, PubSubStream, glob_match, not_found_if_none,
};

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Json(Value),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Keyspace = HashMap<String, Entry>;

pub struct InMemoryCache {
    keyspace: Mutex<Keyspace>,
    bus: broadcast::Sender<(String, Vec<u8>)>,
    offline: AtomicBool,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            keyspace: Mutex::new(HashMap::new()),
            bus,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> CacheResult<()> {
        if self.is_offline() {
            return Err(CacheError::Connection("cache offline".to_string()));
        }
        Ok(())
    }

    fn stream(&self, filters: Vec<String>, pattern: bool) -> PubSubStream {
        BroadcastStream::new(self.bus.subscribe())
            .filter_map(move |item| {
                let message = item.ok().and_then(|(channel, payload)| {
                    let matched = filters.iter().find(|f| {
                        if pattern {
                            glob_match(f, &channel)
                        } else {
                            **f == channel
                        }
                    })?;
                    Some(PubSubMessage {
                        pattern: pattern.then(|| matched.clone()),
                        channel,
                        payload,
                    })
                });
                futures_util::future::ready(message)
            })
            .boxed()
    }
}

fn live<'a>(keyspace: &'a mut Keyspace, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if keyspace.get(key).is_some_and(|e| e.is_expired(now)) {
        keyspace.remove(key);
    }
    keyspace.get_mut(key)
}

fn wrong_type() -> CacheError {
    CacheError::Command(WRONG_TYPE.to_string())
}

fn path_segments(path: &str) -> Vec<&str> {
    path.trim_start_matches('$')
        .split('.')
        .filter(|s| !s.is_empty())
        .collect()
}

fn json_at<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path_segments(path)
        .into_iter()
        .try_fold(doc, |node, segment| node.get(segment))
}

fn json_set_at(doc: &mut Value, path: &str, value: Value) -> CacheResult<()> {
    let segments = path_segments(path);
    let Some((last, parents)) = segments.split_last() else {
        *doc = value;
        return Ok(());
    };
    let mut node = doc;
    for segment in parents {
        node = node
            .get_mut(*segment)
            .ok_or_else(|| CacheError::Command(format!("ERR path {path} does not exist")))?;
    }
    let object = node
        .as_object_mut()
        .ok_or_else(|| CacheError::Command(format!("ERR path {path} is not an object")))?;
    object.insert((*last).to_string(), value);
    Ok(())
}

fn apply_set(keyspace: &mut Keyspace, key: &str, value: &str, ttl: Option<Duration>) {
    keyspace.insert(
        key.to_string(),
        Entry {
            data: Data::Str(value.to_string()),
            expires_at: ttl.map(|t| Instant::now() + t),
        },
    );
}

fn apply_set_json(
    keyspace: &mut Keyspace,
    path: &str,
    key: &str,
    value: Value,
    ttl: Option<Duration>,
) -> CacheResult<()> {
    match live(keyspace, key) {
        Some(entry) => {
            let Data::Json(doc) = &mut entry.data else {
                return Err(wrong_type());
            };
            json_set_at(doc, path, value)?;
            if let Some(ttl) = ttl {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        None => {
            if !path_segments(path).is_empty() {
                return Err(CacheError::Command(
                    "ERR new objects must be created at the root".to_string(),
                ));
            }
            let mut entry = Entry::new(Data::Json(value));
            entry.expires_at = ttl.map(|t| Instant::now() + t);
            keyspace.insert(key.to_string(), entry);
        }
    }
    Ok(())
}

fn set_mut<'a>(keyspace: &'a mut Keyspace, key: &str) -> CacheResult<&'a mut HashSet<String>> {
    if live(keyspace, key).is_none() {
        keyspace.insert(key.to_string(), Entry::new(Data::Set(HashSet::new())));
    }
    match keyspace.get_mut(key).map(|e| &mut e.data) {
        Some(Data::Set(set)) => Ok(set),
        _ => Err(wrong_type()),
    }
}

fn apply_sadd(keyspace: &mut Keyspace, key: &str, member: &str) -> CacheResult<bool> {
    Ok(set_mut(keyspace, key)?.insert(member.to_string()))
}

fn apply_srem(keyspace: &mut Keyspace, key: &str, member: &str) -> CacheResult<bool> {
    let Some(entry) = live(keyspace, key) else {
        return Ok(false);
    };
    let Data::Set(set) = &mut entry.data else {
        return Err(wrong_type());
    };
    let removed = set.remove(member);
    if set.is_empty() {
        keyspace.remove(key);
    }
    Ok(removed)
}

fn apply_expire(keyspace: &mut Keyspace, key: &str, ttl: Duration) -> bool {
    match live(keyspace, key) {
        Some(entry) => {
            entry.expires_at = Some(Instant::now() + ttl);
            true
        }
        None => false,
    }
}

fn apply_incr<'a>(keyspace: &'a mut Keyspace, key: &str) -> CacheResult<(i64, &'a mut Entry)> {
    if live(keyspace, key).is_none() {
        keyspace.insert(key.to_string(), Entry::new(Data::Str("0".to_string())));
    }
    let entry = keyspace
        .get_mut(key)
        .ok_or_else(|| CacheError::not_found(key))?;
    let Data::Str(raw) = &mut entry.data else {
        return Err(wrong_type());
    };
    let next = raw
        .parse::<i64>()
        .map_err(|_| CacheError::Command("ERR value is not an integer".to_string()))?
        .checked_add(1)
        .ok_or_else(|| CacheError::Command("ERR increment would overflow".to_string()))?;
    *raw = next.to_string();
    Ok((next, entry))
}

fn apply_op(keyspace: &mut Keyspace, op: PipelineOp) -> CacheResult<()> {
    match op {
        PipelineOp::Set { key, value, ttl } => apply_set(keyspace, &key, &value, ttl),
        PipelineOp::SetJson { key, path, value } => {
            apply_set_json(keyspace, &path, &key, value, None)?
        }
        PipelineOp::Del { key } => {
            keyspace.remove(&key);
        }
        PipelineOp::SAdd { key, member } => {
            apply_sadd(keyspace, &key, &member)?;
        }
        PipelineOp::SRem { key, member } => {
            apply_srem(keyspace, &key, &member)?;
        }
        PipelineOp::Expire { key, ttl } => {
            apply_expire(keyspace, &key, ttl);
        }
    }
    Ok(())
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<String> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        match live(&mut keyspace, key).map(|e| &e.data) {
            Some(Data::Str(value)) => Ok(value.clone()),
            Some(_) => Err(wrong_type()),
            None => Err(CacheError::not_found(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check_online()?;
        apply_set(&mut self.keyspace.lock(), key, value, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        if live(&mut keyspace, key).is_some() {
            return Ok(false);
        }
        apply_set(&mut keyspace, key, value, ttl);
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        let mut removed = 0;
        for key in keys {
            if live(&mut keyspace, key).is_some() {
                keyspace.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn batch_get(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        Ok(keys
            .iter()
            .map(|key| match live(&mut keyspace, key).map(|e| &e.data) {
                Some(Data::Str(value)) => Some(value.clone()),
                _ => None,
            })
            .collect())
    }

    async fn get_json(&self, path: &str, key: &str) -> CacheResult<Value> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        match live(&mut keyspace, key).map(|e| &e.data) {
            Some(Data::Json(doc)) => not_found_if_none(key, json_at(doc, path).cloned()),
            Some(_) => Err(wrong_type()),
            None => Err(CacheError::not_found(key)),
        }
    }

    async fn set_json(
        &self,
        path: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.check_online()?;
        apply_set_json(&mut self.keyspace.lock(), path, key, value.clone(), ttl)
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        apply_incr(&mut keyspace, key).map(|(count, _)| count)
    }

    async fn increase_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        let (count, entry) = apply_incr(&mut keyspace, key)?;
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(count)
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<String> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        match live(&mut keyspace, key).map(|e| &e.data) {
            Some(Data::Hash(hash)) => not_found_if_none(field, hash.get(field).cloned()),
            Some(_) => Err(wrong_type()),
            None => Err(CacheError::not_found(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        if live(&mut keyspace, key).is_none() {
            keyspace.insert(key.to_string(), Entry::new(Data::Hash(HashMap::new())));
        }
        match keyspace.get_mut(key).map(|e| &mut e.data) {
            Some(Data::Hash(hash)) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type()),
        }
    }

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        match live(&mut keyspace, key).map(|e| &e.data) {
            Some(Data::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type()),
            None => Ok(HashMap::new()),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.check_online()?;
        apply_sadd(&mut self.keyspace.lock(), key, member)
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.check_online()?;
        apply_srem(&mut self.keyspace.lock(), key, member)
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        match live(&mut keyspace, key).map(|e| &e.data) {
            Some(Data::Set(set)) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type()),
            None => Ok(Vec::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.check_online()?;
        Ok(apply_expire(&mut self.keyspace.lock(), key, ttl))
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        let entry = not_found_if_none(key, live(&mut keyspace, key))?;
        Ok(entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check_online()?;
        Ok(live(&mut self.keyspace.lock(), key).is_some())
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace.retain(|_, entry| !entry.is_expired(now));
        let mut keys: Vec<String> = keyspace
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exec_pipeline(&self, ops: Vec<PipelineOp>) -> CacheResult<()> {
        self.check_online()?;
        let mut keyspace = self.keyspace.lock();
        let mut staged = keyspace.clone();
        for op in ops {
            apply_op(&mut staged, op)?;
        }
        *keyspace = staged;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> CacheResult<()> {
        self.check_online()?;
        // no subscribers is not an error
        let _ = self.bus.send((channel.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> CacheResult<PubSubStream> {
        self.check_online()?;
        Ok(self.stream(channels.to_vec(), false))
    }

    async fn psubscribe(&self, patterns: &[String]) -> CacheResult<PubSubStream> {
        self.check_online()?;
        Ok(self.stream(patterns.to_vec(), true))
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check_online()
    }
}
