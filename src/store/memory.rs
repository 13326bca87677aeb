//! In-process store backend for tests and redis-less development.
//!
//! Implements the same contract as the Redis backend, including lazy TTL
//! expiry. State is not persisted across restarts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::backend::{KvStore, StoreResult};

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    sets: HashMap<String, HashSet<String>>,
    expires: HashMap<String, Instant>,
}

impl Inner {
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(at) = self.expires.get(key) {
            if Instant::now() >= *at {
                self.expires.remove(key);
                self.strings.remove(key);
                self.lists.remove(key);
                self.zsets.remove(key);
                self.sets.remove(key);
            }
        }
    }

    fn key_exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.lists.contains_key(key)
            || self.zsets.contains_key(key)
            || self.sets.contains_key(key)
    }
}

/// In-memory key/value backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Redis-style inclusive range normalization with negative indices.
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.strings.insert(key.to_string(), value.to_string());
        inner.expires.remove(key);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.strings.insert(key.to_string(), value.to_string());
        inner
            .expires
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_sec));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_sec: u64) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_string());
        inner
            .expires
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_sec));
        Ok(true)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        let current: i64 = inner
            .strings
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        inner.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_sec: u64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        if inner.key_exists(key) {
            inner
                .expires
                .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_sec));
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = normalize_range(start, stop, list.len()) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok((before - list.len()) as u64)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.push((score, member.to_string()));
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<&(f64, String)> = zset
            .iter()
            .filter(|(s, _)| *s >= min && *s <= max)
            .collect();
        matching.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let take = if limit == 0 { matching.len() } else { limit };
        Ok(matching.into_iter().take(take).map(|(_, m)| m.clone()).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = zset.len();
        zset.retain(|(_, m)| m != member);
        Ok(zset.len() < before)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        inner.purge_if_expired(key);
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<u64> {
        Ok(0)
    }
}
