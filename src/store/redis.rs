//! Redis store backend on a multiplexed async connection.

use std::time::Instant;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use super::backend::{KvStore, StoreError, StoreResult};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Operation(e.to_string())
        }
    }
}

/// Redis-backed key/value store.
///
/// The multiplexed connection is a cheap handle; every operation clones it,
/// so the store is safe to share across runner tasks.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { connection })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn fmt_score(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> StoreResult<()> {
        let _: () = self.conn().set_ex(key, value, ttl_sec).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_sec: u64) -> StoreResult<bool> {
        // SET key value NX EX ttl: replies OK when written, nil when present.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        Ok(self.conn().incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl_sec: u64) -> StoreResult<()> {
        let _: bool = self.conn().expire(key, ttl_sec as i64).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        Ok(self.conn().rpush(key, value).await?)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.conn().lpop(key, None).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        Ok(self.conn().lrange(key, start as isize, stop as isize).await?)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        Ok(self.conn().llen(key).await?)
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        Ok(self.conn().lrem(key, 0, value).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let _: () = self.conn().zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(fmt_score(min)).arg(fmt_score(max));
        if limit > 0 {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        Ok(cmd.query_async(&mut self.conn()).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = self.conn().zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let _: () = self.conn().sadd(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn ping(&self) -> StoreResult<u64> {
        let started = Instant::now();
        let _: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        Ok(started.elapsed().as_millis() as u64)
    }
}
