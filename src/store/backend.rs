//! Pluggable key/value backend trait.

use async_trait::async_trait;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from key/value store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store operation failed: {0}")]
    Operation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Contract over the durable key/value substrate.
///
/// Every operation is single-op atomic and safe for concurrent callers; the
/// only compound atomic is [`set_nx_ex`](KvStore::set_nx_ex) (set-if-absent
/// with TTL attached in the same step), which backs idempotency records.
#[async_trait]
pub trait KvStore: Send + Sync {
    // Strings
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> StoreResult<()>;
    /// Set only if absent, atomically attaching a TTL. Returns whether the
    /// value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_sec: u64) -> StoreResult<bool>;
    /// Atomic increment; creates the key at 0 first. Backs monotonic job IDs.
    async fn incr(&self, key: &str) -> StoreResult<i64>;
    /// Attach a TTL to an existing key of any type.
    async fn expire(&self, key: &str, ttl_sec: u64) -> StoreResult<()>;

    // Lists
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;
    /// Inclusive range with Redis semantics (negative indices from the tail).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;
    async fn llen(&self, key: &str) -> StoreResult<u64>;
    /// Remove all occurrences of `value`; returns how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64>;

    // Sorted sets
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    /// Members with `min <= score <= max`, ascending, at most `limit`
    /// (0 = unlimited).
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>>;
    /// Returns whether the member was present.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Round-trip the backend; returns the latency in milliseconds.
    async fn ping(&self) -> StoreResult<u64>;
}
