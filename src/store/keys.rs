//! Key layout shared by the queue, batch coordinator, and idempotency cache.

/// Sorted set of waiting job IDs, scored by priority then enqueue order.
pub const WAITING: &str = "waiting";

/// List of job IDs currently reserved by a runner.
pub const ACTIVE: &str = "active";

/// Sorted set of reserved job IDs scored by last-touch epoch-ms; doubles as
/// the reservation heartbeat for stall detection.
pub const STALLED: &str = "stalled";

/// Sorted set of job IDs awaiting a backoff retry, scored by promote-at
/// epoch-ms.
pub const DELAYED: &str = "delayed";

/// List of all job IDs in creation order; backs `GET /jobs` listing.
pub const JOBS_INDEX: &str = "jobs:index";

/// Atomic counter behind monotonic job IDs.
pub const NEXT_JOB_ID: &str = "jobs:next-id";

pub fn job(id: &str) -> String {
    format!("job:{id}")
}

pub fn batch_jobs(batch_id: &str) -> String {
    format!("batch:{batch_id}:jobs")
}

pub fn idempotency(client_key: &str) -> String {
    format!("idempotency:{client_key}")
}

pub fn idempotency_bulk(client_key: &str) -> String {
    format!("idempotency:bulk:{client_key}")
}

pub fn result_cache(prompt_hash: &str) -> String {
    format!("cache:{prompt_hash}")
}
