//! Durable job lifecycle: enqueue, reserve, complete/fail, scheduled retries,
//! stall detection, TTL-based removal, status and listing.
//!
//! All state lives behind the persistence adapter; the queue itself holds no
//! job state, so any number of runner tasks can share one instance.

pub mod job;
pub mod runner;

pub use job::{Job, JobProgress, JobStatus, SearchResult, PROMPT_MAX_CHARS};
pub use runner::QueueRunner;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::config::Settings;
use crate::store::{keys, KvStore, StoreError};

/// Base of the queue-level exponential backoff: `5 s * 2^(attempts-1)`.
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// A reservation untouched for this long is considered stalled.
const STALLED_AFTER: Duration = Duration::from_secs(30);

/// How many stall re-reservations a job survives before it fails.
const MAX_STALLED_COUNT: u32 = 10;

/// Page size cap for listing.
pub const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
}

/// Extra attributes attached at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub worker_hint: Option<usize>,
    pub priority: i64,
    pub batch: Option<BatchSlot>,
}

/// Position of a job inside its batch.
#[derive(Debug, Clone)]
pub struct BatchSlot {
    pub batch_id: String,
    pub index: usize,
    pub total: usize,
}

/// What the queue decided after a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeued; will be promoted back to waiting after the delay.
    Delayed(Duration),
    /// Attempt budget spent; the job is now failed.
    Failed,
}

/// One page of the job listing.
#[derive(Debug)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total_items: u64,
    pub items_per_page: usize,
    pub next_page_token: Option<String>,
}

/// Durable job queue over the persistence adapter.
pub struct JobQueue {
    store: Arc<dyn KvStore>,
    results_ttl_sec: u64,
    max_attempts: u32,
    max_backoff: Duration,
    job_lifetime_max: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KvStore>, settings: &Settings) -> Self {
        Self {
            store,
            results_ttl_sec: settings.job_results_ttl_sec,
            max_attempts: settings.retry.max_attempts,
            max_backoff: settings.retry.max_delay,
            job_lifetime_max: settings.job_lifetime_max,
        }
    }

    /// Validate, persist, and queue one prompt. Returns the created job.
    pub async fn enqueue(&self, prompt: &str, opts: EnqueueOptions) -> Result<Job, QueueError> {
        if prompt.is_empty() {
            return Err(QueueError::InvalidPrompt("prompt must not be empty".to_string()));
        }
        if prompt.chars().count() > PROMPT_MAX_CHARS {
            return Err(QueueError::InvalidPrompt(format!(
                "prompt exceeds {PROMPT_MAX_CHARS} characters"
            )));
        }

        let id = self.store.incr(keys::NEXT_JOB_ID).await?.to_string();
        let mut job = Job::new(id.clone(), prompt.to_string(), self.max_attempts);
        job.worker_hint = opts.worker_hint;
        job.priority = opts.priority;
        if let Some(slot) = opts.batch {
            job.batch_id = Some(slot.batch_id);
            job.batch_index = Some(slot.index);
            job.batch_total = Some(slot.total);
        }

        self.save(&job).await?;
        self.store.rpush(keys::JOBS_INDEX, &id).await?;
        self.store
            .zadd(keys::WAITING, &id, job.waiting_score())
            .await?;
        Ok(job)
    }

    /// Pop the next waiting job and mark it processing.
    ///
    /// The pop is optimistic: two runners may read the same head, and ZREM
    /// decides the winner. Returns `None` when the queue is drained.
    pub async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        loop {
            let head = self
                .store
                .zrangebyscore(keys::WAITING, f64::NEG_INFINITY, f64::INFINITY, 1)
                .await?;
            let Some(id) = head.into_iter().next() else {
                return Ok(None);
            };
            if !self.store.zrem(keys::WAITING, &id).await? {
                continue; // another runner won this pop
            }
            let Some(mut job) = self.load(&id).await? else {
                warn!(job_id = %id, "waiting entry pointed at an evicted job record");
                continue;
            };
            // Terminals are absorbing: drop any entry that slipped through.
            if job.status.is_terminal() {
                continue;
            }

            if self.lifetime_exceeded(&job) {
                job.mark_failed("job deadline exceeded");
                self.save(&job).await?;
                continue;
            }

            job.mark_processing();
            self.save(&job).await?;
            self.store.rpush(keys::ACTIVE, &id).await?;
            self.store
                .zadd(keys::STALLED, &id, Utc::now().timestamp_millis() as f64)
                .await?;
            return Ok(Some(job));
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.load(id).await
    }

    /// Store a progress snapshot (last-write-wins) and refresh the
    /// reservation heartbeat. Missing or non-processing jobs are ignored.
    pub async fn update_progress(&self, id: &str, progress: JobProgress) -> Result<(), QueueError> {
        let Some(mut job) = self.load(id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Processing {
            return Ok(());
        }
        job.progress = Some(progress);
        self.save(&job).await?;
        self.store
            .zadd(keys::STALLED, id, Utc::now().timestamp_millis() as f64)
            .await?;
        Ok(())
    }

    /// Terminal success: store the result and schedule removal by TTL.
    pub async fn complete(&self, id: &str, result: SearchResult) -> Result<(), QueueError> {
        let Some(mut job) = self.load(id).await? else {
            return Err(QueueError::NotFound(id.to_string()));
        };
        job.mark_completed(result);
        self.save(&job).await?;
        self.release_reservation(id).await
    }

    /// Terminal failure without spending further attempts.
    pub async fn fail(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let Some(mut job) = self.load(id).await? else {
            return Err(QueueError::NotFound(id.to_string()));
        };
        job.mark_failed(reason);
        self.save(&job).await?;
        self.release_reservation(id).await
    }

    /// Spend one attempt after a failed or timed-out dispatch.
    ///
    /// Either requeues with exponential backoff through the delayed set, or
    /// fails the job when the attempt budget is gone.
    pub async fn record_attempt_failure(
        &self,
        id: &str,
        error: &str,
    ) -> Result<RetryDecision, QueueError> {
        let Some(mut job) = self.load(id).await? else {
            return Err(QueueError::NotFound(id.to_string()));
        };
        job.attempts += 1;

        if job.attempts >= job.max_attempts {
            job.mark_failed(error);
            self.save(&job).await?;
            self.release_reservation(id).await?;
            return Ok(RetryDecision::Failed);
        }

        let delay = retry_backoff(job.attempts, self.max_backoff);
        job.mark_pending();
        self.save(&job).await?;
        self.release_reservation(id).await?;
        let promote_at = Utc::now().timestamp_millis() as f64 + delay.as_millis() as f64;
        self.store.zadd(keys::DELAYED, id, promote_at).await?;
        Ok(RetryDecision::Delayed(delay))
    }

    /// Move due delayed jobs back onto the waiting set.
    pub async fn promote_due_delayed(&self) -> Result<u64, QueueError> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let due = self
            .store
            .zrangebyscore(keys::DELAYED, f64::NEG_INFINITY, now_ms, 100)
            .await?;

        let mut promoted = 0;
        for id in due {
            if !self.store.zrem(keys::DELAYED, &id).await? {
                continue;
            }
            let Some(job) = self.load(&id).await? else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            self.store
                .zadd(keys::WAITING, &id, job.waiting_score())
                .await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Re-reserve or fail jobs whose reservation heartbeat went stale.
    pub async fn sweep_stalled(&self) -> Result<u64, QueueError> {
        let cutoff = Utc::now().timestamp_millis() as f64 - STALLED_AFTER.as_millis() as f64;
        let stale = self
            .store
            .zrangebyscore(keys::STALLED, f64::NEG_INFINITY, cutoff, 100)
            .await?;

        let mut swept = 0;
        for id in stale {
            if !self.store.zrem(keys::STALLED, &id).await? {
                continue;
            }
            self.store.lrem(keys::ACTIVE, &id).await?;
            let Some(mut job) = self.load(&id).await? else {
                continue;
            };
            if job.status != JobStatus::Processing {
                continue;
            }

            job.stalled_count += 1;
            if job.stalled_count > MAX_STALLED_COUNT {
                warn!(job_id = %id, stalls = job.stalled_count, "job exceeded stall budget");
                job.mark_failed("stalled");
                self.save(&job).await?;
            } else {
                warn!(job_id = %id, stalls = job.stalled_count, "re-queueing stalled job");
                job.mark_pending();
                self.save(&job).await?;
                self.store
                    .zadd(keys::WAITING, &id, job.waiting_score())
                    .await?;
            }
            swept += 1;
        }
        Ok(swept)
    }

    /// Slice of jobs ordered by creation time descending.
    ///
    /// The cursor is an opaque base64 offset; malformed cursors reset to the
    /// first page instead of erroring. TTL-evicted records are skipped.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        page_token: Option<&str>,
    ) -> Result<JobPage, QueueError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let offset = page_token.map(decode_cursor).unwrap_or(0);
        let total = self.store.llen(keys::JOBS_INDEX).await?;

        // The index list is oldest-to-newest; a descending page of `limit`
        // items starting `offset` from the newest end.
        let end = total as i64 - offset as i64 - 1;
        let mut items = Vec::new();
        if end >= 0 {
            let start = (end - limit as i64 + 1).max(0);
            let mut ids = self.store.lrange(keys::JOBS_INDEX, start, end).await?;
            ids.reverse();
            for id in ids {
                match self.load(&id).await? {
                    Some(job) if status.is_none_or(|s| job.status == s) => items.push(job),
                    _ => {}
                }
            }
        }

        let next_offset = offset + limit as u64;
        let next_page_token = (next_offset < total).then(|| encode_cursor(next_offset));
        Ok(JobPage {
            items,
            total_items: total,
            items_per_page: limit,
            next_page_token,
        })
    }

    fn lifetime_exceeded(&self, job: &Job) -> bool {
        match (Utc::now() - job.created_at).to_std() {
            Ok(age) => age > self.job_lifetime_max,
            Err(_) => false,
        }
    }

    async fn release_reservation(&self, id: &str) -> Result<(), QueueError> {
        self.store.zrem(keys::STALLED, id).await?;
        self.store.lrem(keys::ACTIVE, id).await?;
        self.store.zrem(keys::DELAYED, id).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let Some(raw) = self.store.get(&keys::job(id)).await? else {
            return Ok(None);
        };
        let job = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(job))
    }

    /// Terminal records carry the results TTL; live records persist until
    /// they reach a terminal state.
    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let raw = serde_json::to_string(job)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let key = keys::job(&job.id);
        if job.status.is_terminal() {
            self.store.set_ex(&key, &raw, self.results_ttl_sec).await?;
        } else {
            self.store.set(&key, &raw).await?;
        }
        Ok(())
    }
}

/// `5 s * 2^(attempts-1)`, capped.
fn retry_backoff(attempts: u32, cap: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    RETRY_BACKOFF_BASE.saturating_mul(1 << exp).min(cap)
}

pub(crate) fn encode_cursor(offset: u64) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(serde_json::json!({ "offset": offset }).to_string())
}

/// Malformed cursors reset to offset 0 rather than erroring.
pub(crate) fn decode_cursor(token: &str) -> u64 {
    base64::engine::general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .and_then(|v| v.get("offset").and_then(|o| o.as_u64()))
        .unwrap_or(0)
}
