//! Admission: the single gate in front of enqueue and bulk enqueue.
//!
//! When the client supplies an idempotency key, a previous admission within
//! the TTL window is returned as-is instead of creating new state. The
//! mapping is persisted only after the job(s) exist; two concurrent
//! first-time uses of one key may therefore both create jobs (at-least-once,
//! best-effort idempotency).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::batch::{BatchCoordinator, BatchError, BatchReceipt};
use crate::queue::{EnqueueOptions, JobQueue, QueueError};
use crate::store::{keys, KvStore, StoreError};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stored value for a bulk idempotency hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRecord {
    #[serde(rename = "batchId")]
    pub batch_id: String,
    #[serde(rename = "jobIds")]
    pub job_ids: Vec<String>,
}

impl From<BatchReceipt> for BulkRecord {
    fn from(receipt: BatchReceipt) -> Self {
        Self {
            batch_id: receipt.batch_id,
            job_ids: receipt.job_ids,
        }
    }
}

/// Front door for job creation, holding the queue, the batch coordinator, and
/// the idempotency cache.
pub struct Admission {
    queue: Arc<JobQueue>,
    batches: Arc<BatchCoordinator>,
    store: Arc<dyn KvStore>,
    ttl_sec: u64,
}

impl Admission {
    pub fn new(
        queue: Arc<JobQueue>,
        batches: Arc<BatchCoordinator>,
        store: Arc<dyn KvStore>,
        ttl_sec: u64,
    ) -> Self {
        Self {
            queue,
            batches,
            store,
            ttl_sec,
        }
    }

    /// Admit one prompt; returns the job ID (possibly a cached one).
    pub async fn submit(
        &self,
        prompt: &str,
        worker_hint: Option<usize>,
        priority: i64,
        idempotency_key: Option<&str>,
    ) -> Result<String, AdmissionError> {
        if let Some(key) = idempotency_key {
            if let Some(job_id) = self.store.get(&keys::idempotency(key)).await? {
                debug!(%job_id, "idempotency hit for single enqueue");
                return Ok(job_id);
            }
        }

        let job = self
            .queue
            .enqueue(
                prompt,
                EnqueueOptions {
                    worker_hint,
                    priority,
                    batch: None,
                },
            )
            .await?;

        if let Some(key) = idempotency_key {
            self.store
                .set_nx_ex(&keys::idempotency(key), &job.id, self.ttl_sec)
                .await?;
        }
        Ok(job.id)
    }

    /// Admit a batch of prompts; returns batch and job IDs (possibly cached).
    pub async fn submit_bulk(
        &self,
        prompts: &[String],
        worker_hint: Option<usize>,
        priority: i64,
        idempotency_key: Option<&str>,
    ) -> Result<BulkRecord, AdmissionError> {
        if let Some(key) = idempotency_key {
            if let Some(raw) = self.store.get(&keys::idempotency_bulk(key)).await? {
                if let Ok(record) = serde_json::from_str::<BulkRecord>(&raw) {
                    debug!(batch_id = %record.batch_id, "idempotency hit for bulk enqueue");
                    return Ok(record);
                }
            }
        }

        let receipt = self
            .batches
            .enqueue_bulk(prompts, worker_hint, priority)
            .await?;
        let record = BulkRecord::from(receipt);

        if let Some(key) = idempotency_key {
            let raw = serde_json::to_string(&record)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.store
                .set_nx_ex(&keys::idempotency_bulk(key), &raw, self.ttl_sec)
                .await?;
        }
        Ok(record)
    }
}
