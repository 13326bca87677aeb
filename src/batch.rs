//! Batch coordinator: groups jobs created in one bulk admission call and
//! computes aggregated progress on demand.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::queue::{BatchSlot, EnqueueOptions, Job, JobQueue, JobStatus, QueueError};
use crate::store::{keys, KvStore, StoreError};

/// Bulk admission accepts between 1 and this many prompts.
pub const MAX_BULK_PROMPTS: usize = 100;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("batch {0} not found")]
    NotFound(String),
    #[error("bulk size {0} out of range 1..={MAX_BULK_PROMPTS}")]
    InvalidSize(usize),
}

/// IDs handed back by one bulk admission.
#[derive(Debug, Clone)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub job_ids: Vec<String>,
}

/// Aggregated batch progress.
///
/// `total` counts enqueued members; the per-status counts cover members whose
/// records are still readable, so their sum can fall below `total` once TTL
/// eviction sets in.
#[derive(Debug)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total: usize,
    pub completed: usize,
    pub processing: usize,
    pub pending: usize,
    pub failed: usize,
    /// Members sorted by batch index, evicted ones absent.
    pub jobs: Vec<Job>,
}

/// Groups related jobs under a batch ID with a TTL-bounded membership set.
pub struct BatchCoordinator {
    store: Arc<dyn KvStore>,
    queue: Arc<JobQueue>,
    results_ttl_sec: u64,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn KvStore>, queue: Arc<JobQueue>, results_ttl_sec: u64) -> Self {
        Self {
            store,
            queue,
            results_ttl_sec,
        }
    }

    /// Enqueue every prompt as an ordinary job carrying its batch slot, then
    /// persist the membership set with the results TTL.
    pub async fn enqueue_bulk(
        &self,
        prompts: &[String],
        worker_hint: Option<usize>,
        priority: i64,
    ) -> Result<BatchReceipt, BatchError> {
        if prompts.is_empty() || prompts.len() > MAX_BULK_PROMPTS {
            return Err(BatchError::InvalidSize(prompts.len()));
        }

        let batch_id = mint_batch_id();
        let total = prompts.len();
        let mut job_ids = Vec::with_capacity(total);

        for (index, prompt) in prompts.iter().enumerate() {
            let job = self
                .queue
                .enqueue(
                    prompt,
                    EnqueueOptions {
                        worker_hint,
                        priority,
                        batch: Some(BatchSlot {
                            batch_id: batch_id.clone(),
                            index,
                            total,
                        }),
                    },
                )
                .await?;
            job_ids.push(job.id);
        }

        let set_key = keys::batch_jobs(&batch_id);
        for id in &job_ids {
            self.store.sadd(&set_key, id).await?;
        }
        self.store.expire(&set_key, self.results_ttl_sec).await?;

        debug!(%batch_id, count = total, "batch enqueued");
        Ok(BatchReceipt { batch_id, job_ids })
    }

    /// Aggregate status across the batch, tolerating evicted members.
    pub async fn status(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let members = self.store.smembers(&keys::batch_jobs(batch_id)).await?;
        if members.is_empty() {
            return Err(BatchError::NotFound(batch_id.to_string()));
        }

        let fetches = members.iter().map(|id| self.queue.get(id));
        let mut jobs: Vec<Job> = join_all(fetches)
            .await
            .into_iter()
            .filter_map(|fetched| match fetched {
                Ok(job) => job,
                Err(e) => {
                    debug!(%batch_id, error = %e, "skipping unreadable batch member");
                    None
                }
            })
            .collect();
        jobs.sort_by_key(|j| j.batch_index.unwrap_or(usize::MAX));

        let mut status = BatchStatus {
            batch_id: batch_id.to_string(),
            total: members.len(),
            completed: 0,
            processing: 0,
            pending: 0,
            failed: 0,
            jobs: Vec::new(),
        };
        for job in &jobs {
            match job.status {
                JobStatus::Completed => status.completed += 1,
                JobStatus::Processing => status.processing += 1,
                JobStatus::Pending => status.pending += 1,
                JobStatus::Failed => status.failed += 1,
            }
        }
        status.jobs = jobs;
        Ok(status)
    }
}

fn mint_batch_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("batch_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::queue::SearchResult;
    use crate::store::MemoryStore;

    fn coordinator() -> BatchCoordinator {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let settings = Settings::default();
        let queue = Arc::new(JobQueue::new(Arc::clone(&store), &settings));
        BatchCoordinator::new(store, queue, settings.job_results_ttl_sec)
    }

    fn prompts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn batch_ids_carry_prefix_and_random_suffix() {
        let a = mint_batch_id();
        let b = mint_batch_id();
        assert!(a.starts_with("batch_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn bulk_size_bounds_are_enforced() {
        let c = coordinator();
        assert!(matches!(
            c.enqueue_bulk(&[], None, 0).await.unwrap_err(),
            BatchError::InvalidSize(0)
        ));
        let oversized = vec!["p".to_string(); MAX_BULK_PROMPTS + 1];
        assert!(matches!(
            c.enqueue_bulk(&oversized, None, 0).await.unwrap_err(),
            BatchError::InvalidSize(101)
        ));
        let maximal = vec!["p".to_string(); MAX_BULK_PROMPTS];
        assert_eq!(
            c.enqueue_bulk(&maximal, None, 0).await.unwrap().job_ids.len(),
            MAX_BULK_PROMPTS
        );
    }

    #[tokio::test]
    async fn members_carry_their_batch_slot_in_order() {
        let c = coordinator();
        let receipt = c
            .enqueue_bulk(&prompts(&["a", "b", "c"]), Some(1), 0)
            .await
            .unwrap();
        assert_eq!(receipt.job_ids, vec!["1", "2", "3"]);

        let status = c.status(&receipt.batch_id).await.unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.pending, 3);
        let order: Vec<&str> = status.jobs.iter().map(|j| j.prompt.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(status.jobs[1].batch_index, Some(1));
        assert_eq!(status.jobs[1].batch_total, Some(3));
        assert_eq!(status.jobs[1].worker_hint, Some(1));
    }

    #[tokio::test]
    async fn aggregate_counts_follow_member_statuses() {
        let c = coordinator();
        let receipt = c
            .enqueue_bulk(&prompts(&["a", "b", "c"]), None, 0)
            .await
            .unwrap();

        // Drive one member to completed, one to failed.
        c.queue.reserve().await.unwrap().unwrap();
        c.queue
            .complete(
                &receipt.job_ids[0],
                SearchResult {
                    json: "{}".to_string(),
                    raw_text: None,
                    used_worker: 1,
                },
            )
            .await
            .unwrap();
        c.queue.reserve().await.unwrap().unwrap();
        c.queue.fail(&receipt.job_ids[1], "boom").await.unwrap();

        let status = c.status(&receipt.batch_id).await.unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 1);
        assert_eq!(status.processing, 0);
        assert_eq!(
            status.completed + status.processing + status.pending + status.failed,
            status.total
        );
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let c = coordinator();
        assert!(matches!(
            c.status("batch_0_zzzzzz").await.unwrap_err(),
            BatchError::NotFound(_)
        ));
    }
}
