//! Runner pool: reserves jobs and drives them through the dispatcher.
//!
//! One runner task per configured worker endpoint, so at most N dispatches
//! are in flight per process. A single background sweeper promotes delayed
//! retries and re-reserves stalled jobs.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::store::{keys, KvStore};

use super::job::{Job, SearchResult};
use super::{JobQueue, QueueError, RetryDecision};

/// Sleep while the waiting set is empty.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Drives reserved jobs to a terminal state.
pub struct QueueRunner {
    queue: Arc<JobQueue>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn KvStore>,
    concurrency: usize,
    search_job_timeout: Duration,
    sweep_interval: Duration,
    cache_ttl_sec: u64,
}

impl QueueRunner {
    pub fn new(
        queue: Arc<JobQueue>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn KvStore>,
        settings: &Settings,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            store,
            concurrency: settings.worker_count().max(1),
            search_job_timeout: settings.search_job_timeout,
            sweep_interval: settings.retry.health_check_interval,
            cache_ttl_sec: settings.cache_ttl_sec,
        }
    }

    /// Spawn the runner pool and the sweeper. Tasks run until process exit.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.concurrency + 1);
        for slot in 0..self.concurrency {
            let runner = Arc::clone(&self);
            handles.push(tokio::spawn(async move { runner.run_slot(slot).await }));
        }
        handles.push(tokio::spawn(async move { self.run_sweeper().await }));
        handles
    }

    async fn run_slot(&self, slot: usize) {
        loop {
            match self.queue.reserve().await {
                Ok(Some(job)) => {
                    debug!(slot, job_id = %job.id, "reserved job");
                    self.process_job(job).await;
                }
                Ok(None) => tokio::time::sleep(IDLE_POLL).await,
                Err(e) => {
                    warn!(slot, error = %e, "failed to reserve a job");
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }

    async fn run_sweeper(&self) {
        let mut tick = tokio::time::interval(self.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match self.queue.promote_due_delayed().await {
                Ok(promoted) if promoted > 0 => {
                    debug!(promoted, "promoted delayed jobs back to waiting")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "delayed promotion failed"),
            }
            match self.queue.sweep_stalled().await {
                Ok(swept) if swept > 0 => info!(swept, "swept stalled reservations"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stall sweep failed"),
            }
        }
    }

    /// One attempt: dispatch under the per-job deadline, then let the queue
    /// decide between completion, a delayed retry, and terminal failure.
    async fn process_job(&self, job: Job) {
        if let Some(cached) = self.cached_result(&job.prompt).await {
            debug!(job_id = %job.id, "serving result from prompt cache");
            self.finish(&job, Ok(cached)).await;
            return;
        }

        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let forwarder = {
            let queue = Arc::clone(&self.queue);
            let job_id = job.id.clone();
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    if let Err(e) = queue.update_progress(&job_id, progress).await {
                        debug!(job_id = %job_id, error = %e, "progress update dropped");
                    }
                }
            })
        };

        let dispatched = timeout(
            self.search_job_timeout,
            self.dispatcher
                .dispatch(&job.prompt, job.worker_hint, Some(&progress_tx)),
        )
        .await;
        drop(progress_tx);
        let _ = forwarder.await;

        match dispatched {
            Ok(outcome) => self.finish(&job, outcome).await,
            Err(_) => {
                let reason = format!(
                    "dispatch timed out after {} ms",
                    self.search_job_timeout.as_millis()
                );
                self.spend_attempt(&job, &reason).await;
            }
        }
    }

    async fn finish(&self, job: &Job, outcome: Result<SearchResult, DispatchError>) {
        match outcome {
            Ok(result) => {
                self.cache_result(&job.prompt, &result).await;
                info!(job_id = %job.id, worker = result.used_worker, "job completed");
                if let Err(e) = self.queue.complete(&job.id, result).await {
                    warn!(job_id = %job.id, error = %e, "failed to store completion");
                }
            }
            // Post-admission validation failures are not retryable.
            Err(DispatchError::InvalidArgument(message)) => {
                warn!(job_id = %job.id, %message, "dispatch rejected job input");
                if let Err(e) = self.queue.fail(&job.id, &message).await {
                    warn!(job_id = %job.id, error = %e, "failed to store failure");
                }
            }
            Err(exhausted @ DispatchError::Exhausted { .. }) => {
                self.spend_attempt(job, &exhausted.to_string()).await;
            }
        }
    }

    async fn spend_attempt(&self, job: &Job, reason: &str) {
        match self.queue.record_attempt_failure(&job.id, reason).await {
            Ok(RetryDecision::Delayed(delay)) => {
                info!(job_id = %job.id, delay_ms = delay.as_millis() as u64, %reason, "attempt failed, retrying with backoff");
            }
            Ok(RetryDecision::Failed) => {
                warn!(job_id = %job.id, %reason, "job failed after exhausting attempts");
            }
            Err(QueueError::NotFound(_)) => {
                debug!(job_id = %job.id, "job record evicted before retry bookkeeping");
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "retry bookkeeping failed"),
        }
    }

    async fn cached_result(&self, prompt: &str) -> Option<SearchResult> {
        let key = keys::result_cache(&prompt_hash(prompt));
        let raw = self.store.get(&key).await.ok()??;
        serde_json::from_str(&raw).ok()
    }

    /// Empty results are not cached; a later attempt may do better.
    async fn cache_result(&self, prompt: &str, result: &SearchResult) {
        if result.json.is_empty() {
            return;
        }
        let key = keys::result_cache(&prompt_hash(prompt));
        if let Ok(raw) = serde_json::to_string(result) {
            if let Err(e) = self.store.set_ex(&key, &raw, self.cache_ttl_sec).await {
                debug!(error = %e, "result cache write failed");
            }
        }
    }
}

fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn prompt_hash_is_stable_and_distinct() {
        assert_eq!(prompt_hash("hello"), prompt_hash("hello"));
        assert_ne!(prompt_hash("hello"), prompt_hash("hello "));
        assert_eq!(prompt_hash("x").len(), 64);
    }

    #[tokio::test]
    async fn cache_round_trips_and_skips_empty_results() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let settings = Settings {
            worker_base_urls: vec!["http://w1".to_string()],
            ..Settings::default()
        };
        let queue = Arc::new(JobQueue::new(Arc::clone(&store), &settings));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(crate::worker::WorkerClient::new(
                &settings.worker_base_urls,
                settings.worker_timeouts.clone(),
            )),
            settings.retry.clone(),
            settings.dispatch_mode,
        ));
        let runner = QueueRunner::new(queue, dispatcher, store, &settings);

        let hit = SearchResult {
            json: "{\"a\":1}".to_string(),
            raw_text: None,
            used_worker: 1,
        };
        runner.cache_result("prompt", &hit).await;
        assert_eq!(runner.cached_result("prompt").await, Some(hit));
        assert_eq!(runner.cached_result("other prompt").await, None);

        let empty = SearchResult {
            json: String::new(),
            raw_text: Some("nothing".to_string()),
            used_worker: 1,
        };
        runner.cache_result("empty prompt", &empty).await;
        assert_eq!(runner.cached_result("empty prompt").await, None);
    }
}
