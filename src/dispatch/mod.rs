//! Worker selection and retry: the heart of the service.
//!
//! One dispatch finds a free worker, issues a search, classifies the outcome,
//! and retries across workers until it has a terminal result or its attempt
//! budget is spent. The dispatcher is stateless; any number of dispatches may
//! run concurrently and race for the same workers (the loser of such a race
//! observes `busy` and re-loops).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DispatchMode, RetryConfig};
use crate::queue::{JobProgress, SearchResult, PROMPT_MAX_CHARS};
use crate::worker::{SearchOutcome, WorkerClient};

/// Sleep between selection rounds when no worker is free (circuit-breaker
/// mode). Health re-probing throttles naturally, so no backoff here; the
/// job-retry layer owns backoff.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Budget multiplier: a dispatch may loop `max_attempts * 10` times before it
/// gives up.
const ATTEMPT_BUDGET_FACTOR: u32 = 10;

/// Every this many consecutive no-free-worker rounds, log progress.
const WAIT_LOG_EVERY: u32 = 10;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no worker produced a result after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Stateless worker-pool dispatcher.
pub struct Dispatcher {
    workers: Arc<WorkerClient>,
    retry: RetryConfig,
    mode: DispatchMode,
}

impl Dispatcher {
    pub fn new(workers: Arc<WorkerClient>, retry: RetryConfig, mode: DispatchMode) -> Self {
        Self {
            workers,
            retry,
            mode,
        }
    }

    /// Dispatch one prompt to exactly one worker.
    ///
    /// Never returns partial success: the only failure modes are
    /// [`DispatchError::InvalidArgument`] and [`DispatchError::Exhausted`].
    /// Progress snapshots go out over `progress` best-effort; a full or
    /// closed channel drops them.
    pub async fn dispatch(
        &self,
        prompt: &str,
        worker_hint: Option<usize>,
        progress: Option<&mpsc::Sender<JobProgress>>,
    ) -> Result<SearchResult, DispatchError> {
        let worker_count = self.workers.worker_count();

        if prompt.is_empty() {
            return Err(DispatchError::InvalidArgument("empty prompt".to_string()));
        }
        if prompt.chars().count() > PROMPT_MAX_CHARS {
            return Err(DispatchError::InvalidArgument(format!(
                "prompt exceeds {PROMPT_MAX_CHARS} characters"
            )));
        }
        if let Some(hint) = worker_hint {
            if hint == 0 || hint > worker_count {
                return Err(DispatchError::InvalidArgument(format!(
                    "worker hint {hint} out of range 1..={worker_count}"
                )));
            }
        }

        // Workers that answered `blocked` within this dispatch; skipped during
        // selection so failover reaches the rest of the pool.
        let mut blocked_workers: HashSet<usize> = HashSet::new();

        // The hint is advisory: one attempt when its worker looks free, then
        // dynamic selection without preference.
        if let Some(hint) = worker_hint {
            let health = self.workers.health(hint).await;
            if health.is_free() {
                send_progress(progress, "searching", Some(hint)).await;
                match self.workers.search(hint, prompt).await {
                    SearchOutcome::Success { json, raw_text } => {
                        return Ok(SearchResult {
                            json,
                            raw_text,
                            used_worker: hint,
                        })
                    }
                    SearchOutcome::Empty { raw_text } => {
                        return Ok(SearchResult {
                            json: String::new(),
                            raw_text,
                            used_worker: hint,
                        })
                    }
                    SearchOutcome::Blocked { reason } => {
                        info!(worker = hint, %reason, "hinted worker blocked, falling back to dynamic selection");
                        blocked_workers.insert(hint);
                    }
                    outcome => {
                        info!(worker = hint, ?outcome, "hinted worker did not produce a result, falling back to dynamic selection");
                    }
                }
            } else {
                info!(worker = hint, error = ?health.error, "hinted worker not free, falling back to dynamic selection");
            }
        }

        let budget = self.retry.max_attempts * ATTEMPT_BUDGET_FACTOR;
        let started = Instant::now();
        let mut wait_rounds: u32 = 0;
        let mut last_error = "no attempt made".to_string();

        for attempt in 0..budget {
            send_progress(progress, "probing", None).await;
            let probe = self.probe_pool(worker_count, &blocked_workers).await;

            if probe.chosen.is_none() && probe.free_but_blocked {
                // Every free worker already answered `blocked` this dispatch;
                // give them another chance (proxies rotate worker-side).
                blocked_workers.clear();
                continue;
            }

            let Some(index) = probe.chosen else {
                wait_rounds += 1;
                if wait_rounds % WAIT_LOG_EVERY == 0 {
                    info!(
                        attempt,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "all workers busy, still waiting for a free one"
                    );
                }
                if started.elapsed() >= self.retry.wait_for_worker_max {
                    last_error = format!(
                        "no worker became available within {} ms",
                        self.retry.wait_for_worker_max.as_millis()
                    );
                    break;
                }
                send_progress(progress, "waiting_for_worker", None).await;
                tokio::time::sleep(self.round_delay(wait_rounds)).await;
                continue;
            };

            send_progress(progress, "searching", Some(index)).await;
            match self.workers.search(index, prompt).await {
                SearchOutcome::Success { json, raw_text } => {
                    return Ok(SearchResult {
                        json,
                        raw_text,
                        used_worker: index,
                    })
                }
                SearchOutcome::Empty { raw_text } => {
                    return Ok(SearchResult {
                        json: String::new(),
                        raw_text,
                        used_worker: index,
                    })
                }
                // Proxy rotation happens worker-side; another worker may be
                // clean, so re-loop immediately without this one.
                SearchOutcome::Blocked { reason } => {
                    warn!(worker = index, %reason, "worker blocked upstream, trying another");
                    blocked_workers.insert(index);
                    last_error = format!("worker {index} blocked: {reason}");
                }
                // Lost the optimistic-selection race; re-probe right away.
                SearchOutcome::Busy => {
                    debug!(worker = index, "worker became busy mid-flight");
                    last_error = format!("worker {index} became busy");
                }
                SearchOutcome::Transient { error } => {
                    warn!(worker = index, %error, "transient worker failure");
                    last_error = format!("worker {index} failed: {error}");
                }
            }
            send_progress(progress, "retrying", Some(index)).await;
        }

        Err(DispatchError::Exhausted {
            attempts: budget,
            last_error,
        })
    }

    /// Probe every worker in parallel; pick the lowest-indexed free one that
    /// has not answered `blocked` within this dispatch.
    async fn probe_pool(&self, worker_count: usize, blocked: &HashSet<usize>) -> PoolProbe {
        let probes = (1..=worker_count).map(|index| self.workers.health(index));
        let healths = join_all(probes).await;

        let chosen = healths
            .iter()
            .enumerate()
            .map(|(position, health)| (position + 1, health))
            .find(|(index, health)| health.is_free() && !blocked.contains(index))
            .map(|(index, _)| index);
        let free_but_blocked =
            chosen.is_none() && healths.iter().any(|h| h.is_free()) && !blocked.is_empty();

        PoolProbe {
            chosen,
            free_but_blocked,
        }
    }

    fn round_delay(&self, wait_rounds: u32) -> Duration {
        match self.mode {
            DispatchMode::CircuitBreaker => RETRY_DELAY,
            DispatchMode::BackoffPerRound => {
                let exp = wait_rounds.saturating_sub(1).min(16);
                let delay = self.retry.initial_delay.saturating_mul(1 << exp);
                delay.min(self.retry.max_delay)
            }
        }
    }
}

/// Outcome of one parallel health probe of the pool.
struct PoolProbe {
    /// Lowest-indexed free worker outside the blocked set.
    chosen: Option<usize>,
    /// Free workers exist, but all of them are in the blocked set.
    free_but_blocked: bool,
}

async fn send_progress(
    progress: Option<&mpsc::Sender<JobProgress>>,
    stage: &str,
    worker_id: Option<usize>,
) {
    if let Some(tx) = progress {
        let _ = tx.try_send(JobProgress {
            stage: stage.to_string(),
            worker_id,
        });
    }
}
