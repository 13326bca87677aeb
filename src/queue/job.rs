//! Durable job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Prompts above this length are rejected before they reach the queue.
pub const PROMPT_MAX_CHARS: usize = 10_000;

/// Seq values stay below this span, so one priority level never bleeds into
/// the next inside the waiting-set score.
const PRIORITY_SPAN: f64 = (1u64 << 40) as f64;

/// Result of a successful dispatch, stored on the job record and returned to
/// clients as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SearchResult {
    /// Structured JSON extracted by the worker; empty string for an empty
    /// result.
    pub json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    /// 1-based index of the worker that produced the result.
    #[serde(rename = "usedWorker")]
    pub used_worker: usize,
}

/// Best-effort progress snapshot published by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobProgress {
    pub stage: String,
    #[serde(rename = "workerId", skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One unit of work derived from one prompt.
///
/// Persisted as JSON under `job:<id>`; mutated only by the owning runner and
/// the stall sweeper, always through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_hint: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_total: Option<usize>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    /// How many times a reservation of this job went stale.
    #[serde(default)]
    pub stalled_count: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SearchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
}

impl Job {
    pub fn new(id: String, prompt: String, max_attempts: u32) -> Self {
        Self {
            id,
            prompt,
            worker_hint: None,
            batch_id: None,
            batch_index: None,
            batch_total: None,
            priority: 0,
            attempts: 0,
            max_attempts,
            stalled_count: 0,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
            failure_reason: None,
            progress: None,
        }
    }

    /// Numeric enqueue sequence, recovered from the monotonic ID.
    pub fn seq(&self) -> u64 {
        self.id.parse().unwrap_or(0)
    }

    /// Score in the waiting set: higher priority sorts strictly earlier,
    /// FIFO by enqueue order within a priority level (ascending pop).
    pub fn waiting_score(&self) -> f64 {
        -(self.priority as f64) * PRIORITY_SPAN + self.seq() as f64
    }

    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
    }

    /// Back to pending for a retry or a stall re-reservation.
    pub fn mark_pending(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = None;
    }

    pub fn mark_completed(&mut self, result: SearchResult) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.failure_reason = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_score_pops_priority_first_then_fifo() {
        let mut low_early = Job::new("1".to_string(), "a".to_string(), 3);
        let mut low_late = Job::new("2".to_string(), "b".to_string(), 3);
        let mut high_late = Job::new("3".to_string(), "c".to_string(), 3);
        low_early.priority = 0;
        low_late.priority = 0;
        high_late.priority = 5;

        // Ascending score order is the pop order.
        assert!(high_late.waiting_score() < low_early.waiting_score());
        assert!(low_early.waiting_score() < low_late.waiting_score());
    }

    #[test]
    fn terminal_marks_set_exactly_one_outcome_field() {
        let mut job = Job::new("7".to_string(), "p".to_string(), 3);
        job.mark_processing();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.result.is_none() && job.failure_reason.is_none());

        let mut completed = job.clone();
        completed.mark_completed(SearchResult {
            json: "{}".to_string(),
            raw_text: None,
            used_worker: 1,
        });
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.result.is_some());
        assert!(completed.failure_reason.is_none());
        assert!(completed.finished_at.is_some());

        job.mark_failed("exhausted");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert_eq!(job.failure_reason.as_deref(), Some("exhausted"));
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut job = Job::new("42".to_string(), "find things".to_string(), 3);
        job.batch_id = Some("batch_1_abc".to_string());
        job.batch_index = Some(2);
        job.batch_total = Some(3);
        job.progress = Some(JobProgress {
            stage: "searching".to_string(),
            worker_id: Some(1),
        });

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "42");
        assert_eq!(back.batch_index, Some(2));
        assert_eq!(back.progress, job.progress);
        assert_eq!(back.status, JobStatus::Pending);
    }

    #[test]
    fn result_serializes_used_worker_in_camel_case() {
        let result = SearchResult {
            json: String::new(),
            raw_text: Some("text".to_string()),
            used_worker: 2,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["usedWorker"], 2);
        assert_eq!(json["raw_text"], "text");
    }
}
