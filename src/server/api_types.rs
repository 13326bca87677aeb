//! Typed request/response bodies and the success envelope.
//!
//! Every success reply is `{data, meta: {requestId, processingTimeMs}}`;
//! errors use the envelope in [`crate::error`].

use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::batch::BatchStatus;
use crate::queue::{Job, JobProgress, JobStatus, SearchResult};

#[derive(Debug, Serialize, ToSchema)]
pub struct Meta {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "processingTimeMs")]
    pub processing_time_ms: u64,
}

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub data: T,
    pub meta: Meta,
}

/// Wrap `data` in the envelope with request correlation and timing.
pub fn respond<T: Serialize>(
    status: StatusCode,
    data: T,
    request_id: &str,
    started: Instant,
) -> Response {
    let envelope = Envelope {
        data,
        meta: Meta {
            request_id: request_id.to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        },
    };
    (status, Json(envelope)).into_response()
}

// --- Requests ---

#[derive(Debug, Deserialize, ToSchema)]
pub struct PromptRequest {
    pub prompt: String,
    /// Higher priority is dispatched sooner.
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BulkPromptsRequest {
    pub prompts: Vec<PromptRequest>,
    /// Shared priority for every prompt in the batch.
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct WorkerQuery {
    /// Advisory 1-based worker index.
    pub worker: Option<usize>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    /// Filter by job status.
    pub status: Option<String>,
    /// Page size, capped at 100.
    pub limit: Option<usize>,
    /// Opaque cursor from a previous page.
    #[serde(rename = "pageToken")]
    pub page_token: Option<String>,
}

// --- Responses ---

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkAccepted {
    pub batch_id: String,
    pub job_ids: Vec<String>,
    pub count: usize,
}

/// Client view of one job record.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            result: job.result,
            error: job.failure_reason,
            created_at: job.created_at,
            completed_at: job.finished_at,
            batch_index: job.batch_index,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total_items: u64,
    pub items_per_page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobListResponse {
    pub items: Vec<JobView>,
    pub pagination: Pagination,
}

/// Aggregated batch view. Member records can be TTL-evicted independently of
/// the batch set, so per-status counts (and `jobs`) may cover fewer members
/// than `total`.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusResponse {
    pub batch_id: String,
    pub total: usize,
    pub completed: usize,
    pub processing: usize,
    pub pending: usize,
    pub failed: usize,
    pub jobs: Vec<JobView>,
}

impl From<BatchStatus> for BatchStatusResponse {
    fn from(status: BatchStatus) -> Self {
        Self {
            batch_id: status.batch_id,
            total: status.total,
            completed: status.completed,
            processing: status.processing,
            pending: status.pending,
            failed: status.failed,
            jobs: status.jobs.into_iter().map(JobView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkerActionResponse {
    pub ok: bool,
    /// 1-based index of the worker the action ran on.
    pub worker: usize,
    pub action: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_view_maps_fields_to_camel_case() {
        let mut job = Job::new("9".to_string(), "p".to_string(), 3);
        job.mark_processing();
        job.progress = Some(JobProgress {
            stage: "searching".to_string(),
            worker_id: Some(2),
        });

        let view = JobView::from(job);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["jobId"], "9");
        assert_eq!(json["status"], "processing");
        assert_eq!(json["progress"]["workerId"], 2);
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("completedAt").is_none());
        assert!(json["createdAt"].is_string());
    }
}
