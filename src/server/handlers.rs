//! Ingress handlers. Input validation lives here; everything below the
//! admission layer deals only with pre-validated requests.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::admission::AdmissionError;
use crate::batch::{BatchError, MAX_BULK_PROMPTS};
use crate::error::{ApiError, ErrorCode};
use crate::queue::{JobStatus, QueueError, PROMPT_MAX_CHARS};
use crate::worker::WorkerError;

use super::api_types::{
    respond, BatchStatusResponse, BulkAccepted, BulkPromptsRequest, JobAccepted, JobListResponse,
    JobView, ListJobsQuery, Pagination, PromptRequest, WorkerActionResponse, WorkerQuery,
};
use super::request_id::RequestId;
use super::AppState;

const DEFAULT_LIST_LIMIT: usize = 20;

/// Accept one prompt for asynchronous dispatch.
#[utoipa::path(
    post,
    path = "/search-intelligence/searcher/v1/prompts",
    params(WorkerQuery),
    request_body = PromptRequest,
    responses(
        (status = 202, description = "Job accepted", body = JobAccepted),
        (status = 400, description = "Bad worker hint or missing request ID"),
        (status = 422, description = "Prompt validation failed")
    ),
    tag = "Prompts"
)]
pub async fn submit_prompt(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<WorkerQuery>,
    headers: HeaderMap,
    Json(body): Json<PromptRequest>,
) -> Response {
    let started = Instant::now();
    if let Err(e) = validate_worker_param(&state, query.worker, &request_id) {
        return e.into_response();
    }
    if let Err(e) = validate_prompt(&body.prompt, &request_id) {
        return e.into_response();
    }

    let idempotency_key = idempotency_key(&headers);
    match state
        .admission
        .submit(
            &body.prompt,
            query.worker,
            body.priority,
            idempotency_key.as_deref(),
        )
        .await
    {
        Ok(job_id) => respond(
            StatusCode::ACCEPTED,
            JobAccepted { job_id },
            &request_id,
            started,
        ),
        Err(e) => admission_error(e, &request_id).into_response(),
    }
}

/// Accept up to 100 prompts as one batch.
#[utoipa::path(
    post,
    path = "/search-intelligence/searcher/v1/prompts/bulk",
    params(WorkerQuery),
    request_body = BulkPromptsRequest,
    responses(
        (status = 202, description = "Batch accepted", body = BulkAccepted),
        (status = 422, description = "Batch size or prompt validation failed")
    ),
    tag = "Prompts"
)]
pub async fn submit_bulk(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<WorkerQuery>,
    headers: HeaderMap,
    Json(body): Json<BulkPromptsRequest>,
) -> Response {
    let started = Instant::now();
    if let Err(e) = validate_worker_param(&state, query.worker, &request_id) {
        return e.into_response();
    }
    if body.prompts.is_empty() || body.prompts.len() > MAX_BULK_PROMPTS {
        return ApiError::validation(
            format!(
                "prompts length {} out of range 1..={MAX_BULK_PROMPTS}",
                body.prompts.len()
            ),
            &request_id,
        )
        .into_response();
    }
    for item in &body.prompts {
        if let Err(e) = validate_prompt(&item.prompt, &request_id) {
            return e.into_response();
        }
    }

    let prompts: Vec<String> = body.prompts.into_iter().map(|p| p.prompt).collect();
    let idempotency_key = idempotency_key(&headers);
    match state
        .admission
        .submit_bulk(
            &prompts,
            query.worker,
            body.priority,
            idempotency_key.as_deref(),
        )
        .await
    {
        Ok(record) => {
            let count = record.job_ids.len();
            respond(
                StatusCode::ACCEPTED,
                BulkAccepted {
                    batch_id: record.batch_id,
                    job_ids: record.job_ids,
                    count,
                },
                &request_id,
                started,
            )
        }
        Err(e) => admission_error(e, &request_id).into_response(),
    }
}

/// Look up one job.
#[utoipa::path(
    get,
    path = "/search-intelligence/searcher/v1/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job state", body = JobView),
        (status = 404, description = "Unknown or evicted job")
    ),
    tag = "Jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(job_id): Path<String>,
) -> Response {
    let started = Instant::now();
    match state.queue.get(&job_id).await {
        Ok(Some(job)) => respond(StatusCode::OK, JobView::from(job), &request_id, started),
        Ok(None) => ApiError::not_found(format!("job {job_id} not found"), &request_id)
            .into_response(),
        Err(e) => ApiError::internal(e, &request_id).into_response(),
    }
}

/// List jobs, newest first, with an opaque cursor.
#[utoipa::path(
    get,
    path = "/search-intelligence/searcher/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Job page", body = JobListResponse),
        (status = 400, description = "Invalid status filter")
    ),
    tag = "Jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let started = Instant::now();
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<JobStatus>() {
            Ok(status) => Some(status),
            Err(e) => return ApiError::bad_request(e, &request_id).into_response(),
        },
    };

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state
        .queue
        .list(status, limit, query.page_token.as_deref())
        .await
    {
        Ok(page) => respond(
            StatusCode::OK,
            JobListResponse {
                items: page.items.into_iter().map(JobView::from).collect(),
                pagination: Pagination {
                    total_items: page.total_items,
                    items_per_page: page.items_per_page,
                    next_page_token: page.next_page_token,
                },
            },
            &request_id,
            started,
        ),
        Err(e) => ApiError::internal(e, &request_id).into_response(),
    }
}

/// Aggregated status of one batch.
#[utoipa::path(
    get,
    path = "/search-intelligence/searcher/v1/batches/{batch_id}",
    params(("batch_id" = String, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Batch status", body = BatchStatusResponse),
        (status = 404, description = "Unknown or evicted batch")
    ),
    tag = "Batches"
)]
pub async fn get_batch(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(batch_id): Path<String>,
) -> Response {
    let started = Instant::now();
    match state.batches.status(&batch_id).await {
        Ok(status) => respond(
            StatusCode::OK,
            BatchStatusResponse::from(status),
            &request_id,
            started,
        ),
        Err(BatchError::NotFound(_)) => {
            ApiError::not_found(format!("batch {batch_id} not found"), &request_id)
                .into_response()
        }
        Err(e) => ApiError::internal(e, &request_id).into_response(),
    }
}

/// Aggregate health of the store and the worker pool.
#[utoipa::path(
    get,
    path = "/search-intelligence/searcher/v1/health",
    responses((status = 200, description = "Health report", body = crate::health::HealthReport)),
    tag = "Health"
)]
pub async fn health(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Response {
    let started = Instant::now();
    let report = state.health.check().await;
    respond(StatusCode::OK, report, &request_id, started)
}

/// Pre-open the search tab on one worker.
#[utoipa::path(
    post,
    path = "/search-intelligence/searcher/v1/workers/{index}/warmup",
    params(("index" = usize, Path, description = "1-based worker index")),
    responses((status = 200, description = "Warmup done", body = WorkerActionResponse)),
    tag = "Workers"
)]
pub async fn warmup_worker(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(index): Path<usize>,
) -> Response {
    run_worker_action(&state, index, "warmup", &request_id).await
}

/// Restart the browser on one worker.
#[utoipa::path(
    post,
    path = "/search-intelligence/searcher/v1/workers/{index}/restart",
    params(("index" = usize, Path, description = "1-based worker index")),
    responses((status = 200, description = "Restart done", body = WorkerActionResponse)),
    tag = "Workers"
)]
pub async fn restart_worker(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(index): Path<usize>,
) -> Response {
    run_worker_action(&state, index, "restart", &request_id).await
}

/// Rotate the session identity on one worker.
#[utoipa::path(
    post,
    path = "/search-intelligence/searcher/v1/workers/{index}/refresh",
    params(("index" = usize, Path, description = "1-based worker index")),
    responses((status = 200, description = "Refresh done", body = WorkerActionResponse)),
    tag = "Workers"
)]
pub async fn refresh_worker(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(index): Path<usize>,
) -> Response {
    run_worker_action(&state, index, "refresh", &request_id).await
}

/// OpenAPI document for this service.
pub async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    use utoipa::OpenApi;
    Json(ApiDoc::openapi())
}

async fn run_worker_action(
    state: &AppState,
    index: usize,
    action: &str,
    request_id: &str,
) -> Response {
    let started = Instant::now();
    if index == 0 || index > state.workers.worker_count() {
        return ApiError::bad_request(
            format!(
                "worker index {index} out of range 1..={}",
                state.workers.worker_count()
            ),
            request_id,
        )
        .into_response();
    }

    let outcome = match action {
        "warmup" => state.workers.warmup_search_tab(index).await,
        "restart" => state.workers.restart_browser(index).await,
        _ => state.workers.refresh_session(index).await,
    };

    match outcome {
        Ok(()) => respond(
            StatusCode::OK,
            WorkerActionResponse {
                ok: true,
                worker: index,
                action: action.to_string(),
            },
            request_id,
            started,
        ),
        Err(e @ WorkerError::InvalidIndex(_)) => {
            ApiError::bad_request(e.to_string(), request_id).into_response()
        }
        Err(e) => ApiError::new(
            ErrorCode::UpstreamError,
            format!("worker {index} {action} failed: {e}"),
            request_id,
        )
        .into_response(),
    }
}

fn validate_worker_param(
    state: &AppState,
    worker: Option<usize>,
    request_id: &str,
) -> Result<(), ApiError> {
    let worker_count = state.workers.worker_count();
    match worker {
        Some(w) if w == 0 || w > worker_count => Err(ApiError::bad_request(
            format!("worker {w} out of range 1..={worker_count}"),
            request_id,
        )),
        _ => Ok(()),
    }
}

fn validate_prompt(prompt: &str, request_id: &str) -> Result<(), ApiError> {
    if prompt.is_empty() {
        return Err(ApiError::validation("prompt must not be empty", request_id));
    }
    if prompt.chars().count() > PROMPT_MAX_CHARS {
        return Err(ApiError::validation(
            format!("prompt exceeds {PROMPT_MAX_CHARS} characters"),
            request_id,
        ));
    }
    Ok(())
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn admission_error(error: AdmissionError, request_id: &str) -> ApiError {
    match error {
        AdmissionError::Queue(QueueError::InvalidPrompt(message))
        | AdmissionError::Batch(BatchError::Queue(QueueError::InvalidPrompt(message))) => {
            ApiError::validation(message, request_id)
        }
        AdmissionError::Batch(BatchError::InvalidSize(size)) => ApiError::validation(
            format!("prompts length {size} out of range 1..={MAX_BULK_PROMPTS}"),
            request_id,
        ),
        other => ApiError::internal(other, request_id),
    }
}

#[derive(utoipa::OpenApi)]
#[openapi(
    paths(
        submit_prompt,
        submit_bulk,
        get_job,
        list_jobs,
        get_batch,
        health,
        warmup_worker,
        restart_worker,
        refresh_worker,
    ),
    components(schemas(
        PromptRequest,
        BulkPromptsRequest,
        JobAccepted,
        BulkAccepted,
        JobView,
        JobListResponse,
        Pagination,
        BatchStatusResponse,
        WorkerActionResponse,
        crate::queue::JobStatus,
        crate::queue::JobProgress,
        crate::queue::SearchResult,
        crate::health::HealthReport,
        crate::health::StoreHealth,
        crate::health::WorkersHealth,
        crate::health::WorkerDetail,
        crate::worker::WorkerHealth,
    )),
    tags(
        (name = "Prompts", description = "Prompt admission"),
        (name = "Jobs", description = "Job status and listing"),
        (name = "Batches", description = "Batch progress"),
        (name = "Workers", description = "Worker pool administration"),
        (name = "Health", description = "Service health"),
    )
)]
pub struct ApiDoc;
