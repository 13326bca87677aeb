//! End-to-end scenarios: the full service wired with the in-memory store and
//! stub workers speaking the real worker protocol on ephemeral ports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceExt;

use searcherd::config::{Settings, StoreBackend, WorkerTimeouts};
use searcherd::server::{create_router, AppState, BASE_PATH};
use searcherd::store::MemoryStore;

const RID: &str = "11111111-1111-1111-1111-111111111111";

/// What a stub worker does with `POST /search`.
#[derive(Clone)]
enum StubBehavior {
    Ok {
        json: &'static str,
        raw_text: Option<&'static str>,
    },
    Empty {
        raw_text: &'static str,
    },
    Blocked,
    /// Reports busy until the deadline, then succeeds.
    BusyUntil {
        free_at: Instant,
        json: &'static str,
    },
}

#[derive(Clone)]
struct StubState {
    behavior: StubBehavior,
    searches: Arc<AtomicUsize>,
}

impl StubState {
    fn is_busy(&self) -> bool {
        matches!(&self.behavior, StubBehavior::BusyUntil { free_at, .. } if Instant::now() < *free_at)
    }
}

async fn stub_health(State(state): State<StubState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "busy": state.is_busy(),
        "ready": true,
        "browser": "chromium",
        "version": "131.0.6778.85",
    }))
}

async fn stub_search(State(state): State<StubState>) -> Response {
    state.searches.fetch_add(1, Ordering::SeqCst);
    match &state.behavior {
        StubBehavior::Ok { json: body, raw_text } => (
            StatusCode::OK,
            Json(json!({ "ok": true, "result": { "json": body, "raw_text": raw_text } })),
        )
            .into_response(),
        StubBehavior::Empty { raw_text } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "ok": false, "error": "empty_result", "raw_text": raw_text })),
        )
            .into_response(),
        StubBehavior::Blocked => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ok": false,
                "error": "blocked_by_google",
                "message": "This request is not supported",
                "retry_other_worker": true,
            })),
        )
            .into_response(),
        StubBehavior::BusyUntil { json: body, .. } => {
            if state.is_busy() {
                (
                    StatusCode::LOCKED,
                    Json(json!({ "ok": false, "busy": true, "message": "busy" })),
                )
                    .into_response()
            } else {
                (
                    StatusCode::OK,
                    Json(json!({ "ok": true, "result": { "json": body } })),
                )
                    .into_response()
            }
        }
    }
}

/// Bind a stub worker on an ephemeral port; returns its base URL and search
/// hit counter.
async fn spawn_stub(behavior: StubBehavior) -> (String, Arc<AtomicUsize>) {
    let searches = Arc::new(AtomicUsize::new(0));
    let state = StubState {
        behavior,
        searches: Arc::clone(&searches),
    };
    let app = Router::new()
        .route("/health", get(stub_health))
        .route("/search", post(stub_search))
        .route("/tabs/search", post(|| async { Json(json!({ "ok": true })) }))
        .route("/browser/restart", post(|| async { Json(json!({ "ok": true })) }))
        .route("/session/refresh", post(|| async { Json(json!({ "ok": true })) }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), searches)
}

/// Full service over the given worker pool, runner pool spawned.
fn service(worker_urls: Vec<String>) -> Router {
    let settings = Settings {
        store_backend: StoreBackend::Memory,
        worker_base_urls: worker_urls,
        worker_timeouts: WorkerTimeouts {
            health: Duration::from_millis(1_000),
            search: Duration::from_millis(5_000),
            ..WorkerTimeouts::default()
        },
        search_job_timeout: Duration::from_secs(20),
        ..Settings::default()
    };
    let state = AppState::with_store(settings, Arc::new(MemoryStore::new()));
    let _runners = state.spawn_runners();
    create_router(state)
}

fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("{BASE_PATH}{path}"))
        .header("content-type", "application/json")
        .header("x-request-id", RID)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_req(path: &str) -> Request<Body> {
    Request::builder()
        .uri(format!("{BASE_PATH}{path}"))
        .header("x-request-id", RID)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `GET /jobs/{id}` until the job reaches a terminal state.
async fn wait_for_terminal(app: &Router, job_id: &str, deadline: Duration) -> serde_json::Value {
    let started = Instant::now();
    loop {
        let response = app
            .clone()
            .oneshot(get_req(&format!("/jobs/{job_id}")))
            .await
            .unwrap();
        let json = body_json(response).await;
        let status = json["data"]["status"].as_str().unwrap_or("").to_string();
        if status == "completed" || status == "failed" {
            return json["data"].clone();
        }
        assert!(
            started.elapsed() < deadline,
            "job {job_id} did not reach a terminal state in time: {json}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn happy_path_completes_with_result() {
    let (url, searches) = spawn_stub(StubBehavior::Ok {
        json: "{\"a\":1}",
        raw_text: Some("a=1"),
    })
    .await;
    let app = service(vec![url]);

    let response = app
        .clone()
        .oneshot(post_json("/prompts", json!({ "prompt": "hi" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert_eq!(accepted["data"]["jobId"], "1");

    let job = wait_for_terminal(&app, "1", Duration::from_secs(10)).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["json"], "{\"a\":1}");
    assert_eq!(job["result"]["raw_text"], "a=1");
    assert_eq!(job["result"]["usedWorker"], 1);
    assert!(job["completedAt"].is_string());
    assert!(job.get("error").is_none());
    assert_eq!(searches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_result_completes_with_empty_json() {
    let (url, _) = spawn_stub(StubBehavior::Empty { raw_text: "nothing" }).await;
    let app = service(vec![url]);

    app.clone()
        .oneshot(post_json("/prompts", json!({ "prompt": "sparse query" })))
        .await
        .unwrap();

    let job = wait_for_terminal(&app, "1", Duration::from_secs(10)).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["json"], "");
    assert_eq!(job["result"]["raw_text"], "nothing");
    assert_eq!(job["result"]["usedWorker"], 1);
}

#[tokio::test]
async fn blocked_worker_fails_over_to_the_next() {
    let (blocked_url, blocked_hits) = spawn_stub(StubBehavior::Blocked).await;
    let (ok_url, ok_hits) = spawn_stub(StubBehavior::Ok {
        json: "{\"b\":2}",
        raw_text: None,
    })
    .await;
    let app = service(vec![blocked_url, ok_url]);

    app.clone()
        .oneshot(post_json("/prompts", json!({ "prompt": "failover please" })))
        .await
        .unwrap();

    let job = wait_for_terminal(&app, "1", Duration::from_secs(10)).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["usedWorker"], 2);
    assert_eq!(job["result"]["json"], "{\"b\":2}");
    // Worker 1 was tried, answered blocked, and was skipped thereafter.
    assert!(blocked_hits.load(Ordering::SeqCst) >= 1);
    assert_eq!(ok_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn all_busy_pool_completes_once_a_worker_frees_up() {
    let free_at = Instant::now() + Duration::from_secs(4);
    let (url1, _) = spawn_stub(StubBehavior::BusyUntil {
        free_at,
        json: "{\"c\":3}",
    })
    .await;
    let (url2, _) = spawn_stub(StubBehavior::BusyUntil {
        free_at,
        json: "{\"c\":3}",
    })
    .await;
    let app = service(vec![url1, url2]);

    let submitted = Instant::now();
    app.clone()
        .oneshot(post_json("/prompts", json!({ "prompt": "patience" })))
        .await
        .unwrap();

    let job = wait_for_terminal(&app, "1", Duration::from_secs(15)).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["json"], "{\"c\":3}");
    let used = job["result"]["usedWorker"].as_u64().unwrap();
    assert!(used == 1 || used == 2);
    // The pool was busy for 4 s, so completion cannot predate that.
    assert!(submitted.elapsed() >= Duration::from_secs(4));
}

#[tokio::test]
async fn bulk_jobs_complete_and_batch_reports_in_order() {
    let (url, _) = spawn_stub(StubBehavior::Ok {
        json: "{\"ok\":true}",
        raw_text: None,
    })
    .await;
    let app = service(vec![url]);

    let response = app
        .clone()
        .oneshot(post_json(
            "/prompts/bulk",
            json!({ "prompts": [
                { "prompt": "a" }, { "prompt": "b" }, { "prompt": "c" }
            ]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert_eq!(accepted["data"]["jobIds"], json!(["1", "2", "3"]));
    assert_eq!(accepted["data"]["count"], 3);
    let batch_id = accepted["data"]["batchId"].as_str().unwrap().to_string();

    for id in ["1", "2", "3"] {
        let job = wait_for_terminal(&app, id, Duration::from_secs(15)).await;
        assert_eq!(job["status"], "completed", "job {id}");
    }

    let response = app
        .clone()
        .oneshot(get_req(&format!("/batches/{batch_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let batch = body_json(response).await;
    assert_eq!(batch["data"]["total"], 3);
    assert_eq!(batch["data"]["completed"], 3);
    assert_eq!(batch["data"]["processing"], 0);
    assert_eq!(batch["data"]["pending"], 0);
    assert_eq!(batch["data"]["failed"], 0);
    let jobs = batch["data"]["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 3);
    let indices: Vec<u64> = jobs
        .iter()
        .map(|j| j["batchIndex"].as_u64().unwrap())
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
    let ids: Vec<&str> = jobs.iter().map(|j| j["jobId"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn idempotent_resubmit_returns_the_same_completed_job() {
    let (url, _) = spawn_stub(StubBehavior::Ok {
        json: "{\"d\":4}",
        raw_text: None,
    })
    .await;
    let app = service(vec![url]);

    let request = || {
        Request::builder()
            .method("POST")
            .uri(format!("{BASE_PATH}/prompts"))
            .header("content-type", "application/json")
            .header("x-request-id", RID)
            .header("idempotency-key", "K")
            .body(Body::from(json!({ "prompt": "hi" }).to_string()))
            .unwrap()
    };

    let first = body_json(app.clone().oneshot(request()).await.unwrap()).await;
    let job_id = first["data"]["jobId"].as_str().unwrap().to_string();
    wait_for_terminal(&app, &job_id, Duration::from_secs(10)).await;

    let second = body_json(app.clone().oneshot(request()).await.unwrap()).await;
    assert_eq!(second["data"]["jobId"], job_id.as_str());

    // Exactly one job exists.
    let listing = body_json(app.clone().oneshot(get_req("/jobs")).await.unwrap()).await;
    assert_eq!(listing["data"]["pagination"]["totalItems"], 1);
}

#[tokio::test]
async fn worker_admin_actions_reach_the_stub() {
    let (url, _) = spawn_stub(StubBehavior::Ok {
        json: "{}",
        raw_text: None,
    })
    .await;
    let app = service(vec![url]);

    for action in ["warmup", "restart", "refresh"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("{BASE_PATH}/workers/1/{action}"))
                    .header("x-request-id", RID)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "action {action}");
        let json = body_json(response).await;
        assert_eq!(json["data"]["ok"], true);
        assert_eq!(json["data"]["worker"], 1);
    }
}

#[tokio::test]
async fn health_reports_ok_pool() {
    let (url, _) = spawn_stub(StubBehavior::Ok {
        json: "{}",
        raw_text: None,
    })
    .await;
    let app = service(vec![url]);

    let response = app.clone().oneshot(get_req("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["app"], "ok");
    assert_eq!(json["data"]["workers"]["status"], "ok");
    assert_eq!(json["data"]["workers"]["healthy"], 1);
    assert_eq!(json["data"]["workers"]["details"][0]["browser"], "chromium");
    assert_eq!(json["meta"]["requestId"], RID);
}
