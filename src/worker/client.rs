//! One-shot HTTP operations against a single worker, with per-call deadlines
//! and response classification.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::WorkerTimeouts;

use super::types::{SearchOutcome, SearchReply, WorkerHealth};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker index {0} out of range")]
    InvalidIndex(usize),
    #[error("request to worker failed: {0}")]
    Request(String),
    #[error("worker replied with status {0}")]
    Status(u16),
}

/// HTTP client for the worker pool. The endpoint list is immutable for the
/// process lifetime; indices are 1-based everywhere.
pub struct WorkerClient {
    client: Client,
    endpoints: Vec<String>,
    timeouts: WorkerTimeouts,
}

impl WorkerClient {
    /// Create a client for the given base URLs (trailing slashes stripped).
    pub fn new(base_urls: &[String], timeouts: WorkerTimeouts) -> Self {
        let client = Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        let endpoints = base_urls
            .iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .collect();
        Self {
            client,
            endpoints,
            timeouts,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Base URL for a 1-based worker index.
    pub fn endpoint(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.endpoints.get(index - 1).map(String::as_str)
    }

    fn endpoint_or_err(&self, index: usize) -> Result<&str, WorkerError> {
        self.endpoint(index).ok_or(WorkerError::InvalidIndex(index))
    }

    /// Probe one worker. Never propagates an error: any failure yields an
    /// unhealthy snapshot carrying the cause.
    pub async fn health(&self, index: usize) -> WorkerHealth {
        let Some(base) = self.endpoint(index) else {
            return WorkerHealth::unreachable(format!("worker index {index} out of range"));
        };

        let response = self
            .client
            .get(format!("{base}/health"))
            .timeout(self.timeouts.health)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<WorkerHealth>().await {
                Ok(health) => health,
                Err(e) => WorkerHealth::unreachable(format!("invalid health body: {e}")),
            },
            Ok(resp) => WorkerHealth::unreachable(format!("health returned {}", resp.status())),
            Err(e) => WorkerHealth::unreachable(e.to_string()),
        }
    }

    /// Run one search on one worker and classify the reply.
    ///
    /// All failure shapes come back as [`SearchOutcome`] variants; this method
    /// never returns an error so the dispatcher can treat every path
    /// uniformly.
    pub async fn search(&self, index: usize, prompt: &str) -> SearchOutcome {
        let base = match self.endpoint(index) {
            Some(base) => base,
            None => {
                return SearchOutcome::Transient {
                    error: format!("worker index {index} out of range"),
                }
            }
        };

        let response = self
            .client
            .post(format!("{base}/search"))
            .timeout(self.timeouts.search)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await;

        let resp = match response {
            Ok(resp) => resp,
            Err(e) => {
                return SearchOutcome::Transient {
                    error: e.to_string(),
                }
            }
        };

        let status = resp.status();
        let reply: SearchReply = match resp.json().await {
            Ok(reply) => reply,
            Err(e) => {
                return SearchOutcome::Transient {
                    error: format!("unreadable search reply ({status}): {e}"),
                }
            }
        };

        classify_search_reply(status, reply)
    }

    /// Pre-open the search tab so the first real search is fast.
    pub async fn warmup_search_tab(&self, index: usize) -> Result<(), WorkerError> {
        self.post_ok(index, "/tabs/search", self.timeouts.warmup).await
    }

    /// Restart the worker's browser session.
    pub async fn restart_browser(&self, index: usize) -> Result<(), WorkerError> {
        self.post_ok(index, "/browser/restart", self.timeouts.restart)
            .await
    }

    /// Rotate the worker's session identity.
    pub async fn refresh_session(&self, index: usize) -> Result<(), WorkerError> {
        self.post_ok(index, "/session/refresh", self.timeouts.refresh)
            .await
    }

    async fn post_ok(
        &self,
        index: usize,
        path: &str,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        let base = self.endpoint_or_err(index)?;
        let resp = self
            .client
            .post(format!("{base}{path}"))
            .timeout(timeout)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| WorkerError::Request(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(WorkerError::Status(resp.status().as_u16()))
        }
    }
}

fn classify_search_reply(status: StatusCode, reply: SearchReply) -> SearchOutcome {
    if status.is_success() {
        if reply.ok {
            if let Some(result) = reply.result {
                return SearchOutcome::Success {
                    json: result.json,
                    raw_text: result.raw_text,
                };
            }
        }
        return SearchOutcome::Transient {
            error: "2xx reply without a result payload".to_string(),
        };
    }

    if status == StatusCode::UNPROCESSABLE_ENTITY
        && reply.error.as_deref() == Some("empty_result")
    {
        return SearchOutcome::Empty {
            raw_text: reply.raw_text,
        };
    }

    if status == StatusCode::SERVICE_UNAVAILABLE && reply.retry_other_worker == Some(true) {
        let reason = reply
            .error
            .or(reply.message)
            .unwrap_or_else(|| "blocked".to_string());
        return SearchOutcome::Blocked { reason };
    }

    if status == StatusCode::LOCKED || reply.busy == Some(true) {
        return SearchOutcome::Busy;
    }

    let error = reply
        .error
        .or(reply.message)
        .unwrap_or_else(|| format!("search returned {status}"));
    debug!(%status, %error, "search classified as transient");
    SearchOutcome::Transient { error }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(body: serde_json::Value) -> SearchReply {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn ok_reply_is_success_with_payload() {
        let outcome = classify_search_reply(
            StatusCode::OK,
            reply(serde_json::json!({
                "ok": true,
                "result": { "json": "{\"a\":1}", "raw_text": "a=1" },
            })),
        );
        assert_eq!(
            outcome,
            SearchOutcome::Success {
                json: "{\"a\":1}".to_string(),
                raw_text: Some("a=1".to_string()),
            }
        );
    }

    #[test]
    fn empty_result_maps_to_empty_with_raw_text() {
        let outcome = classify_search_reply(
            StatusCode::UNPROCESSABLE_ENTITY,
            reply(serde_json::json!({
                "ok": false,
                "error": "empty_result",
                "raw_text": "nothing",
            })),
        );
        assert_eq!(
            outcome,
            SearchOutcome::Empty {
                raw_text: Some("nothing".to_string()),
            }
        );
    }

    #[test]
    fn retry_other_worker_maps_to_blocked() {
        let outcome = classify_search_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            reply(serde_json::json!({
                "ok": false,
                "error": "blocked_by_google",
                "retry_other_worker": true,
            })),
        );
        assert_eq!(
            outcome,
            SearchOutcome::Blocked {
                reason: "blocked_by_google".to_string(),
            }
        );
    }

    #[test]
    fn warming_up_503_is_transient_not_blocked() {
        let outcome = classify_search_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            reply(serde_json::json!({ "ok": false, "error": "warming_up" })),
        );
        assert!(matches!(outcome, SearchOutcome::Transient { .. }));
    }

    #[test]
    fn locked_status_and_busy_flag_map_to_busy() {
        let outcome = classify_search_reply(
            StatusCode::LOCKED,
            reply(serde_json::json!({ "ok": false, "busy": true })),
        );
        assert_eq!(outcome, SearchOutcome::Busy);

        let outcome = classify_search_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            reply(serde_json::json!({ "ok": false, "busy": true })),
        );
        assert_eq!(outcome, SearchOutcome::Busy);
    }

    #[test]
    fn other_errors_are_transient() {
        let outcome = classify_search_reply(
            StatusCode::GATEWAY_TIMEOUT,
            reply(serde_json::json!({ "ok": false, "error": "timeout" })),
        );
        assert_eq!(
            outcome,
            SearchOutcome::Transient {
                error: "timeout".to_string(),
            }
        );
    }

    #[test]
    fn success_without_result_payload_is_transient() {
        let outcome =
            classify_search_reply(StatusCode::OK, reply(serde_json::json!({ "ok": true })));
        assert!(matches!(outcome, SearchOutcome::Transient { .. }));
    }
}
