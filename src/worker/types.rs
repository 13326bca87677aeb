//! Wire types and the classified outcome of a worker search.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Transient health snapshot of one worker. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct WorkerHealth {
    pub ok: bool,
    #[serde(default)]
    pub busy: bool,
    /// `None` when the worker predates the readiness field; treated as ready.
    #[serde(default)]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerHealth {
    /// Whether the worker can accept a search right now.
    pub fn is_free(&self) -> bool {
        self.ok && !self.busy && self.ready != Some(false)
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Classified result of one `search` call, the closed sum consumed by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Worker produced structured JSON.
    Success {
        json: String,
        raw_text: Option<String>,
    },
    /// Worker reached the target but extracted no structured JSON; treated as
    /// success with an empty `json`, `raw_text` carried through.
    Empty { raw_text: Option<String> },
    /// Upstream refused service for this worker; try another one.
    Blocked { reason: String },
    /// Worker became busy mid-flight.
    Busy,
    /// Anything else: other 4xx/5xx, network error, deadline.
    Transient { error: String },
}

/// Body of a `POST /search` reply, covering every status variant the worker
/// emits.
#[derive(Debug, Deserialize)]
pub(crate) struct SearchReply {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Option<SearchReplyResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub retry_other_worker: Option<bool>,
    #[serde(default)]
    pub busy: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchReplyResult {
    #[serde(default)]
    pub json: String,
    #[serde(default)]
    pub raw_text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_requires_ok_not_busy_and_not_explicitly_unready() {
        let free = WorkerHealth {
            ok: true,
            ..WorkerHealth::default()
        };
        assert!(free.is_free());

        let legacy_no_ready_field = WorkerHealth {
            ok: true,
            ready: None,
            ..WorkerHealth::default()
        };
        assert!(legacy_no_ready_field.is_free());

        let busy = WorkerHealth {
            ok: true,
            busy: true,
            ..WorkerHealth::default()
        };
        assert!(!busy.is_free());

        let warming_up = WorkerHealth {
            ok: true,
            ready: Some(false),
            ..WorkerHealth::default()
        };
        assert!(!warming_up.is_free());

        assert!(!WorkerHealth::unreachable("connect refused").is_free());
    }
}
