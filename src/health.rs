//! Aggregate health: the persistence backend plus every worker, probed in
//! parallel.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use utoipa::ToSchema;

use crate::store::KvStore;
use crate::worker::{WorkerClient, WorkerHealth};

#[derive(Debug, Serialize, ToSchema)]
pub struct StoreHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkerDetail {
    /// 1-based worker index.
    pub index: usize,
    pub url: String,
    #[serde(flatten)]
    pub health: WorkerHealth,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkersHealth {
    pub total: usize,
    pub healthy: usize,
    pub busy: usize,
    /// `ok` when every worker is healthy, `degraded` when some are,
    /// `fail` when none are.
    pub status: String,
    pub details: Vec<WorkerDetail>,
}

/// Whole-service health view. Reaching the aggregator at all means the app
/// itself is up.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthReport {
    pub app: String,
    pub redis: StoreHealth,
    pub workers: WorkersHealth,
}

/// Probes the store and the worker pool on demand. Infallible: failures are
/// reported inside the snapshot, never as errors.
pub struct HealthAggregator {
    store: Arc<dyn KvStore>,
    workers: Arc<WorkerClient>,
}

impl HealthAggregator {
    pub fn new(store: Arc<dyn KvStore>, workers: Arc<WorkerClient>) -> Self {
        Self { store, workers }
    }

    pub async fn check(&self) -> HealthReport {
        let worker_count = self.workers.worker_count();
        let probes = (1..=worker_count).map(|index| self.workers.health(index));
        let (ping, healths) = tokio::join!(self.store.ping(), join_all(probes));

        let redis = match ping {
            Ok(latency_ms) => StoreHealth {
                status: "ok".to_string(),
                latency_ms: Some(latency_ms),
                error: None,
            },
            Err(e) => StoreHealth {
                status: "fail".to_string(),
                latency_ms: None,
                error: Some(e.to_string()),
            },
        };

        let details: Vec<WorkerDetail> = healths
            .into_iter()
            .enumerate()
            .map(|(position, health)| {
                let index = position + 1;
                WorkerDetail {
                    index,
                    url: self.workers.endpoint(index).unwrap_or_default().to_string(),
                    health,
                }
            })
            .collect();

        let healthy = details.iter().filter(|d| d.health.ok).count();
        let busy = details.iter().filter(|d| d.health.busy).count();
        let status = if healthy == worker_count && worker_count > 0 {
            "ok"
        } else if healthy > 0 {
            "degraded"
        } else {
            "fail"
        };

        HealthReport {
            app: "ok".to_string(),
            redis,
            workers: WorkersHealth {
                total: worker_count,
                healthy,
                busy,
                status: status.to_string(),
                details,
            },
        }
    }
}
