//! HTTP ingress for the prompt dispatch service.
//!
//! Request-ID correlation, validation, and the response envelope live here;
//! the core subsystems are wired together as explicit constructor
//! dependencies on [`AppState`].

mod api_types;
mod handlers;
mod request_id;
mod routes;

pub use routes::{create_router, BASE_PATH};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::admission::Admission;
use crate::batch::BatchCoordinator;
use crate::config::{Settings, StoreBackend};
use crate::dispatch::Dispatcher;
use crate::health::HealthAggregator;
use crate::queue::{JobQueue, QueueRunner};
use crate::store::{KvStore, MemoryStore, RedisStore};
use crate::worker::WorkerClient;

/// Shared state for the web server and the runner pool.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<Admission>,
    pub queue: Arc<JobQueue>,
    pub batches: Arc<BatchCoordinator>,
    pub workers: Arc<WorkerClient>,
    pub health: Arc<HealthAggregator>,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn KvStore>,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Connect to the configured store backend and wire all subsystems.
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let store: Arc<dyn KvStore> = match settings.store_backend {
            StoreBackend::Redis => {
                let url = settings
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("redis backend requires REDIS_URL"))?;
                Arc::new(RedisStore::connect(url).await?)
            }
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(settings, store))
    }

    /// Wire all subsystems on top of an existing store handle.
    pub fn with_store(settings: Settings, store: Arc<dyn KvStore>) -> Self {
        let workers = Arc::new(WorkerClient::new(
            &settings.worker_base_urls,
            settings.worker_timeouts.clone(),
        ));
        let queue = Arc::new(JobQueue::new(Arc::clone(&store), &settings));
        let batches = Arc::new(BatchCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            settings.job_results_ttl_sec,
        ));
        let admission = Arc::new(Admission::new(
            Arc::clone(&queue),
            Arc::clone(&batches),
            Arc::clone(&store),
            settings.job_results_ttl_sec,
        ));
        let health = Arc::new(HealthAggregator::new(
            Arc::clone(&store),
            Arc::clone(&workers),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&workers),
            settings.retry.clone(),
            settings.dispatch_mode,
        ));

        Self {
            admission,
            queue,
            batches,
            workers,
            health,
            dispatcher,
            store,
            settings: Arc::new(settings),
        }
    }

    /// Spawn the runner pool and sweeper for this state.
    pub fn spawn_runners(&self) -> Vec<JoinHandle<()>> {
        let runner = Arc::new(QueueRunner::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.store),
            &self.settings,
        ));
        runner.spawn()
    }
}

/// Start the service: store connection, runner pool, HTTP listener.
pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    let state = AppState::new(settings).await?;
    let _runners = state.spawn_runners();
    let app = create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.settings.port));
    tracing::info!(
        workers = state.settings.worker_count(),
        "Starting searcherd at http://{addr}{BASE_PATH}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
