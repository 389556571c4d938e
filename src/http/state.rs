use crate::config::{BackendKind, Config};
use crate::correlator::ResultCorrelator;
use crate::dispatch::{ChunkDispatcher, DispatcherFactory};
use crate::health::WorkerHealthMonitor;
use crate::nats::NatsClient;
use crate::recognizer::normalize_base_url;
use crate::session::{FileSessionStore, SessionManager};
use anyhow::{Context, Result};
use axum::body::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Timeout of pass-through requests to the recognition engine
const PROXY_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide context shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<dyn ChunkDispatcher>,
    /// Present only for the queue backend
    pub correlator: Option<ResultCorrelator>,
    /// Present only when external workers report heartbeats
    pub health: Option<Arc<WorkerHealthMonitor>>,
    pub connections: Arc<ConnectionLimiter>,
    pub engine: EngineProxy,
}

impl AppState {
    pub fn new(
        config: Config,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<dyn ChunkDispatcher>,
        correlator: Option<ResultCorrelator>,
        health: Option<Arc<WorkerHealthMonitor>>,
    ) -> Result<Self> {
        let engine = EngineProxy::new(&config.recognizer.base_url)?;
        let connections = Arc::new(ConnectionLimiter::new(config.server.max_connections));

        Ok(Self {
            config: Arc::new(config),
            sessions,
            dispatcher,
            correlator,
            health,
            connections,
            engine,
        })
    }

    /// Wire up storage, the configured dispatch backend and its collaborators
    pub async fn build(config: Config) -> Result<Self> {
        let store = Arc::new(FileSessionStore::open(config.storage.sessions_dir()).await?);
        let sessions = Arc::new(SessionManager::new(
            config.session.clone(),
            &config.storage,
            store,
        ));

        let (dispatcher, correlator, health) = match config.dispatch.backend {
            BackendKind::Pool => (DispatcherFactory::create(&config, None)?, None, None),
            BackendKind::Queue => {
                let nats = Arc::new(NatsClient::connect(&config.nats).await?);
                let dispatcher = DispatcherFactory::create(&config, Some(Arc::clone(&nats)))?;
                let correlator = ResultCorrelator::new(nats.clone());
                let monitor = Arc::new(WorkerHealthMonitor::new(
                    nats,
                    config.health.min_workers,
                    Duration::from_secs(config.health.check_interval_secs),
                ));
                (dispatcher, Some(correlator), Some(monitor))
            }
        };

        info!("Using {} dispatch backend", dispatcher.name());

        Self::new(config, sessions, dispatcher, correlator, health)
    }

    /// Start the inactivity sweep and worker health polling
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.sessions.spawn_sweeper(shutdown.child_token())];
        if let Some(health) = &self.health {
            tasks.push(health.spawn(shutdown.child_token()));
        }
        tasks
    }

    /// False when a health monitor is present and too few workers are alive
    pub fn is_system_healthy(&self) -> bool {
        self.health
            .as_ref()
            .map_or(true, |health| health.is_system_healthy())
    }
}

/// Caps concurrent WebSocket connections
pub struct ConnectionLimiter {
    permits: Arc<Semaphore>,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Reserve a slot for one connection; released when the permit drops
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    pub fn active(&self) -> usize {
        self.max - self.permits.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Pass-through client for the recognition engine's status endpoints
#[derive(Clone)]
pub struct EngineProxy {
    client: reqwest::Client,
    base_url: String,
}

impl EngineProxy {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .build()
            .context("Failed to build proxy client")?;

        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
        })
    }

    /// GET `path` on the engine, returning status and body
    pub async fn get(&self, path: &str) -> Result<(u16, Bytes)> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("Recognition engine unreachable at {}", self.base_url))?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .context("Failed to read engine response")?;
        Ok((status, body))
    }
}
