//! Chunk dispatch
//!
//! Every accepted audio chunk is handed to one of two interchangeable
//! backends behind [`ChunkDispatcher`]:
//! - [`WorkerPool`]: bounded in-process pool calling the recognition engine
//!   directly, answering through the task's private response slot
//! - [`QueueDispatcher`]: capped JetStream task log consumed by external
//!   workers; results come back through the result correlator

mod pool;
mod queue;

pub use pool::WorkerPool;
pub use queue::{MemoryQueue, QueueDispatcher, TaskQueue, DEFAULT_ORIGIN};

use crate::config::{BackendKind, Config};
use crate::nats::NatsClient;
use crate::recognizer::HttpRecognizer;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// One indexed slice of session audio on its way to recognition
#[derive(Debug)]
pub struct ChunkTask {
    pub session_id: String,
    pub chunk_index: u32,
    /// Raw audio as received from the client
    pub audio: Vec<u8>,
    /// Private response slot, only used by the worker pool
    pub respond_to: Option<oneshot::Sender<ChunkResult>>,
}

impl ChunkTask {
    pub fn new(session_id: impl Into<String>, chunk_index: u32, audio: Vec<u8>) -> Self {
        Self {
            session_id: session_id.into(),
            chunk_index,
            audio,
            respond_to: None,
        }
    }

    /// Attach a response slot and return the receiving end
    pub fn with_response(mut self) -> (Self, oneshot::Receiver<ChunkResult>) {
        let (tx, rx) = oneshot::channel();
        self.respond_to = Some(tx);
        (self, rx)
    }
}

/// Recognition outcome for one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub chunk_index: u32,
    pub text: String,
    /// Audio duration in seconds as reported by the engine
    pub duration: f64,
    pub error: Option<String>,
}

impl ChunkResult {
    pub fn ok(chunk_index: u32, text: impl Into<String>, duration: f64) -> Self {
        Self {
            chunk_index,
            text: text.into(),
            duration,
            error: None,
        }
    }

    pub fn failed(chunk_index: u32, error: impl Into<String>) -> Self {
        Self {
            chunk_index,
            text: String::new(),
            duration: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Downstream capacity exhausted; the caller should retry later
    #[error("system overloaded: queue depth {depth} exceeds {ceiling}")]
    Overloaded { depth: u64, ceiling: u64 },

    #[error("dispatcher stopped")]
    Stopped,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Overloaded { .. })
    }
}

/// Current load of a dispatcher, for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherLoad {
    pub backend: &'static str,
    /// Chunks currently being recognized in-process
    pub in_flight: usize,
    /// Entries waiting in the task log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
}

/// Hands chunks to a processing backend
#[async_trait::async_trait]
pub trait ChunkDispatcher: Send + Sync {
    /// Accept or reject one chunk
    async fn submit(&self, task: ChunkTask) -> Result<(), DispatchError>;

    /// Current load for health reporting
    async fn load(&self) -> Result<DispatcherLoad>;

    /// Whether results arrive through the result correlator instead of the
    /// task's response slot
    fn uses_result_feed(&self) -> bool;

    /// Stop accepting work and wait for in-process work to drain
    async fn stop(&self);

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Builds the dispatcher selected by configuration
pub struct DispatcherFactory;

impl DispatcherFactory {
    pub fn create(
        config: &Config,
        nats: Option<Arc<NatsClient>>,
    ) -> Result<Arc<dyn ChunkDispatcher>> {
        match config.dispatch.backend {
            BackendKind::Pool => {
                let recognizer = Arc::new(HttpRecognizer::new(&config.recognizer)?);
                Ok(Arc::new(WorkerPool::start(
                    config.dispatch.pool_size,
                    recognizer,
                )))
            }
            BackendKind::Queue => {
                let Some(nats) = nats else {
                    anyhow::bail!("Queue backend requires a NATS connection")
                };
                Ok(Arc::new(QueueDispatcher::new(
                    nats,
                    config.dispatch.queue_ceiling,
                )))
            }
        }
    }
}
