use super::{ChunkDispatcher, ChunkTask, DispatchError, DispatcherLoad};
use crate::nats::messages::TaskMessage;
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Origin tag stamped on published tasks
pub const DEFAULT_ORIGIN: &str = "asr-gateway";

/// Capped append-only task log read by external workers
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    /// Number of entries currently retained
    async fn depth(&self) -> Result<u64>;

    /// Append one encoded task
    async fn append(&self, payload: Vec<u8>) -> Result<()>;
}

/// Publishes chunks to a [`TaskQueue`], rejecting work above a depth ceiling
pub struct QueueDispatcher {
    queue: Arc<dyn TaskQueue>,
    ceiling: u64,
    origin: String,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, ceiling: u64) -> Self {
        Self {
            queue,
            ceiling,
            origin: DEFAULT_ORIGIN.to_string(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }
}

#[async_trait::async_trait]
impl ChunkDispatcher for QueueDispatcher {
    async fn submit(&self, task: ChunkTask) -> Result<(), DispatchError> {
        // The depth check must precede the append
        match self.queue.depth().await {
            Ok(depth) if depth > self.ceiling => {
                warn!(
                    "Rejecting chunk {} of session {}: queue depth {} above {}",
                    task.chunk_index, task.session_id, depth, self.ceiling
                );
                return Err(DispatchError::Overloaded {
                    depth,
                    ceiling: self.ceiling,
                });
            }
            Ok(_) => {}
            // The append below surfaces a broken queue anyway
            Err(e) => error!("Failed to read queue depth: {:#}", e),
        }

        let message = TaskMessage::stream_chunk(
            &task.session_id,
            task.chunk_index,
            &task.audio,
            &self.origin,
        );
        let payload = serde_json::to_vec(&message).map_err(anyhow::Error::from)?;

        self.queue
            .append(payload)
            .await
            .map_err(|e| DispatchError::Backend(e.context("Stream publish failed")))?;

        debug!(
            "Queued chunk {} of session {}",
            task.chunk_index, task.session_id
        );

        Ok(())
    }

    async fn load(&self) -> Result<DispatcherLoad> {
        Ok(DispatcherLoad {
            backend: self.name(),
            in_flight: 0,
            queue_depth: Some(self.queue.depth().await?),
        })
    }

    fn uses_result_feed(&self) -> bool {
        true
    }

    async fn stop(&self) {}

    fn name(&self) -> &'static str {
        "queue"
    }
}

/// In-memory work queue holding at most `max_len` unconsumed entries
pub struct MemoryQueue {
    entries: Mutex<VecDeque<Vec<u8>>>,
    max_len: usize,
    /// Extra depth reported on top of the stored entries
    phantom_depth: AtomicU64,
}

impl MemoryQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_len,
            phantom_depth: AtomicU64::new(0),
        }
    }

    /// Pretend `depth` entries are already waiting
    pub fn set_backlog(&self, depth: u64) {
        self.phantom_depth.store(depth, Ordering::SeqCst);
    }

    /// Consume the oldest entry, as a worker would
    pub async fn pop(&self) -> Option<Vec<u8>> {
        self.entries.lock().await.pop_front()
    }

    pub async fn entries(&self) -> Vec<Vec<u8>> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl TaskQueue for MemoryQueue {
    async fn depth(&self) -> Result<u64> {
        let stored = self.entries.lock().await.len() as u64;
        Ok(stored + self.phantom_depth.load(Ordering::SeqCst))
    }

    async fn append(&self, payload: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let depth = entries.len() as u64 + self.phantom_depth.load(Ordering::SeqCst);
        if depth >= self.max_len as u64 {
            bail!("task queue full ({} entries)", depth);
        }
        entries.push_back(payload);
        Ok(())
    }
}
