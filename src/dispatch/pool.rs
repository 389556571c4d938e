use super::{ChunkDispatcher, ChunkResult, ChunkTask, DispatchError, DispatcherLoad};
use crate::recognizer::Recognizer;
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queued tasks allowed per worker before `submit` starts waiting
const QUEUE_SLOTS_PER_WORKER: usize = 10;

/// Fixed-size pool of recognition workers draining one bounded queue
pub struct WorkerPool {
    size: usize,
    task_tx: Mutex<Option<mpsc::Sender<ChunkTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `size * 10` slots
    pub fn start(size: usize, recognizer: Arc<dyn Recognizer>) -> Self {
        let size = size.max(1);
        let (task_tx, task_rx) = mpsc::channel::<ChunkTask>(size * QUEUE_SLOTS_PER_WORKER);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&task_rx),
                    Arc::clone(&recognizer),
                    Arc::clone(&active),
                ))
            })
            .collect();

        info!("Worker pool started with {} workers", size);

        Self {
            size,
            task_tx: Mutex::new(Some(task_tx)),
            workers: Mutex::new(workers),
            active,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of workers currently recognizing a chunk
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

async fn run_worker(
    id: usize,
    task_rx: Arc<Mutex<mpsc::Receiver<ChunkTask>>>,
    recognizer: Arc<dyn Recognizer>,
    active: Arc<AtomicUsize>,
) {
    loop {
        // Hold the receiver lock only while waiting for the next task
        let task = {
            let mut rx = task_rx.lock().await;
            rx.recv().await
        };

        let Some(task) = task else {
            debug!("Worker {} exiting", id);
            return;
        };

        active.fetch_add(1, Ordering::SeqCst);

        let result = match recognizer.recognize(&task.audio).await {
            Ok(recognition) => {
                ChunkResult::ok(task.chunk_index, recognition.text, recognition.duration)
            }
            Err(e) => {
                warn!(
                    "Recognition failed for session {} chunk {}: {:#}",
                    task.session_id, task.chunk_index, e
                );
                ChunkResult::failed(task.chunk_index, format!("{:#}", e))
            }
        };

        active.fetch_sub(1, Ordering::SeqCst);

        match task.respond_to {
            Some(slot) => {
                if slot.send(result).is_err() {
                    debug!(
                        "Result for session {} chunk {} dropped: caller went away",
                        task.session_id, task.chunk_index
                    );
                }
            }
            None => debug!(
                "Chunk {} of session {} had no response slot",
                task.chunk_index, task.session_id
            ),
        }
    }
}

#[async_trait::async_trait]
impl ChunkDispatcher for WorkerPool {
    async fn submit(&self, task: ChunkTask) -> Result<(), DispatchError> {
        // Clone the sender so a full queue does not block `stop`
        let tx = {
            let guard = self.task_tx.lock().await;
            guard.clone().ok_or(DispatchError::Stopped)?
        };

        tx.send(task).await.map_err(|_| DispatchError::Stopped)
    }

    async fn load(&self) -> Result<DispatcherLoad> {
        Ok(DispatcherLoad {
            backend: self.name(),
            in_flight: self.active_workers(),
            queue_depth: None,
        })
    }

    fn uses_result_feed(&self) -> bool {
        false
    }

    async fn stop(&self) {
        // Closing the queue lets workers finish what is queued, then exit
        self.task_tx.lock().await.take();

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker panicked: {}", e);
            }
        }

        info!("Worker pool stopped");
    }

    fn name(&self) -> &'static str {
        "pool"
    }
}
