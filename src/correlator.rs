//! Result correlation for the queue backend
//!
//! Workers publish each chunk result on a per-session topic and also keep it
//! in a short-lived backlog. A subscription replays the backlog first, then
//! follows the live feed, forwarding every chunk index at most once.

use crate::dispatch::ChunkResult;
use crate::nats::messages::ResultMessage;
use anyhow::{Context, Result};
use futures::channel::mpsc as feed;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Raw result payloads as they arrive on a live topic
pub type ResultFeed = BoxStream<'static, Vec<u8>>;

/// Capacity of the correlated output channel
const OUTPUT_BUFFER: usize = 100;

/// Where chunk results for a session can be read from
#[async_trait::async_trait]
pub trait ResultSource: Send + Sync {
    /// Open the live result topic of a session
    async fn live(&self, session_id: &str) -> Result<ResultFeed>;

    /// Results already persisted for a session, oldest first
    async fn backlog(&self, session_id: &str) -> Result<Vec<Vec<u8>>>;
}

/// Merges backlog and live results into one deduplicated feed per session
#[derive(Clone)]
pub struct ResultCorrelator {
    source: Arc<dyn ResultSource>,
}

/// Handle to a running correlation task
///
/// Cancelling (or dropping) the handle stops reading the live topic. The
/// output channel closes once the forwarding task has exited.
pub struct ResultSubscription {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ResultSubscription {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the forwarding task to exit
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Result forwarding task panicked: {}", e);
            }
        }
    }
}

impl Drop for ResultSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl ResultCorrelator {
    pub fn new(source: Arc<dyn ResultSource>) -> Self {
        Self { source }
    }

    /// Subscribe to the results of one session.
    ///
    /// Fails only if the live topic cannot be opened; a failing backlog read
    /// is logged and the live feed is still followed.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<(mpsc::Receiver<ChunkResult>, ResultSubscription)> {
        let live = self
            .source
            .live(session_id)
            .await
            .with_context(|| format!("Failed to subscribe to results of {}", session_id))?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let token = CancellationToken::new();

        let handle = tokio::spawn(forward_results(
            session_id.to_string(),
            Arc::clone(&self.source),
            live,
            tx,
            token.clone(),
        ));

        debug!("Result subscription opened for session {}", session_id);

        Ok((
            rx,
            ResultSubscription {
                token,
                handle: Some(handle),
            },
        ))
    }
}

async fn forward_results(
    session_id: String,
    source: Arc<dyn ResultSource>,
    mut live: ResultFeed,
    tx: mpsc::Sender<ChunkResult>,
    token: CancellationToken,
) {
    let mut forwarder = Forwarder {
        session_id: &session_id,
        sent: HashSet::new(),
        tx: &tx,
        token: &token,
    };

    let backlog = tokio::select! {
        _ = token.cancelled() => return,
        backlog = source.backlog(&session_id) => backlog,
    };

    match backlog {
        Ok(entries) => {
            if !entries.is_empty() {
                info!(
                    "Replaying {} stored results for session {}",
                    entries.len(),
                    session_id
                );
            }
            for payload in entries {
                if !forwarder.emit(&payload).await {
                    return;
                }
            }
        }
        Err(e) => error!(
            "Failed to fetch stored results for session {}: {:#}",
            session_id, e
        ),
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = live.next() => match next {
                Some(payload) => {
                    if !forwarder.emit(&payload).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    debug!("Result subscription closed for session {}", session_id);
}

struct Forwarder<'a> {
    session_id: &'a str,
    sent: HashSet<u32>,
    tx: &'a mpsc::Sender<ChunkResult>,
    token: &'a CancellationToken,
}

impl Forwarder<'_> {
    /// Decode and forward one payload; false once forwarding should stop
    async fn emit(&mut self, payload: &[u8]) -> bool {
        let message = match ResultMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping malformed result for session {}: {}",
                    self.session_id, e
                );
                return true;
            }
        };

        if !self.sent.insert(message.chunk_index) {
            debug!(
                "Duplicate result for session {} chunk {}",
                self.session_id, message.chunk_index
            );
            return true;
        }

        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.tx.send(ChunkResult::from(message)) => sent.is_ok(),
        }
    }
}

/// In-process result bus with the same semantics as the NATS topics
#[derive(Default)]
pub struct MemoryResultBus {
    inner: Mutex<BusInner>,
}

#[derive(Default)]
struct BusInner {
    backlog: HashMap<String, Vec<Vec<u8>>>,
    subscribers: HashMap<String, Vec<feed::UnboundedSender<Vec<u8>>>>,
}

impl MemoryResultBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish live and keep a copy in the backlog, as workers do
    pub fn publish(&self, session_id: &str, payload: Vec<u8>) {
        self.persist(session_id, payload.clone());
        self.publish_live(session_id, payload);
    }

    /// Publish on the live topic only
    pub fn publish_live(&self, session_id: &str, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = inner.subscribers.get_mut(session_id) {
            subscribers.retain(|sub| sub.unbounded_send(payload.clone()).is_ok());
        }
    }

    /// Store in the backlog only
    pub fn persist(&self, session_id: &str, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .backlog
            .entry(session_id.to_string())
            .or_default()
            .push(payload);
    }

    /// End every live feed of a session
    pub fn close(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.remove(session_id);
    }

    /// Live subscribers whose feed is still open
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.subscribers.get_mut(session_id) {
            Some(subscribers) => {
                subscribers.retain(|sub| !sub.is_closed());
                subscribers.len()
            }
            None => 0,
        }
    }
}

#[async_trait::async_trait]
impl ResultSource for MemoryResultBus {
    async fn live(&self, session_id: &str) -> Result<ResultFeed> {
        let (tx, rx) = feed::unbounded();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }

    async fn backlog(&self, session_id: &str) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.backlog.get(session_id).cloned().unwrap_or_default())
    }
}
