//! Worker liveness tracking for admission control
//!
//! Queue-backend workers refresh a heartbeat key with a short expiry. The
//! monitor periodically counts live keys; admission refuses new sessions
//! while fewer than the configured minimum are alive.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of worker liveness signals
#[async_trait::async_trait]
pub trait HeartbeatSource: Send + Sync {
    /// Number of workers with an unexpired heartbeat
    async fn live_workers(&self) -> Result<usize>;
}

/// Fixed worker count, for tests and backends without external workers
#[derive(Debug, Default)]
pub struct StaticHeartbeats {
    count: AtomicUsize,
}

impl StaticHeartbeats {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    pub fn set(&self, count: usize) {
        self.count.store(count, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl HeartbeatSource for StaticHeartbeats {
    async fn live_workers(&self) -> Result<usize> {
        Ok(self.count.load(Ordering::SeqCst))
    }
}

pub struct WorkerHealthMonitor {
    source: Arc<dyn HeartbeatSource>,
    active: AtomicUsize,
    min_workers: usize,
    interval: Duration,
}

impl WorkerHealthMonitor {
    pub fn new(source: Arc<dyn HeartbeatSource>, min_workers: usize, interval: Duration) -> Self {
        Self {
            source,
            active: AtomicUsize::new(0),
            min_workers,
            interval,
        }
    }

    /// Refresh the live worker count. A failed scan keeps the previous count.
    pub async fn check_workers(&self) {
        match self.source.live_workers().await {
            Ok(count) => {
                let previous = self.active.swap(count, Ordering::SeqCst);
                if previous != count {
                    info!("Active workers: {} (was {})", count, previous);
                } else {
                    debug!("Health check: {} active workers", count);
                }
                if count < self.min_workers {
                    warn!(
                        "Only {} workers alive, {} required to admit sessions",
                        count, self.min_workers
                    );
                }
            }
            Err(e) => error!("Failed to scan worker heartbeats: {:#}", e),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    /// True when at least the minimum number of workers is alive
    pub fn is_system_healthy(&self) -> bool {
        self.active_workers() >= self.min_workers
    }

    /// Check immediately, then on every interval until `shutdown` fires
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Worker health monitor stopped");
                        return;
                    }
                    _ = ticker.tick() => monitor.check_workers().await,
                }
            }
        })
    }
}
