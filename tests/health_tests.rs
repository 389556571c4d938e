// Integration tests for worker health tracking

use anyhow::{bail, Result};
use asr_gateway::health::{HeartbeatSource, StaticHeartbeats, WorkerHealthMonitor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_healthy_only_with_minimum_workers() {
    let heartbeats = Arc::new(StaticHeartbeats::new(1));
    let monitor = WorkerHealthMonitor::new(heartbeats.clone(), 2, Duration::from_secs(15));

    // Nothing counted before the first scan
    assert!(!monitor.is_system_healthy());

    monitor.check_workers().await;
    assert_eq!(monitor.active_workers(), 1);
    assert!(!monitor.is_system_healthy());

    heartbeats.set(2);
    monitor.check_workers().await;
    assert!(monitor.is_system_healthy());

    heartbeats.set(0);
    monitor.check_workers().await;
    assert!(!monitor.is_system_healthy());
}

/// Heartbeat source that can be made to fail
struct FlakyHeartbeats {
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl HeartbeatSource for FlakyHeartbeats {
    async fn live_workers(&self) -> Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("heartbeat store unreachable");
        }
        Ok(3)
    }
}

#[tokio::test]
async fn test_failed_scan_keeps_previous_count() {
    let source = Arc::new(FlakyHeartbeats {
        failing: AtomicBool::new(false),
    });
    let monitor = WorkerHealthMonitor::new(source.clone(), 2, Duration::from_secs(15));

    monitor.check_workers().await;
    assert_eq!(monitor.active_workers(), 3);

    source.failing.store(true, Ordering::SeqCst);
    monitor.check_workers().await;
    assert_eq!(monitor.active_workers(), 3);
    assert!(monitor.is_system_healthy());
}

#[tokio::test]
async fn test_background_polling_until_cancelled() -> Result<()> {
    let heartbeats = Arc::new(StaticHeartbeats::new(4));
    let monitor = Arc::new(WorkerHealthMonitor::new(
        heartbeats.clone(),
        1,
        Duration::from_millis(20),
    ));

    let shutdown = CancellationToken::new();
    let handle = monitor.spawn(shutdown.clone());

    // First check runs immediately
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.active_workers(), 4);

    heartbeats.set(0);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(monitor.active_workers(), 0);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await??;

    Ok(())
}
