use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::RefreshCoordinator;
use crate::error::Error;

/// Periodic dashboard refresh on a background task.
///
/// Runs go through the coordinator, so a tick that lands while an
/// on-demand refresh is in flight is skipped rather than queued.
pub struct RefreshScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshScheduler {
    /// Start refreshing every `interval`, beginning immediately.
    pub fn spawn(coordinator: RefreshCoordinator, interval: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(coordinator, interval, rx));
        Self { shutdown, handle }
    }

    /// Stop the loop. A refresh still in its read phase is abandoned and
    /// writes nothing; one already writing completes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::error!("Refresh scheduler task failed: {e}");
        }
    }
}

async fn run_loop(coordinator: RefreshCoordinator, interval: Duration, mut rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = rx.changed() => break,
        }
        if *rx.borrow() {
            break;
        }

        let mut cancel_rx = rx.clone();
        let cancelled = async move {
            let _ = cancel_rx.changed().await;
        };
        match coordinator.refresh_all_until(cancelled).await {
            Ok(report) => log::debug!("Scheduled refresh produced v{}", report.version),
            Err(Error::RefreshCancelled) => break,
            Err(e) if e.is_retryable() => log::warn!("Scheduled refresh skipped: {e}"),
            Err(e) => log::error!("Scheduled refresh failed: {e}"),
        }
    }
    log::debug!("Refresh scheduler stopped");
}
