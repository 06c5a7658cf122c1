use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use super::JobStore;

/// Periodic eviction of finished jobs.
///
/// The sweep loop only runs while the store holds at least one job: it is started on
/// demand via [`RetentionSweeper::ensure_running`] and exits once the store is empty.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<JobStore>,
    interval: Duration,
    retention: Duration,
    running: Arc<AtomicBool>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<JobStore>, interval: Duration, retention: Duration) -> Self {
        Self {
            store,
            interval,
            retention,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the sweep loop unless it is already running.
    ///
    /// Returns true if a new loop was spawned. Outside a Tokio runtime nothing is started.
    pub fn ensure_running(&self) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            warn!("Retention sweeper not started: no Tokio runtime");
            return false;
        };

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _handle = self.spawn_sweep_loop(&runtime);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one sweep immediately
    pub async fn sweep_now(&self) -> usize {
        sweep_once(&self.store, self.retention).await
    }

    fn spawn_sweep_loop(&self, runtime: &Handle) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let running = Arc::clone(&self.running);
        let period = self.interval;
        let retention = self.retention;

        runtime.spawn(async move {
            info!(
                "Retention sweeper started (interval {:?}, retention {:?})",
                period, retention
            );
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                ticker.tick().await;
                sweep_once(&store, retention).await;

                if !store.is_empty() {
                    continue;
                }

                running.store(false, Ordering::Release);

                // A job may have been created between the emptiness check and the flag
                // reset; reclaim the loop in that case instead of leaving it unswept.
                if !store.is_empty()
                    && running
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    continue;
                }
                break;
            }

            info!("Retention sweeper stopped: no jobs tracked");
        })
    }
}

async fn sweep_once(store: &JobStore, retention: Duration) -> usize {
    match store.sweep_expired(retention, Utc::now()).await {
        Ok(removed) => {
            debug!("Retention sweep finished, {} jobs removed", removed);
            removed
        }
        Err(e) => {
            error!("Retention sweep failed: {}", e);
            0
        }
    }
}
