use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::dispatcher::Dispatcher;

const STORAGE_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub storage_retry_limit: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for WorkerSettings {
    fn from(cfg: &DispatchConfig) -> Self {
        Self {
            worker_count: cfg.worker_count,
            poll_interval: Duration::from_millis(cfg.poll_interval_millis),
            storage_retry_limit: cfg.storage_retry_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    StorageUnavailable,
}

pub fn storage_backoff(poll_interval: Duration, failures: u32) -> Duration {
    let exponent = failures.max(1).saturating_sub(1).min(16);
    poll_interval
        .saturating_mul(1_u32 << exponent)
        .min(STORAGE_BACKOFF_CAP)
}

async fn idle(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = sleep(delay) => false,
    }
}

pub async fn run_worker(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    settings: WorkerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerExit {
    let mut storage_failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            debug!(worker_id, "worker stopping");
            return WorkerExit::Shutdown;
        }

        let delay = match dispatcher.dispatch_next(Utc::now()).await {
            Ok(Some(outcome)) => {
                storage_failures = 0;
                debug!(worker_id, ?outcome, "attempt finished");
                continue;
            }
            Ok(None) => {
                storage_failures = 0;
                settings.poll_interval
            }
            Err(err) => {
                storage_failures += 1;
                if storage_failures > settings.storage_retry_limit {
                    error!(
                        worker_id,
                        failures = storage_failures,
                        "critical: queue storage unavailable, worker giving up: {err}"
                    );
                    return WorkerExit::StorageUnavailable;
                }
                let delay = storage_backoff(settings.poll_interval, storage_failures);
                warn!(
                    worker_id,
                    failures = storage_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "queue storage error: {err}"
                );
                delay
            }
        };

        if idle(&mut shutdown, delay).await {
            debug!(worker_id, "worker stopping");
            return WorkerExit::Shutdown;
        }
    }
}

pub fn spawn_workers(
    dispatcher: Arc<Dispatcher>,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<WorkerExit>> {
    info!(workers = settings.worker_count, "starting dispatch workers");
    (0..settings.worker_count)
        .map(|worker_id| {
            tokio::spawn(run_worker(
                worker_id,
                dispatcher.clone(),
                settings,
                shutdown.clone(),
            ))
        })
        .collect()
}
