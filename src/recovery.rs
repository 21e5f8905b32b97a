use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::config::{DispatchConfig, MAX_DURATION_SECONDS};
use crate::error::RepositoryError;
use crate::repository::QueueRepository;

// Reclaims never touch `attempts`.
pub struct StuckRecoveryMonitor {
    repo: Arc<dyn QueueRepository>,
    stale_threshold: Duration,
    interval: std::time::Duration,
    warn_threshold: u32,
}

impl StuckRecoveryMonitor {
    pub fn new(
        repo: Arc<dyn QueueRepository>,
        stale_threshold: Duration,
        interval: std::time::Duration,
        warn_threshold: u32,
    ) -> Self {
        Self {
            repo,
            stale_threshold,
            interval,
            warn_threshold,
        }
    }

    pub fn from_config(repo: Arc<dyn QueueRepository>, cfg: &DispatchConfig) -> Self {
        Self::new(
            repo,
            Duration::seconds(cfg.stale_threshold_seconds.min(MAX_DURATION_SECONDS) as i64),
            std::time::Duration::from_secs(cfg.recovery_interval_seconds),
            cfg.reclaim_warn_threshold,
        )
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let reclaimed = self
            .repo
            .reclaim_stale(now - self.stale_threshold, now)
            .await?;

        for entry in reclaimed
            .iter()
            .filter(|entry| entry.reclaim_count > self.warn_threshold)
        {
            warn!(
                entry_id = %entry.id,
                reclaim_count = entry.reclaim_count,
                attempts = entry.attempts,
                "entry repeatedly stuck in processing"
            );
        }
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed stuck entries");
        }
        Ok(reclaimed.len())
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = sleep(self.interval) => {
                        if let Err(err) = self.run_once(Utc::now()).await {
                            error!("stuck recovery scan failed: {err}");
                        }
                    }
                }
            }
        })
    }
}
