pub mod channels;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod phone;
pub mod prepare;
pub mod recovery;
pub mod repository;
pub mod segment;
pub mod template;
pub mod types;
pub mod webhook;
pub mod worker;

pub use config::Config;
pub use dispatcher::{DispatchOutcome, Dispatcher, MessagingApiClient, ProviderReceipt, RetryPolicy};
pub use error::{ApiError, ConfigError, PreparationError, RepositoryError, SubmitError};
pub use prepare::{BulkSendPreparer, BulkSendRequest, ContactDirectory, TemplateCatalog};
pub use repository::{InMemoryQueueRepository, QueueRepository};
pub use types::{QueueEntry, QueueStatus};

use self::config::resolve_database_url;
use self::db::SqlQueueRepository;
use self::phone::PhoneNormalizer;
use self::prepare::{enqueue_batch, EnqueueReport, SkippedRecipient};
use self::recovery::StuckRecoveryMonitor;
use self::types::{CancelOutcome, QueueCounts};
use self::webhook::{ProviderStatusUpdate, StatusUpdateOutcome};
use self::worker::{spawn_workers, WorkerExit, WorkerSettings};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// Safe to call more than once.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitReport {
    pub enqueued: EnqueueReport,
    pub skipped: Vec<SkippedRecipient>,
    pub merged_recipients: usize,
}

pub struct DispatchEngine {
    config: Config,
    repo: Arc<dyn QueueRepository>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<StuckRecoveryMonitor>,
}

impl DispatchEngine {
    pub fn new(
        config: Config,
        repo: Arc<dyn QueueRepository>,
        client: Arc<dyn MessagingApiClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let dispatch = &config.dispatch;
        let dispatcher = Dispatcher::new(repo.clone(), client)
            .with_policy(RetryPolicy::from_seconds(
                dispatch.backoff_base_seconds,
                dispatch.backoff_cap,
            ))
            .with_send_timeout(std::time::Duration::from_secs(dispatch.send_timeout_seconds));
        let monitor = StuckRecoveryMonitor::from_config(repo.clone(), dispatch);
        Ok(Self {
            config,
            repo,
            dispatcher: Arc::new(dispatcher),
            monitor: Arc::new(monitor),
        })
    }

    pub async fn connect(config: Config, client: Arc<dyn MessagingApiClient>) -> anyhow::Result<Self> {
        config.validate()?;
        let url = resolve_database_url(&config);
        let repo = SqlQueueRepository::connect(&url, config.database.max_connections).await?;
        Ok(Self::new(config, Arc::new(repo), client)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> Arc<dyn QueueRepository> {
        self.repo.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn recovery_monitor(&self) -> Arc<StuckRecoveryMonitor> {
        self.monitor.clone()
    }

    pub fn preparer(
        &self,
        directory: Arc<dyn ContactDirectory>,
        catalog: Arc<dyn TemplateCatalog>,
    ) -> BulkSendPreparer {
        BulkSendPreparer::new(
            PhoneNormalizer::new(self.config.phone.default_country_code.clone()),
            directory,
            catalog,
            self.config.dispatch.default_max_attempts,
        )
    }

    pub async fn submit(
        &self,
        preparer: &BulkSendPreparer,
        request: &BulkSendRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitReport, SubmitError> {
        let batch = preparer.prepare(request, now).await?;
        let enqueued = enqueue_batch(self.repo.as_ref(), batch.entries).await?;
        if !enqueued.duplicates.is_empty() {
            info!(
                tenant_id = %request.tenant_id,
                duplicates = enqueued.duplicates.len(),
                "entries already queued under the same dedupe key"
            );
        }
        Ok(SubmitReport {
            enqueued,
            skipped: batch.skipped,
            merged_recipients: batch.duplicates,
        })
    }

    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, RepositoryError> {
        let outcome = self.repo.cancel(id, Utc::now()).await?;
        info!(entry_id = %id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    pub async fn on_provider_status_update(
        &self,
        update: &ProviderStatusUpdate,
    ) -> Result<StatusUpdateOutcome, RepositoryError> {
        webhook::on_provider_status_update(self.repo.as_ref(), update).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, RepositoryError> {
        self.repo.counts().await
    }

    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = WorkerSettings::from(&self.config.dispatch);
        let workers = spawn_workers(self.dispatcher.clone(), settings, shutdown_rx.clone());
        let monitor = self.monitor.clone().spawn(shutdown_rx);
        EngineHandle {
            shutdown_tx,
            workers,
            monitor,
        }
    }
}

pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<WorkerExit>>,
    monitor: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn shutdown(self) -> Vec<WorkerExit> {
        let _ = self.shutdown_tx.send(true);
        let exits: Vec<WorkerExit> = join_all(self.workers)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(exit) => Some(exit),
                Err(err) => {
                    warn!("dispatch worker panicked: {err}");
                    None
                }
            })
            .collect();
        let _ = self.monitor.await;
        info!(workers = exits.len(), "dispatch engine stopped");
        exits
    }

    pub async fn run_until_ctrl_c(self) -> Vec<WorkerExit> {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {err}");
        }
        info!("shutdown requested");
        self.shutdown().await
    }
}
