use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MAX_DURATION_SECONDS;
use crate::error::{ApiError, ErrorClass, RepositoryError};
use crate::repository::QueueRepository;
use crate::types::{ErrorKind, LastError, MessagePayload, QueueEntry};

pub const DEFAULT_SEND_TIMEOUT_SECONDS: u64 = 30;
const MAX_BACKOFF_EXPONENT: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
}

#[async_trait]
pub trait MessagingApiClient: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<ProviderReceipt, ApiError>;
}

// base * 2^(attempts - 1), capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_seconds(30, 3600)
    }
}

impl RetryPolicy {
    pub fn from_seconds(base_seconds: u64, cap_seconds: u64) -> Self {
        Self {
            base: bounded_seconds(base_seconds),
            cap: bounded_seconds(cap_seconds),
        }
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.max(1).saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let seconds = self
            .base
            .num_seconds()
            .saturating_mul(1_i64 << exponent)
            .min(self.cap.num_seconds());
        Duration::seconds(seconds)
    }
}

fn bounded_seconds(seconds: u64) -> Duration {
    Duration::seconds(seconds.min(MAX_DURATION_SECONDS) as i64)
}

fn error_kind(class: ErrorClass) -> ErrorKind {
    match class {
        ErrorClass::Transient => ErrorKind::Transient,
        ErrorClass::Permanent => ErrorKind::Permanent,
        ErrorClass::Unknown => ErrorKind::Unknown,
    }
}

impl From<&ApiError> for LastError {
    fn from(err: &ApiError) -> Self {
        LastError {
            kind: error_kind(err.classify()),
            message: err.message.clone(),
            http_status: err.http_status,
            code: err.code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent {
        id: Uuid,
        provider_message_id: String,
    },
    Retrying {
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        id: Uuid,
        attempts: u32,
        kind: ErrorKind,
    },
    Superseded { id: Uuid },
}

pub struct Dispatcher {
    repo: Arc<dyn QueueRepository>,
    client: Arc<dyn MessagingApiClient>,
    policy: RetryPolicy,
    send_timeout: std::time::Duration,
}

impl Dispatcher {
    pub fn new(repo: Arc<dyn QueueRepository>, client: Arc<dyn MessagingApiClient>) -> Self {
        Self {
            repo,
            client,
            policy: RetryPolicy::default(),
            send_timeout: std::time::Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECONDS),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: std::time::Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn repository(&self) -> &Arc<dyn QueueRepository> {
        &self.repo
    }

    pub async fn dispatch_next(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchOutcome>, RepositoryError> {
        let Some(entry) = self.repo.claim_next(now).await? else {
            return Ok(None);
        };
        self.process(entry, now).await.map(Some)
    }

    pub async fn process(
        &self,
        entry: QueueEntry,
        claimed_at: DateTime<Utc>,
    ) -> Result<DispatchOutcome, RepositoryError> {
        if entry.attempts >= entry.max_attempts {
            let last_error = entry.last_error.clone().unwrap_or(LastError {
                kind: ErrorKind::Unknown,
                message: "retry budget exhausted".to_string(),
                http_status: None,
                code: None,
            });
            let result = self
                .repo
                .mark_failed(entry.id, entry.updated_at, entry.attempts, &last_error, claimed_at)
                .await;
            return settle(
                entry.id,
                result,
                DispatchOutcome::Failed {
                    id: entry.id,
                    attempts: entry.attempts,
                    kind: last_error.kind,
                },
            );
        }

        let started = Instant::now();
        let result = match timeout(
            self.send_timeout,
            self.client.send(&entry.recipient_phone, &entry.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::timeout(self.send_timeout)),
        };
        let elapsed = Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero());
        let now = claimed_at.checked_add_signed(elapsed).unwrap_or(claimed_at);

        match result {
            Ok(receipt) => {
                let result = self
                    .repo
                    .mark_sent(entry.id, entry.updated_at, &receipt.provider_message_id, now)
                    .await;
                if result.is_ok() {
                    info!(
                        entry_id = %entry.id,
                        provider_message_id = %receipt.provider_message_id,
                        attempts = entry.attempts + 1,
                        "message sent"
                    );
                }
                settle(
                    entry.id,
                    result,
                    DispatchOutcome::Sent {
                        id: entry.id,
                        provider_message_id: receipt.provider_message_id,
                    },
                )
            }
            Err(err) => self.handle_failure(&entry, &err, now).await,
        }
    }

    async fn handle_failure(
        &self,
        entry: &QueueEntry,
        err: &ApiError,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, RepositoryError> {
        let attempts = entry.attempts + 1;
        let last_error = LastError::from(err);
        let retryable = match err.classify() {
            ErrorClass::Transient | ErrorClass::Unknown => true,
            ErrorClass::Permanent => false,
        };

        // a retry time past the calendar range fails the entry instead
        let next_attempt_at = (retryable && attempts < entry.max_attempts)
            .then(|| now.checked_add_signed(self.policy.backoff(attempts)))
            .flatten();
        if let Some(next_attempt_at) = next_attempt_at {
            let result = self
                .repo
                .mark_retry(entry.id, entry.updated_at, attempts, next_attempt_at, &last_error, now)
                .await;
            if result.is_ok() {
                warn!(
                    entry_id = %entry.id,
                    attempts,
                    max_attempts = entry.max_attempts,
                    kind = last_error.kind.as_str(),
                    next_attempt_at = %next_attempt_at,
                    "send failed, retrying: {}",
                    err
                );
            }
            return settle(
                entry.id,
                result,
                DispatchOutcome::Retrying {
                    id: entry.id,
                    attempts,
                    next_attempt_at,
                },
            );
        }

        let result = self
            .repo
            .mark_failed(entry.id, entry.updated_at, attempts, &last_error, now)
            .await;
        if result.is_ok() {
            warn!(
                entry_id = %entry.id,
                attempts,
                kind = last_error.kind.as_str(),
                "send failed permanently: {}",
                err
            );
        }
        settle(
            entry.id,
            result,
            DispatchOutcome::Failed {
                id: entry.id,
                attempts,
                kind: last_error.kind,
            },
        )
    }
}

fn settle(
    id: Uuid,
    result: Result<(), RepositoryError>,
    outcome: DispatchOutcome,
) -> Result<DispatchOutcome, RepositoryError> {
    match result {
        Ok(()) => Ok(outcome),
        Err(RepositoryError::ClaimConflict(_)) => {
            debug!(entry_id = %id, "entry changed state during send, outcome dropped");
            Ok(DispatchOutcome::Superseded { id })
        }
        Err(err) => Err(err),
    }
}
