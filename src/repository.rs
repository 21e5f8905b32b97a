use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::types::{
    CancelOutcome, DeliveryStatus, EnqueueOutcome, LastError, QueueCounts, QueueEntry,
    QueueStatus,
};

// Completion writes (mark_*) carry the claim stamp: the `updated_at` that
// `claim_next` wrote. They only apply while the entry is still `processing`
// under that stamp, otherwise they report `ClaimConflict`.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn enqueue(&self, entry: QueueEntry) -> Result<EnqueueOutcome, RepositoryError>;

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, RepositoryError>;

    async fn mark_sent(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn mark_retry(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        last_error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn mark_failed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        attempts: u32,
        last_error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    // `attempts` is left alone.
    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, RepositoryError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<QueueEntry>, RepositoryError>;

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome, RepositoryError>;

    async fn record_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn counts(&self) -> Result<QueueCounts, RepositoryError>;
}

pub fn dispatch_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_at.cmp(&b.scheduled_at))
        .then(a.created_at.cmp(&b.created_at))
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<Uuid, QueueEntry>,
    by_dedupe: HashMap<String, Uuid>,
}

#[derive(Default, Clone)]
pub struct InMemoryQueueRepository {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn settle_claim(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        apply: impl FnOnce(&mut QueueEntry) + Send,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        if entry.status != QueueStatus::Processing || entry.updated_at != claimed_at {
            return Err(RepositoryError::ClaimConflict(id));
        }
        apply(entry);
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn enqueue(&self, entry: QueueEntry) -> Result<EnqueueOutcome, RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(key) = entry.dedupe_key.as_ref() {
            if let Some(existing) = state.by_dedupe.get(key) {
                return Ok(EnqueueOutcome::Duplicate(*existing));
            }
            state.by_dedupe.insert(key.clone(), entry.id);
        }
        let id = entry.id;
        state.entries.insert(id, entry);
        Ok(EnqueueOutcome::Inserted(id))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, RepositoryError> {
        let mut state = self.state.write().await;
        let next_id = state
            .entries
            .values()
            .filter(|entry| entry.is_due(now))
            .min_by(|a, b| dispatch_order(a, b))
            .map(|entry| entry.id);

        let Some(id) = next_id else {
            return Ok(None);
        };
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        entry.status = QueueStatus::Processing;
        entry.updated_at = now;
        Ok(Some(entry.clone()))
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let provider_message_id = provider_message_id.to_string();
        self.settle_claim(id, claimed_at, move |entry| {
            entry.status = QueueStatus::Sent;
            entry.provider_message_id = Some(provider_message_id);
            entry.last_error = None;
            entry.updated_at = now;
            entry.delivery_status = Some(DeliveryStatus::Sent);
            entry.delivery_updated_at = Some(now);
        })
        .await
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        last_error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let last_error = last_error.clone();
        self.settle_claim(id, claimed_at, move |entry| {
            entry.status = QueueStatus::Pending;
            entry.attempts = attempts;
            entry.scheduled_at = scheduled_at;
            entry.last_error = Some(last_error);
            entry.updated_at = now;
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        attempts: u32,
        last_error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let last_error = last_error.clone();
        self.settle_claim(id, claimed_at, move |entry| {
            entry.status = QueueStatus::Failed;
            entry.attempts = attempts;
            entry.last_error = Some(last_error);
            entry.updated_at = now;
        })
        .await
    }

    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, RepositoryError> {
        let mut state = self.state.write().await;
        let mut reclaimed = Vec::new();
        for entry in state.entries.values_mut() {
            if entry.status == QueueStatus::Processing && entry.updated_at < older_than {
                entry.status = QueueStatus::Pending;
                entry.updated_at = now;
                entry.reclaim_count += 1;
                reclaimed.push(entry.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<QueueEntry>, RepositoryError> {
        Ok(self.state.read().await.entries.get(&id).cloned())
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        Ok(match entry.status {
            QueueStatus::Pending => {
                entry.status = QueueStatus::Failed;
                entry.last_error = Some(LastError::cancelled());
                entry.updated_at = now;
                CancelOutcome::Cancelled
            }
            QueueStatus::Processing => CancelOutcome::InFlight,
            QueueStatus::Sent | QueueStatus::Failed => CancelOutcome::AlreadyFinal,
        })
    }

    async fn record_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(entry) = state
            .entries
            .values_mut()
            .find(|entry| entry.provider_message_id.as_deref() == Some(provider_message_id))
        else {
            return Ok(false);
        };
        if !DeliveryStatus::can_advance_to(entry.delivery_status, status) {
            return Ok(false);
        }
        entry.delivery_status = Some(status);
        entry.delivery_updated_at = Some(at);
        Ok(true)
    }

    async fn counts(&self) -> Result<QueueCounts, RepositoryError> {
        let state = self.state.read().await;
        let mut counts = QueueCounts::default();
        for entry in state.entries.values() {
            match entry.status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::Processing => counts.processing += 1,
                QueueStatus::Sent => counts.sent += 1,
                QueueStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
