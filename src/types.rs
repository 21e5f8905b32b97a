use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::template::BoundTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for QueueStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    // forward only; `failed` is only accepted before delivery
    pub fn can_advance_to(current: Option<DeliveryStatus>, next: DeliveryStatus) -> bool {
        match (current, next) {
            (None, _) => true,
            (Some(DeliveryStatus::Sent), DeliveryStatus::Sent) => false,
            (Some(DeliveryStatus::Sent), _) => true,
            (Some(DeliveryStatus::Delivered), DeliveryStatus::Read) => true,
            (Some(DeliveryStatus::Delivered), _) => false,
            (Some(DeliveryStatus::Read), _) => false,
            (Some(DeliveryStatus::Failed), _) => false,
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Unknown,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub code: Option<String>,
}

impl LastError {
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "cancelled by operator".to_string(),
            http_status: None,
            code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Template(BoundTemplate),
    Text { body: String },
}

impl MessagePayload {
    pub fn template_name(&self) -> Option<&str> {
        match self {
            MessagePayload::Template(bound) => Some(bound.name.as_str()),
            MessagePayload::Text { .. } => None,
        }
    }

    pub fn template_language(&self) -> Option<&str> {
        match self {
            MessagePayload::Template(bound) => Some(bound.language.as_str()),
            MessagePayload::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub recipient_phone: String,
    pub payload: MessagePayload,
    pub priority: i32,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub provider_message_id: Option<String>,
    pub last_error: Option<LastError>,
    pub reclaim_count: u32,
    pub delivery_status: Option<DeliveryStatus>,
    pub delivery_updated_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new_pending(
        tenant_id: &str,
        recipient_phone: String,
        payload: MessagePayload,
        priority: i32,
        max_attempts: u32,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            recipient_phone,
            payload,
            priority,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts,
            scheduled_at,
            created_at: now,
            updated_at: now,
            dedupe_key: None,
            provider_message_id: None,
            last_error: None,
            reclaim_count: 0,
            delivery_status: None,
            delivery_updated_at: None,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn is_final(&self) -> bool {
        match self.status {
            QueueStatus::Sent | QueueStatus::Failed => true,
            QueueStatus::Pending | QueueStatus::Processing => false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.scheduled_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted(Uuid),
    Duplicate(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    InFlight,
    AlreadyFinal,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed
    }
}
