use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RepositoryError;
use crate::repository::QueueRepository;
use crate::types::DeliveryStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatusError {
    pub code: Option<String>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatusUpdate {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<ProviderStatusError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdateOutcome {
    Applied,
    Ignored,
}

pub async fn on_provider_status_update(
    repo: &dyn QueueRepository,
    update: &ProviderStatusUpdate,
) -> Result<StatusUpdateOutcome, RepositoryError> {
    let applied = repo
        .record_delivery_status(&update.provider_message_id, update.status, update.timestamp)
        .await?;
    if !applied {
        debug!(
            provider_message_id = %update.provider_message_id,
            status = update.status.as_str(),
            "delivery report ignored"
        );
        return Ok(StatusUpdateOutcome::Ignored);
    }

    match (&update.status, &update.error) {
        (DeliveryStatus::Failed, Some(err)) => warn!(
            provider_message_id = %update.provider_message_id,
            code = err.code.as_deref().unwrap_or("-"),
            "delivery failed: {}",
            err.title
        ),
        _ => info!(
            provider_message_id = %update.provider_message_id,
            status = update.status.as_str(),
            "delivery status updated"
        ),
    }
    Ok(StatusUpdateOutcome::Applied)
}

#[derive(Debug, Default, Deserialize)]
struct WebhookBody {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: WebhookValue,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookValue {
    #[serde(default)]
    statuses: Vec<RawStatus>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    id: String,
    status: String,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    errors: Vec<RawStatusError>,
}

#[derive(Debug, Deserialize)]
struct RawStatusError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn unix_seconds(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        serde_json::Value::String(s) => s.parse::<i64>().ok()?,
        serde_json::Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

// Statuses not tracked here (e.g. `deleted`) and reports without a
// usable timestamp are dropped.
pub fn parse_whatsapp_statuses(body: &serde_json::Value) -> Result<Vec<ProviderStatusUpdate>, serde_json::Error> {
    let body = WebhookBody::deserialize(body)?;
    let mut updates = Vec::new();
    for raw in body
        .entry
        .into_iter()
        .flat_map(|entry| entry.changes)
        .flat_map(|change| change.value.statuses)
    {
        let Ok(status) = raw.status.parse::<DeliveryStatus>() else {
            debug!(provider_message_id = %raw.id, status = %raw.status, "untracked delivery status");
            continue;
        };
        let Some(timestamp) = raw.timestamp.as_ref().and_then(unix_seconds) else {
            debug!(provider_message_id = %raw.id, "delivery report without timestamp");
            continue;
        };
        let error = raw.errors.into_iter().next().map(|err| ProviderStatusError {
            code: err.code.map(|code| match code {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
            title: err.title.or(err.message).unwrap_or_default(),
        });
        updates.push(ProviderStatusUpdate {
            provider_message_id: raw.id,
            status,
            timestamp,
            error,
        });
    }
    Ok(updates)
}
