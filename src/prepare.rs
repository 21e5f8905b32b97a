use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BindingError, NormalizationError, PreparationError, RepositoryError};
use crate::phone::PhoneNormalizer;
use crate::repository::QueueRepository;
use crate::template::{bind, Template, TemplateParameters, TemplateStatus};
use crate::types::{EnqueueOutcome, MessagePayload, QueueEntry};

pub const PHONE_TOKEN: &str = "phone";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RecipientRef {
    Contact(String),
    Group(String),
    Segment(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub phone: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl ContactRecord {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn resolve(&self, refs: &[RecipientRef]) -> anyhow::Result<Vec<ContactRecord>>;
}

#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn get(&self, name: &str, language: &str) -> anyhow::Result<Option<Template>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSpec {
    Template {
        name: String,
        language: String,
        #[serde(default)]
        parameters: TemplateParameters,
    },
    Text {
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<RecipientRef>,
    pub message: MessageSpec,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub delay_seconds: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    // dedupe_key = "<scope>:<e164>"
    #[serde(default)]
    pub dedupe_scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum SkipReason {
    Normalization { error: NormalizationError },
    Binding { error: BindingError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecipient {
    pub raw: String,
    pub reason: SkipReason,
}

impl SkippedRecipient {
    pub fn reason_code(&self) -> &'static str {
        match &self.reason {
            SkipReason::Normalization { error } => error.reason(),
            SkipReason::Binding { error } => error.kind(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedBatch {
    pub entries: Vec<QueueEntry>,
    pub skipped: Vec<SkippedRecipient>,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub inserted: Vec<Uuid>,
    pub duplicates: Vec<Uuid>,
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("token regex is valid"))
}

fn scheduled_after(now: DateTime<Utc>, delay_seconds: u64) -> Result<DateTime<Utc>, PreparationError> {
    i64::try_from(delay_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or(PreparationError::InvalidDelay {
            seconds: delay_seconds,
        })
}

// unknown fields become empty strings
pub fn substitute_tokens(value: &str, fields: &HashMap<String, String>, e164: &str) -> String {
    token_regex()
        .replace_all(value, |caps: &Captures| {
            let key = &caps[1];
            if key == PHONE_TOKEN {
                return e164.to_string();
            }
            fields.get(key).cloned().unwrap_or_default()
        })
        .into_owned()
}

enum ResolvedMessage {
    Template {
        template: Template,
        parameters: TemplateParameters,
    },
    Text {
        body: String,
    },
}

pub struct BulkSendPreparer {
    normalizer: PhoneNormalizer,
    directory: Arc<dyn ContactDirectory>,
    catalog: Arc<dyn TemplateCatalog>,
    default_max_attempts: u32,
}

impl BulkSendPreparer {
    pub fn new(
        normalizer: PhoneNormalizer,
        directory: Arc<dyn ContactDirectory>,
        catalog: Arc<dyn TemplateCatalog>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            normalizer,
            directory,
            catalog,
            default_max_attempts,
        }
    }

    async fn resolve_message(&self, spec: &MessageSpec) -> Result<ResolvedMessage, PreparationError> {
        match spec {
            MessageSpec::Text { body } => Ok(ResolvedMessage::Text { body: body.clone() }),
            MessageSpec::Template {
                name,
                language,
                parameters,
            } => {
                let template = self
                    .catalog
                    .get(name, language)
                    .await
                    .map_err(PreparationError::Catalog)?
                    .ok_or_else(|| PreparationError::TemplateNotFound {
                        name: name.clone(),
                        language: language.clone(),
                    })?;
                if template.status != TemplateStatus::Approved {
                    return Err(PreparationError::TemplateNotApproved { name: name.clone() });
                }
                template
                    .validate()
                    .map_err(|source| PreparationError::InvalidTemplate {
                        name: name.clone(),
                        source,
                    })?;
                Ok(ResolvedMessage::Template {
                    template,
                    parameters: parameters.clone(),
                })
            }
        }
    }

    async fn collect_recipients(
        &self,
        request: &BulkSendRequest,
    ) -> Result<Vec<ContactRecord>, PreparationError> {
        let mut records: Vec<ContactRecord> = request
            .phone_numbers
            .iter()
            .map(ContactRecord::new)
            .collect();
        if !request.recipients.is_empty() {
            let resolved = self
                .directory
                .resolve(&request.recipients)
                .await
                .map_err(PreparationError::Directory)?;
            records.extend(resolved);
        }
        Ok(records)
    }

    pub async fn prepare(
        &self,
        request: &BulkSendRequest,
        now: DateTime<Utc>,
    ) -> Result<PreparedBatch, PreparationError> {
        if request.phone_numbers.is_empty() && request.recipients.is_empty() {
            return Err(PreparationError::NoRecipients);
        }
        let message = self.resolve_message(&request.message).await?;
        let records = self.collect_recipients(request).await?;

        let mut batch = PreparedBatch::default();
        let mut unique: Vec<(String, ContactRecord)> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for record in records {
            let e164 = match self.normalizer.normalize(&record.phone) {
                Ok(e164) => e164,
                Err(error) => {
                    debug!(raw = %record.phone, reason = error.reason(), "recipient skipped");
                    batch.skipped.push(SkippedRecipient {
                        raw: record.phone,
                        reason: SkipReason::Normalization { error },
                    });
                    continue;
                }
            };
            match seen.get(&e164) {
                Some(&index) => {
                    // keep the first occurrence, but let later sources fill in fields
                    let (_, first) = &mut unique[index];
                    for (key, value) in record.fields {
                        first.fields.entry(key).or_insert(value);
                    }
                    batch.duplicates += 1;
                }
                None => {
                    seen.insert(e164.clone(), unique.len());
                    unique.push((e164, record));
                }
            }
        }

        let scheduled_at = scheduled_after(now, request.delay_seconds.unwrap_or(0))?;
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts).max(1);
        for (e164, record) in unique {
            let payload = match &message {
                ResolvedMessage::Text { body } => MessagePayload::Text {
                    body: substitute_tokens(body, &record.fields, &e164),
                },
                ResolvedMessage::Template {
                    template,
                    parameters,
                } => {
                    let personalised =
                        parameters.map_values(|value| substitute_tokens(value, &record.fields, &e164));
                    match bind(template, &personalised) {
                        Ok(bound) => MessagePayload::Template(bound),
                        Err(error) => {
                            debug!(raw = %record.phone, kind = error.kind(), "recipient skipped");
                            batch.skipped.push(SkippedRecipient {
                                raw: record.phone,
                                reason: SkipReason::Binding { error },
                            });
                            continue;
                        }
                    }
                }
            };

            let mut entry = QueueEntry::new_pending(
                &request.tenant_id,
                e164.clone(),
                payload,
                request.priority,
                max_attempts,
                scheduled_at,
                now,
            );
            if let Some(scope) = request.dedupe_scope.as_deref() {
                entry = entry.with_dedupe_key(format!("{}:{}", scope, e164));
            }
            batch.entries.push(entry);
        }

        info!(
            tenant_id = %request.tenant_id,
            accepted = batch.entries.len(),
            skipped = batch.skipped.len(),
            duplicates = batch.duplicates,
            "bulk send prepared"
        );
        Ok(batch)
    }
}

pub async fn enqueue_batch(
    repo: &dyn QueueRepository,
    entries: Vec<QueueEntry>,
) -> Result<EnqueueReport, RepositoryError> {
    let mut report = EnqueueReport::default();
    for entry in entries {
        match repo.enqueue(entry).await? {
            EnqueueOutcome::Inserted(id) => report.inserted.push(id),
            EnqueueOutcome::Duplicate(id) => report.duplicates.push(id),
        }
    }
    Ok(report)
}
