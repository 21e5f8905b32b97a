use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::template::ComponentKind;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NormalizationError {
    #[error("phone number too short ({digits} national digits, expected at least {min})")]
    TooShort { digits: usize, min: usize },
    #[error("phone number too long ({digits} national digits, expected at most {max})")]
    TooLong { digits: usize, max: usize },
    #[error("phone number contains invalid characters")]
    InvalidCharacters,
}

impl NormalizationError {
    pub fn reason(&self) -> &'static str {
        match self {
            NormalizationError::TooShort { .. } => "too_short",
            NormalizationError::TooLong { .. } => "too_long",
            NormalizationError::InvalidCharacters => "invalid_characters",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingError {
    #[error("{component} expects {expected} parameters, got {got}")]
    ParameterCountMismatch {
        component: ComponentKind,
        button_index: Option<usize>,
        expected: usize,
        got: usize,
    },
    #[error("header format requires a media reference")]
    MissingHeaderMedia,
    #[error("{component} placeholders are not contiguous from 1: {found:?}")]
    InvalidPlaceholders {
        component: ComponentKind,
        found: Vec<usize>,
    },
}

impl BindingError {
    pub fn kind(&self) -> &'static str {
        match self {
            BindingError::ParameterCountMismatch { .. } => "parameter_count_mismatch",
            BindingError::MissingHeaderMedia => "missing_header_media",
            BindingError::InvalidPlaceholders { .. } => "invalid_placeholders",
        }
    }
}

#[derive(Debug, Error)]
pub enum PreparationError {
    #[error("request has no recipients")]
    NoRecipients,
    #[error("template not found: {name} ({language})")]
    TemplateNotFound { name: String, language: String },
    #[error("template {name} is not approved")]
    TemplateNotApproved { name: String },
    #[error("template {name} cannot be bound: {source}")]
    InvalidTemplate {
        name: String,
        #[source]
        source: BindingError,
    },
    #[error("recipient resolution failed: {0}")]
    Directory(#[source] anyhow::Error),
    #[error("template catalog failed: {0}")]
    Catalog(#[source] anyhow::Error),
    #[error("delaySeconds {seconds} puts the send time out of range")]
    InvalidDelay { seconds: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider error (status {http_status:?}, code {code:?}): {message}")]
pub struct ApiError {
    pub http_status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

pub const CODE_TIMEOUT: &str = "timeout";
pub const CODE_NETWORK: &str = "network";

const PERMANENT_CODES: &[&str] = &[
    "invalid_recipient",
    "template_rejected",
    "template_not_approved",
    "authentication_failed",
    "malformed_payload",
    // WhatsApp Cloud API
    "100",
    "131008",
    "131009",
    "131026",
    "132000",
    "132001",
    "132012",
    "132015",
    "190",
];

const TRANSIENT_CODES: &[&str] = &[CODE_TIMEOUT, CODE_NETWORK, "rate_limited", "130429", "131048", "131056"];

impl ApiError {
    pub fn new(http_status: Option<u16>, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(Some(status), None, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            None,
            Some(CODE_TIMEOUT),
            format!("provider call timed out after {}ms", after.as_millis()),
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(None, Some(CODE_NETWORK), message)
    }

    pub fn classify(&self) -> ErrorClass {
        if let Some(code) = self.code.as_deref() {
            if TRANSIENT_CODES.contains(&code) {
                return ErrorClass::Transient;
            }
            if PERMANENT_CODES.contains(&code) {
                return ErrorClass::Permanent;
            }
        }
        match self.http_status {
            Some(408) | Some(429) => ErrorClass::Transient,
            Some(status) if (500..600).contains(&status) => ErrorClass::Transient,
            Some(400) | Some(401) | Some(403) | Some(404) | Some(422) => ErrorClass::Permanent,
            _ => ErrorClass::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage unavailable: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("entry {0} changed state concurrently")]
    ClaimConflict(Uuid),
    #[error("entry {0} not found")]
    NotFound(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("workerCount must be at least 1")]
    NoWorkers,
    #[error("defaultMaxAttempts must be at least 1")]
    NoAttempts,
    #[error("backoffCap ({cap}) must not be below backoffBaseSeconds ({base})")]
    CapBelowBase { base: u64, cap: u64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} must not exceed {max} seconds")]
    TooLarge { field: &'static str, max: u64 },
    #[error("defaultCountryCode must be 1-3 digits, got {0:?}")]
    CountryCode(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Preparation(#[from] PreparationError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
