use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "BULK_DISPATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "~/.bulk-dispatch/config.json";
// ten years
pub const MAX_DURATION_SECONDS: u64 = 315_360_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub database: DatabaseConfig,
    pub dispatch: DispatchConfig,
    pub phone: PhoneConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.bulk-dispatch/queue.sqlite".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    pub worker_count: usize,
    pub backoff_base_seconds: u64,
    pub backoff_cap: u64,
    pub stale_threshold_seconds: u64,
    pub default_max_attempts: u32,
    pub send_timeout_seconds: u64,
    pub poll_interval_millis: u64,
    pub recovery_interval_seconds: u64,
    pub storage_retry_limit: u32,
    pub reclaim_warn_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            backoff_base_seconds: 30,
            backoff_cap: 3600,
            stale_threshold_seconds: 300,
            default_max_attempts: 3,
            send_timeout_seconds: 30,
            poll_interval_millis: 1000,
            recovery_interval_seconds: 60,
            storage_retry_limit: 5,
            reclaim_warn_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PhoneConfig {
    pub default_country_code: String,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            default_country_code: "225".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dispatch = &self.dispatch;
        if dispatch.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if dispatch.default_max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if dispatch.backoff_base_seconds == 0 {
            return Err(ConfigError::Zero("backoffBaseSeconds"));
        }
        for (field, value) in [
            ("backoffBaseSeconds", dispatch.backoff_base_seconds),
            ("backoffCap", dispatch.backoff_cap),
            ("staleThresholdSeconds", dispatch.stale_threshold_seconds),
        ] {
            if value > MAX_DURATION_SECONDS {
                return Err(ConfigError::TooLarge {
                    field,
                    max: MAX_DURATION_SECONDS,
                });
            }
        }
        if dispatch.backoff_cap < dispatch.backoff_base_seconds {
            return Err(ConfigError::CapBelowBase {
                base: dispatch.backoff_base_seconds,
                cap: dispatch.backoff_cap,
            });
        }
        if dispatch.stale_threshold_seconds == 0 {
            return Err(ConfigError::Zero("staleThresholdSeconds"));
        }
        if dispatch.send_timeout_seconds == 0 {
            return Err(ConfigError::Zero("sendTimeoutSeconds"));
        }
        if dispatch.poll_interval_millis == 0 {
            return Err(ConfigError::Zero("pollIntervalMillis"));
        }
        if dispatch.recovery_interval_seconds == 0 {
            return Err(ConfigError::Zero("recoveryIntervalSeconds"));
        }
        let cc = &self.phone.default_country_code;
        if cc.is_empty() || cc.len() > 3 || !cc.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::CountryCode(cc.clone()));
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var(CONFIG_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde(DEFAULT_CONFIG_PATH))
}

pub fn load_config_file(path: &Path) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str::<Config>(&raw)?)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(url) = non_empty_env("BULK_DISPATCH_DATABASE_URL") {
        cfg.database.url = Some(url);
    }

    if let Some(path) = non_empty_env("BULK_DISPATCH_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }

    if let Some(workers) = non_empty_env("BULK_DISPATCH_WORKERS") {
        match workers.trim().parse::<usize>() {
            Ok(count) => cfg.dispatch.worker_count = count,
            Err(_) => warn!("ignoring BULK_DISPATCH_WORKERS={workers:?}: not a number"),
        }
    }

    if let Some(cc) = non_empty_env("BULK_DISPATCH_DEFAULT_COUNTRY") {
        cfg.phone.default_country_code = cc.trim().trim_start_matches('+').to_string();
    }
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();
    if config_path.exists() {
        match load_config_file(&config_path) {
            Ok(file_cfg) => cfg = file_cfg,
            Err(err) => warn!("ignoring config file {}: {err}", config_path.display()),
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
