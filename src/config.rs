use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};
use url::Url;

use crate::classify::MatchMode;
use crate::db;
use crate::error::ConfigurationError;
use crate::extract::DEFAULT_MIN_MAIN_CHARS;
use crate::fetch::DEFAULT_PACING;
use crate::relay::{RetrySchedule, DEFAULT_PENDING_TTL};
use crate::scanner::DEFAULT_DEBOUNCE;

pub const ENV_PREFIX: &str = "TERMS";

/// Persisted settings owned by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    AnalysisWebhook,
    SaveWebhook,
    ChatWebhook,
    UserId,
}

impl SettingKey {
    pub const ALL: [SettingKey; 4] = [
        Self::AnalysisWebhook,
        Self::SaveWebhook,
        Self::ChatWebhook,
        Self::UserId,
    ];

    /// Name in the settings table.
    pub fn name(self) -> &'static str {
        match self {
            Self::AnalysisWebhook => "n8nWebhookUrl",
            Self::SaveWebhook => "saveWebhookUrl",
            Self::ChatWebhook => "chatWebhookUrl",
            Self::UserId => "userId",
        }
    }

    /// Key as the `config` crate reports it for `TERMS_*` variables.
    pub fn env_key(self) -> &'static str {
        match self {
            Self::AnalysisWebhook => "n8n_webhook_url",
            Self::SaveWebhook => "save_webhook_url",
            Self::ChatWebhook => "chat_webhook_url",
            Self::UserId => "user_id",
        }
    }

    pub fn default_value(self) -> Option<&'static str> {
        match self {
            Self::AnalysisWebhook => Some("http://localhost:5678/webhook-test/compliance-analyzer"),
            Self::SaveWebhook => Some("http://localhost:5678/webhook-test/save-report"),
            Self::ChatWebhook => Some("http://localhost:5678/webhook-test/chat"),
            Self::UserId => None,
        }
    }

    pub fn is_url(self) -> bool {
        !matches!(self, Self::UserId)
    }

    pub fn parse(name: &str) -> Result<Self, ConfigurationError> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(name) || k.env_key() == name)
            .ok_or_else(|| ConfigurationError::UnknownKey(name.to_string()))
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn validate_url(key: SettingKey, value: &str) -> Result<String, ConfigurationError> {
    let invalid = || ConfigurationError::InvalidUrl {
        key: key.name().to_string(),
        value: value.to_string(),
    };
    let url = Url::parse(value.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url.to_string())
}

/// `TERMS_*` environment variables, lowercased, prefix removed.
pub fn env_overrides() -> Result<HashMap<String, String>, ConfigurationError> {
    ::config::Config::builder()
        .add_source(::config::Environment::with_prefix(ENV_PREFIX))
        .build()
        .and_then(|c| c.try_deserialize::<HashMap<String, String>>())
        .map_err(|e| ConfigurationError::Store(e.to_string()))
}

pub fn db_path(overrides: &HashMap<String, String>) -> String {
    overrides
        .get("db_path")
        .cloned()
        .unwrap_or_else(|| db::DEFAULT_DB_PATH.to_string())
}

/// Key-value settings in SQLite, with environment overrides layered on top.
/// Overrides are read-only: `set` writes the table, `get` prefers the
/// override.
pub struct Settings {
    conn: Connection,
    overrides: HashMap<String, String>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn store_err(e: anyhow::Error) -> ConfigurationError {
    ConfigurationError::Store(format!("{:#}", e))
}

impl Settings {
    pub fn new(conn: Connection, overrides: HashMap<String, String>) -> Result<Self, ConfigurationError> {
        db::init_schema(&conn).map_err(store_err)?;
        Ok(Self { conn, overrides })
    }

    pub fn in_memory() -> Result<Self, ConfigurationError> {
        let conn = Connection::open_in_memory().map_err(|e| ConfigurationError::Store(e.to_string()))?;
        Self::new(conn, HashMap::new())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn get(&self, key: SettingKey) -> Result<Option<String>, ConfigurationError> {
        if let Some(value) = self.overrides.get(key.env_key()) {
            debug!(key = %key, "using environment override");
            if key.is_url() && !value.trim().is_empty() {
                return validate_url(key, value).map(Some);
            }
            return Ok(Some(value.trim().to_string()));
        }
        db::get_setting(&self.conn, key.name()).map_err(store_err)
    }

    /// Like `get`, but a missing value is an error.
    pub fn require(&self, key: SettingKey) -> Result<String, ConfigurationError> {
        self.get(key)?
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigurationError::Missing(key.name()))
    }

    pub fn set(&self, key: SettingKey, value: &str) -> Result<String, ConfigurationError> {
        let value = if key.is_url() {
            validate_url(key, value)?
        } else {
            value.trim().to_string()
        };
        if value.is_empty() {
            return Err(ConfigurationError::Missing(key.name()));
        }
        db::set_setting(&self.conn, key.name(), &value).map_err(store_err)?;
        info!(key = %key, value = %value, "setting saved");
        Ok(value)
    }

    /// Write the default of every unset key that has one.
    pub fn ensure_defaults(&self) -> Result<(), ConfigurationError> {
        for key in SettingKey::ALL {
            let Some(default) = key.default_value() else {
                continue;
            };
            let stored = db::get_setting(&self.conn, key.name()).map_err(store_err)?;
            if stored.is_none() {
                db::set_setting(&self.conn, key.name(), default).map_err(store_err)?;
                info!(key = %key, value = default, "default setting written");
            }
        }
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<(SettingKey, Option<String>)>, ConfigurationError> {
        SettingKey::ALL
            .into_iter()
            .map(|k| Ok((k, self.get(k)?)))
            .collect()
    }
}

/// Timing and detection knobs for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub pacing: Duration,
    pub retry: RetrySchedule,
    pub debounce: Duration,
    pub pending_ttl: Duration,
    pub min_main_chars: usize,
    pub mode: MatchMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pacing: DEFAULT_PACING,
            retry: RetrySchedule::default(),
            debounce: DEFAULT_DEBOUNCE,
            pending_ttl: DEFAULT_PENDING_TTL,
            min_main_chars: DEFAULT_MIN_MAIN_CHARS,
            mode: MatchMode::Strict,
        }
    }
}

impl PipelineConfig {
    pub fn with_mode(mode: MatchMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Apply `pacing_ms`, `retries`, `retry_step_ms`, `debounce_ms`,
    /// `pending_ttl_secs` and `min_main_chars` from the environment.
    pub fn apply_overrides(
        mut self,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, ConfigurationError> {
        let number = |key: &'static str| -> Result<Option<u64>, ConfigurationError> {
            overrides
                .get(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigurationError::Store(format!("{} must be a number, got {:?}", key, v)))
                })
                .transpose()
        };
        if let Some(ms) = number("pacing_ms")? {
            self.pacing = Duration::from_millis(ms);
        }
        if let Some(n) = number("retries")? {
            self.retry.max_retries = n.min(u64::from(u32::MAX)) as u32;
        }
        if let Some(ms) = number("retry_step_ms")? {
            self.retry.step = Duration::from_millis(ms);
        }
        if let Some(ms) = number("debounce_ms")? {
            self.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = number("pending_ttl_secs")? {
            self.pending_ttl = Duration::from_secs(secs);
        }
        if let Some(chars) = number("min_main_chars")? {
            self.min_main_chars = chars as usize;
        }
        Ok(self)
    }
}
