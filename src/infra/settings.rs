//! Usage: Client settings (TOML schema + env overrides + sanitize/validate helpers).

use crate::client::refresh::{
    RefreshPolicy, DEFAULT_REFRESH_MAX_ATTEMPTS, DEFAULT_REFRESH_RETRY_BASE_DELAY,
    DEFAULT_REFRESH_TIMEOUT,
};
use crate::client::refresher::DEFAULT_REFRESH_PATH;
use crate::shared::error::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SCHEMA_VERSION: u32 = 1;
pub const ENV_PREFIX: &str = "LEARNHUB_";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api";
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u32 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u32 = 10;
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_FILE_PREFIX: &str = "learnhub-client.log";
const MAX_REQUEST_TIMEOUT_SECONDS: u32 = 10 * 60;
const MAX_CONNECT_TIMEOUT_SECONDS: u32 = 2 * 60;
const MAX_REFRESH_TIMEOUT_SECONDS: u32 = 2 * 60;
const MAX_REFRESH_MAX_ATTEMPTS: u32 = 5;
const MAX_REFRESH_RETRY_BASE_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub refresh_path: String,
    /// 0 disables the overall request deadline (connect timeout still applies).
    pub request_timeout_seconds: u32,
    pub connect_timeout_seconds: u32,
    pub refresh_timeout_seconds: u32,
    pub refresh_max_attempts: u32,
    pub refresh_retry_base_delay_ms: u64,
    pub user_agent: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            refresh_timeout_seconds: u32::try_from(DEFAULT_REFRESH_TIMEOUT.as_secs())
                .unwrap_or(MAX_REFRESH_TIMEOUT_SECONDS),
            refresh_max_attempts: DEFAULT_REFRESH_MAX_ATTEMPTS,
            refresh_retry_base_delay_ms: u64::try_from(DEFAULT_REFRESH_RETRY_BASE_DELAY.as_millis())
                .unwrap_or(MAX_REFRESH_RETRY_BASE_DELAY_MS),
            user_agent: format!("learnhub-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ApiSettings {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            timeout: Duration::from_secs(u64::from(self.refresh_timeout_seconds.max(1))),
            max_attempts: self.refresh_max_attempts.max(1),
            retry_base_delay: Duration::from_millis(self.refresh_retry_base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Mirror the token pair into this JSON file; unset keeps tokens in memory only.
    pub token_store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info,learnhub_client=debug`.
    pub filter: String,
    /// Write a daily rolling file here in addition to stderr.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
            ansi: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub schema_version: u32,
    pub api: ApiSettings,
    pub session: SessionSettings,
    pub logging: LogSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            api: ApiSettings::default(),
            session: SessionSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn from_toml_str(raw: &str) -> ApiResult<Self> {
        toml::from_str(raw).map_err(|e| ApiError::config(format!("settings toml invalid: {e}")))
    }

    pub fn read_file(path: &Path) -> ApiResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ApiError::config(format!("failed to read settings {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults (or `path`), then `LEARNHUB_*` environment overrides, then sanitize + validate.
    pub fn load(path: Option<&Path>) -> ApiResult<Self> {
        let mut settings = match path {
            Some(path) => Self::read_file(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.sanitize();
        settings.validate()?;
        Ok(settings)
    }

    /// `lookup` receives full variable names (`LEARNHUB_API_BASE_URL`, ...).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("API_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = get("REFRESH_PATH") {
            self.api.refresh_path = v;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.api.request_timeout_seconds = v;
        }
        if let Some(v) = get("REFRESH_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.api.refresh_timeout_seconds = v;
        }
        if let Some(v) = get("REFRESH_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.api.refresh_max_attempts = v;
        }
        if let Some(v) = get("TOKEN_STORE") {
            self.session.token_store_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG") {
            self.logging.filter = v;
        }
        if let Some(v) = get("LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }
    }

    pub fn sanitize(&mut self) {
        let api = &mut self.api;
        api.base_url = api.base_url.trim().trim_end_matches('/').to_string();

        let refresh_path = api.refresh_path.trim();
        api.refresh_path = if refresh_path.is_empty() {
            DEFAULT_REFRESH_PATH.to_string()
        } else if refresh_path.starts_with('/') {
            refresh_path.to_string()
        } else {
            format!("/{refresh_path}")
        };

        api.request_timeout_seconds = api.request_timeout_seconds.min(MAX_REQUEST_TIMEOUT_SECONDS);
        api.connect_timeout_seconds = api
            .connect_timeout_seconds
            .clamp(1, MAX_CONNECT_TIMEOUT_SECONDS);
        api.refresh_timeout_seconds = api
            .refresh_timeout_seconds
            .clamp(1, MAX_REFRESH_TIMEOUT_SECONDS);
        api.refresh_max_attempts = api.refresh_max_attempts.clamp(1, MAX_REFRESH_MAX_ATTEMPTS);
        api.refresh_retry_base_delay_ms = api
            .refresh_retry_base_delay_ms
            .min(MAX_REFRESH_RETRY_BASE_DELAY_MS);
        if api.user_agent.trim().is_empty() {
            api.user_agent = ApiSettings::default().user_agent;
        }

        if self.logging.filter.trim().is_empty() {
            self.logging.filter = DEFAULT_LOG_FILTER.to_string();
        }
        if self.logging.file_prefix.trim().is_empty() {
            self.logging.file_prefix = DEFAULT_LOG_FILE_PREFIX.to_string();
        }
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.api.base_url.is_empty() {
            return Err(ApiError::config("api.base_url is required"));
        }
        let url = reqwest::Url::parse(&self.api.base_url)
            .map_err(|e| ApiError::config(format!("api.base_url invalid: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ApiError::config(format!(
                "api.base_url must be http(s), got scheme={}",
                url.scheme()
            )));
        }
        if self.schema_version > SCHEMA_VERSION {
            return Err(ApiError::config(format!(
                "settings schema_version={} is newer than supported {SCHEMA_VERSION}",
                self.schema_version
            )));
        }
        Ok(())
    }
}
