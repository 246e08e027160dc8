//! Guard configuration
//!
//! Supplied once by the embedding application and immutable afterwards.

use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Status endpoint base used when none is configured
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";

/// 30 minutes between scheduled polls
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30 * 60;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key must not be empty")]
    MissingApiKey,

    #[error("Project slug must not be empty")]
    MissingProjectSlug,

    #[error("Invalid API URL {url}: {reason}")]
    InvalidApiUrl { url: String, reason: String },

    #[error("Poll interval must be at least one second")]
    ZeroPollInterval,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Embedding-time configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    pub api_key: String,
    pub project_slug: String,
    /// Panel heading shown once the overlay blocks interaction
    pub heading: String,
    /// Panel message shown under the heading
    pub message: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl GuardConfig {
    /// Create a config with default endpoint and schedule
    pub fn new(
        api_key: impl Into<String>,
        project_slug: impl Into<String>,
        heading: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            project_slug: project_slug.into(),
            heading: heading.into(),
            message: message.into(),
            api_url: default_api_url(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    /// Override the status endpoint base
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Override the polling schedule
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs();
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GuardConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.project_slug.trim().is_empty() {
            return Err(ConfigError::MissingProjectSlug);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }

        let url = reqwest::Url::parse(&self.api_url).map_err(|e| ConfigError::InvalidApiUrl {
            url: self.api_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidApiUrl {
                url: self.api_url.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.api_key.clone(),
            project_slug: self.project_slug.clone(),
        }
    }

    /// Full URL of the opacity resource
    pub fn status_url(&self) -> String {
        format!("{}/opacity", self.api_url.trim_end_matches('/'))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Key and project attached to every status request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub project_slug: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("project_slug", &self.project_slug)
            .finish()
    }
}
