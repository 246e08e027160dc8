//! Status Fetcher - authenticated polling of the remote opacity authority
//!
//! `GET {api_url}/opacity` answers `{ "opacity": <0..1> }`. Every failure is
//! folded into a logged, discarded attempt at the `poll` boundary.

use crate::config::{Credentials, GuardConfig};
use crate::enforcement::BlockLevel;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Header carrying the project identifier
pub const PROJECT_SLUG_HEADER: &str = "X-Project-Slug";

/// Reasons a poll attempt was discarded
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Status endpoint answered HTTP {0}")]
    Status(u16),

    #[error("Malformed status payload: {0}")]
    Malformed(String),

    #[error("Opacity {0} outside [0, 1]")]
    OutOfRange(f64),
}

/// Client for the status endpoint
#[derive(Clone)]
pub struct StatusFetcher {
    client: Client,
    url: String,
    credentials: Credentials,
}

impl StatusFetcher {
    /// Build a fetcher from validated configuration
    pub fn new(config: &GuardConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            url: config.status_url(),
            credentials: config.credentials(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the current block level, surfacing the failure reason
    pub async fn fetch_block_level(&self) -> Result<BlockLevel, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .header(AUTHORIZATION, format!("Bearer {}", self.credentials.api_key))
            .header(PROJECT_SLUG_HEADER, &self.credentials.project_slug)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_block_level(&body)
    }

    /// One scheduled attempt: a level on success, `None` otherwise
    pub async fn poll(&self) -> Option<BlockLevel> {
        match self.fetch_block_level().await {
            Ok(level) => {
                debug!("Status poll ok: opacity={:.3}", level.value());
                Some(level)
            }
            Err(e) => {
                warn!("Guard check failed silently: {}", e);
                None
            }
        }
    }
}

/// Decode `{ "opacity": <number> }` into a block level
pub fn parse_block_level(body: &str) -> Result<BlockLevel, FetchError> {
    let payload: Value =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let opacity = payload
        .as_object()
        .ok_or_else(|| FetchError::Malformed("payload is not an object".to_string()))?
        .get("opacity")
        .ok_or_else(|| FetchError::Malformed("missing opacity field".to_string()))?
        .as_f64()
        .ok_or_else(|| FetchError::Malformed("opacity is not a number".to_string()))?;

    BlockLevel::new(opacity).ok_or(FetchError::OutOfRange(opacity))
}
