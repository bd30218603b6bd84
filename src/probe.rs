//! Connectivity probe.
//!
//! One REST `generateContent` call checks that the API key works before a
//! live session is opened. The key travels as the `key` query parameter, so
//! request URLs and `reqwest` errors carrying them are never logged.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ChannelSettings;
use crate::error::{WatchError, WatchResult};

pub const PROBE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Model tried when the live model answers 404.
pub const FALLBACK_MODEL: &str = "gemini-1.5-flash";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TEXT: &str = "Hello, this is a connection test.";

/// Result of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The configured live model answered.
    Ready { model: String },
    /// Only the fallback model answered; live streaming may not work.
    Limited { fallback: String },
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Ready { model } => write!(f, "API key accepted, {} is ready", model),
            ProbeOutcome::Limited { fallback } => write!(
                f,
                "API key works with {} but the live model is unavailable; streaming may fail",
                fallback
            ),
        }
    }
}

pub struct ApiProbe {
    client: Client,
    base_url: String,
    model: String,
}

impl ApiProbe {
    pub fn new(model: &str) -> WatchResult<Self> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| WatchError::external("reqwest", e.without_url()))?;
        Ok(Self {
            client,
            base_url: PROBE_BASE_URL.to_string(),
            model: model.trim_start_matches("models/").to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Check `api_key` against the live model, falling back once on 404.
    pub async fn probe(&self, api_key: &str) -> WatchResult<ProbeOutcome> {
        let status = self.generate(&self.model, api_key).await?;
        if status.is_success() {
            info!(model = %self.model, "probe succeeded");
            return Ok(ProbeOutcome::Ready {
                model: self.model.clone(),
            });
        }
        if status != StatusCode::NOT_FOUND {
            return Err(status_error(&self.model, status));
        }

        warn!(model = %self.model, "live model not found, trying {}", FALLBACK_MODEL);
        let status = self.generate(FALLBACK_MODEL, api_key).await?;
        if status.is_success() {
            Ok(ProbeOutcome::Limited {
                fallback: FALLBACK_MODEL.to_string(),
            })
        } else {
            Err(status_error(FALLBACK_MODEL, status))
        }
    }

    async fn generate(&self, model: &str, api_key: &str) -> WatchResult<StatusCode> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = json!({ "contents": [{ "parts": [{ "text": PROBE_TEXT }] }] });
        debug!(%model, "probing");
        let response = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                if e.is_timeout() {
                    WatchError::timeout("probe", PROBE_TIMEOUT.as_millis() as u64)
                } else {
                    WatchError::connect(&self.base_url, e.to_string())
                }
            })?;
        Ok(response.status())
    }
}

fn status_error(model: &str, status: StatusCode) -> WatchError {
    match status.as_u16() {
        400 | 401 | 403 => WatchError::auth(format!("{} rejected the API key (HTTP {})", model, status))
            .with_recovery_suggestion("check the API key"),
        _ => WatchError::connect(PROBE_BASE_URL, format!("{} answered HTTP {}", model, status)),
    }
}

/// Probe the model named in `settings`.
pub async fn probe_api_key(settings: &ChannelSettings, api_key: &str) -> WatchResult<ProbeOutcome> {
    ApiProbe::new(&settings.model)?.probe(api_key).await
}
