//! # Wire Protocol Adapters
//!
//! The channel never looks inside messages; it asks a [`WireProtocol`] to
//! build the setup and frame messages and to pull text out of whatever the
//! remote sends back.
//!
//! [`GeminiLiveProtocol`] speaks the BidiGenerateContent JSON framing:
//!
//! ```text
//! -> {"setup": {"model": "...", "generation_config": {"response_modalities": ["TEXT"], ...}}}
//! <- {"setupComplete": {}}
//! -> {"client_content": {"turns": [{"role": "user", "parts": [{"text": ...}, {"inline_data": {...}}]}], "turn_complete": true}}
//! <- {"serverContent": {"modelTurn": {"parts": [{"text": "..."}]}}}
//! ```

use serde_json::{Value, json};
use tracing::warn;

use crate::config::ChannelSettings;
use crate::config::settings::OUTPUT_TOKEN_RANGE;
use crate::error::{WatchError, WatchResult};
use crate::processing::EncodedPayload;

/// Message framing for one remote service.
pub trait WireProtocol: Send + Sync {
    /// First message after the transport opens.
    fn setup_message(&self) -> WatchResult<String>;

    /// `Ok(true)` when `reply` acknowledges setup, `Ok(false)` for messages
    /// to ignore while waiting, `Err(Auth)` when the remote rejected the
    /// credentials.
    fn is_setup_ack(&self, reply: &str) -> WatchResult<bool>;

    /// One frame plus its prompt.
    fn frame_message(&self, payload: &EncodedPayload, prompt: &str) -> WatchResult<String>;

    /// Text parts carried by an incoming message, in order. Messages with no
    /// text yield an empty vector.
    fn decode(&self, message: &str) -> WatchResult<Vec<String>>;
}

/// BidiGenerateContent framing.
#[derive(Debug, Clone)]
pub struct GeminiLiveProtocol {
    model: String,
    max_output_tokens: Option<u32>,
    safety_settings: Option<Value>,
}

impl GeminiLiveProtocol {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_output_tokens: None,
            safety_settings: None,
        }
    }

    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self {
            model: settings.model.clone(),
            max_output_tokens: settings.max_output_tokens,
            safety_settings: settings.safety_settings.clone(),
        }
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn with_safety_settings(mut self, safety: Value) -> Self {
        self.safety_settings = Some(safety);
        self
    }

    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

/// Read a field that may arrive in camelCase or snake_case.
fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value.get(camel).or_else(|| value.get(snake))
}

/// Map a service `error` object to a channel error.
fn service_error(error: &Value) -> WatchError {
    let status = error.get("status").and_then(Value::as_str).unwrap_or("");
    let code = error.get("code").and_then(Value::as_u64).unwrap_or(0);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message")
        .to_string();
    if matches!(status, "UNAUTHENTICATED" | "PERMISSION_DENIED") || matches!(code, 401 | 403) {
        WatchError::auth(message).with_recovery_suggestion("check the API key")
    } else {
        WatchError::protocol(format!("service error {} {}: {}", code, status, message))
    }
}

fn parse(message: &str) -> WatchResult<Value> {
    serde_json::from_str(message)
        .map_err(|e| WatchError::protocol(format!("message is not JSON: {}", e)))
}

impl WireProtocol for GeminiLiveProtocol {
    fn setup_message(&self) -> WatchResult<String> {
        let mut generation_config = json!({ "response_modalities": ["TEXT"] });
        match self.max_output_tokens {
            Some(n) if OUTPUT_TOKEN_RANGE.contains(&n) => {
                generation_config["max_output_tokens"] = json!(n);
            }
            Some(n) => warn!(
                max_output_tokens = n,
                "max_output_tokens outside {:?}, not sent",
                OUTPUT_TOKEN_RANGE
            ),
            None => {}
        }

        let mut setup = json!({
            "model": self.model_path(),
            "generation_config": generation_config,
        });
        if let Some(safety) = &self.safety_settings {
            setup["safety_settings"] = safety.clone();
        }
        Ok(json!({ "setup": setup }).to_string())
    }

    fn is_setup_ack(&self, reply: &str) -> WatchResult<bool> {
        let value = parse(reply)?;
        if let Some(error) = value.get("error") {
            return Err(service_error(error));
        }
        Ok(field(&value, "setupComplete", "setup_complete").is_some())
    }

    fn frame_message(&self, payload: &EncodedPayload, prompt: &str) -> WatchResult<String> {
        let message = json!({
            "client_content": {
                "turns": [{
                    "role": "user",
                    "parts": [
                        { "text": prompt },
                        {
                            "inline_data": {
                                "mime_type": payload.mime_type,
                                "data": payload.to_base64(),
                            }
                        }
                    ]
                }],
                "turn_complete": true
            }
        });
        Ok(message.to_string())
    }

    fn decode(&self, message: &str) -> WatchResult<Vec<String>> {
        let value = parse(message)?;
        if let Some(error) = value.get("error") {
            return Err(service_error(error));
        }
        let parts = field(&value, "serverContent", "server_content")
            .and_then(|c| field(c, "modelTurn", "model_turn"))
            .and_then(|t| t.get("parts"))
            .and_then(Value::as_array);
        let Some(parts) = parts else {
            return Ok(Vec::new());
        };
        Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect())
    }
}
