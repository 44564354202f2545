//! # Dialogue Webhook Client
//!
//! Posts each transcript as JSON to the dialogue workflow and returns the
//! response body untouched. Interpreting the reply is the dispatcher's job.

use crate::error::{Backend, GatewayError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Body of a dialogue request.
///
/// ```json
/// {"transcript": "...", "timestamp": "2025-01-01T12:00:00.000Z",
///  "sessionId": "CA...", "callerNumber": "+49..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueRequest {
    pub transcript: String,
    pub timestamp: String,
    pub session_id: String,
    pub caller_number: Option<String>,
}

/// Something that can answer a transcript.
#[async_trait]
pub trait DialogueBackend: Send + Sync {
    /// Send one request. Non-JSON bodies come back as `Value::String`.
    async fn converse(&self, request: &DialogueRequest) -> Result<Value, GatewayError>;
}

/// HTTP webhook implementation (an n8n workflow in the reference deployment).
pub struct WebhookDialogue {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookDialogue {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DialogueBackend for WebhookDialogue {
    async fn converse(&self, request: &DialogueRequest) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(Backend::Dialogue, self.timeout, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::from_reqwest(Backend::Dialogue, self.timeout, e))?;

        if !status.is_success() {
            return Err(GatewayError::failure(
                Backend::Dialogue,
                format!("HTTP {}: {}", status, excerpt(&body, 200)),
            ));
        }

        Ok(parse_body(body))
    }
}

/// JSON when it parses, otherwise the raw text as a string value.
pub fn parse_body(body: String) -> Value {
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

/// At most `max` characters of `text`, for logs and error messages.
pub fn excerpt(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
