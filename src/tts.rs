//! # Text-to-Speech Backend
//!
//! Synthesis over HTTP: `GET {tts_url}/api/tts?text=...` answers with a WAV
//! file. Format conversion to the telephony wire happens in the codec, not here.

use crate::error::{Backend, GatewayError};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

/// Something that can turn reply text into audio.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize `text`. The result is a complete audio file (WAV).
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, GatewayError>;
}

/// Client for a Coqui-style `/api/tts` endpoint.
pub struct HttpTts {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTts {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/tts", base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl TtsBackend for HttpTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, GatewayError> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("text", text)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(Backend::Tts, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::failure(Backend::Tts, format!("HTTP {}", status)));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| GatewayError::from_reqwest(Backend::Tts, self.timeout, e))?;
        if audio.is_empty() {
            return Err(GatewayError::malformed(Backend::Tts, "empty audio body"));
        }

        debug!(
            bytes = audio.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "TTS synthesis complete"
        );
        Ok(audio.to_vec())
    }
}
