//! # Whisper HTTP Backend
//!
//! Batch transcription against a Whisper ASR web service. Each utterance is
//! posted to `{base}/asr` as a multipart form with the WAV under
//! `audio_file`, plus `task`, `language` and `output` fields.

use super::engine::BatchStt;
use crate::error::{Backend, GatewayError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Keys probed, in order, for the transcript in a JSON response.
const TRANSCRIPT_KEYS: [&str; 3] = ["text", "transcription", "result"];

/// Client for a Whisper-style `/asr` endpoint.
pub struct WhisperHttpStt {
    client: reqwest::Client,
    endpoint: String,
    language: String,
    timeout: Duration,
}

impl WhisperHttpStt {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        language: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: format!("{}/asr", base_url.trim_end_matches('/')),
            language: language.into(),
            timeout,
        }
    }
}

#[async_trait]
impl BatchStt for WhisperHttpStt {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, GatewayError> {
        let started = Instant::now();
        let audio_bytes = wav.len();

        let audio = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| GatewayError::failure(Backend::Stt, e))?;
        let form = Form::new()
            .part("audio_file", audio)
            .text("task", "transcribe")
            .text("language", self.language.clone())
            .text("output", "json");

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(Backend::Stt, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("STT service returned HTTP {}", status);
            return Err(GatewayError::failure(Backend::Stt, format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::from_reqwest(Backend::Stt, self.timeout, e))?;
        let transcript = parse_transcript(&body)?;

        debug!(
            "STT: {} bytes of WAV transcribed in {}ms ({} chars)",
            audio_bytes,
            started.elapsed().as_millis(),
            transcript.len()
        );
        Ok(transcript)
    }
}

/// Pull the transcript out of an `/asr` response body.
///
/// Accepts a JSON object with `text`, `transcription` or `result`, a bare
/// JSON string, or plain text when the service ignores `output=json`.
pub fn parse_transcript(body: &str) -> Result<String, GatewayError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => {
            for key in TRANSCRIPT_KEYS {
                match map.get(key) {
                    Some(Value::String(text)) => return Ok(text.trim().to_string()),
                    Some(Value::Null) | None => continue,
                    Some(other) => {
                        return Err(GatewayError::malformed(
                            Backend::Stt,
                            format!("'{}' is not a string: {}", key, other),
                        ))
                    }
                }
            }
            Ok(String::new())
        }
        Ok(Value::String(text)) => Ok(text.trim().to_string()),
        Ok(Value::Null) => Ok(String::new()),
        Ok(other) => Err(GatewayError::malformed(
            Backend::Stt,
            format!("unexpected transcript shape: {}", other),
        )),
        Err(_) => Ok(body.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transcript_variants() {
        assert_eq!(parse_transcript(r#"{"text":" Hallo Welt "}"#).unwrap(), "Hallo Welt");
        assert_eq!(parse_transcript(r#"{"transcription":"guten Tag"}"#).unwrap(), "guten Tag");
        assert_eq!(parse_transcript(r#"{"result":"ja"}"#).unwrap(), "ja");
        assert_eq!(parse_transcript(r#""nein""#).unwrap(), "nein");
        assert_eq!(parse_transcript("plain words\n").unwrap(), "plain words");
    }

    #[test]
    fn test_parse_transcript_prefers_text_key() {
        let body = r#"{"result":"second","text":"first"}"#;
        assert_eq!(parse_transcript(body).unwrap(), "first");
    }

    #[test]
    fn test_parse_transcript_empty_when_nothing_recognized() {
        assert_eq!(parse_transcript(r#"{"segments":[]}"#).unwrap(), "");
        assert_eq!(parse_transcript(r#"{"text":null}"#).unwrap(), "");
        assert_eq!(parse_transcript("").unwrap(), "");
    }

    #[test]
    fn test_parse_transcript_rejects_non_string_text() {
        let err = parse_transcript(r#"{"text":{"nested":true}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedBackendResponse { .. }));
    }

    #[test]
    fn test_endpoint_appends_asr_path() {
        let stt = WhisperHttpStt::new(
            reqwest::Client::new(),
            "http://stt:8000/",
            "de",
            Duration::from_secs(10),
        );
        assert_eq!(stt.endpoint, "http://stt:8000/asr");
    }
}
