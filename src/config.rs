//! # Configuration Management
//!
//! This module handles loading and managing gateway configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, nested keys separated by `__`)
//! - Deployment shorthands (HOST, PORT, N8N_URL, WHISPER_URL, TTS_URL, ...)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shorthand variables (PORT, N8N_URL, ...)
//! 2. Environment variables (APP_SERVER__PORT, APP_VOICE__SILENCE_THRESHOLD_MS, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main gateway configuration that contains all settings.
///
/// Split into logical groups so each component only receives the section
/// it needs (the call session gets `voice` and `timeouts`, the backends get
/// `backends`, the server gets `server` and `performance`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backends: BackendsConfig,
    pub timeouts: TimeoutsConfig,
    pub voice: VoiceConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "0.0.0.0"`: Accept media streams from the telephony provider
/// - `host = "127.0.0.1"`: Only accept local connections (development behind a tunnel)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which speech-to-text strategy new calls use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttMode {
    /// Local silence segmentation, one complete utterance per request
    Batch,
    /// Provider-side segmentation over a live upstream stream
    Streaming,
}

impl std::str::FromStr for SttMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "batch" => Ok(SttMode::Batch),
            "streaming" | "stream" => Ok(SttMode::Streaming),
            _ => Err(format!("Unknown STT mode: {}", s)),
        }
    }
}

/// Locations of the speech and dialogue backends.
///
/// ## Fields:
/// - `stt_mode`: `batch` (Whisper HTTP) or `streaming` (WebSocket STT)
/// - `whisper_url`: Base URL of the batch STT service (`/asr` is appended)
/// - `stt_language`: Language hint sent with every batch transcription
/// - `streaming_stt_url`: WebSocket URL of the streaming STT service
/// - `dialogue_url`: Webhook that turns a transcript into a reply
/// - `tts_url`: Base URL of the TTS service (`/api/tts` is appended)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    pub stt_mode: SttMode,
    pub whisper_url: String,
    pub stt_language: String,
    pub streaming_stt_url: String,
    pub dialogue_url: String,
    pub tts_url: String,
}

/// Upper bounds for every external call, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub stt_ms: u64,
    pub dialogue_ms: u64,
    pub tts_ms: u64,
}

impl TimeoutsConfig {
    pub fn stt(&self) -> Duration {
        Duration::from_millis(self.stt_ms)
    }

    pub fn dialogue(&self) -> Duration {
        Duration::from_millis(self.dialogue_ms)
    }

    pub fn tts(&self) -> Duration {
        Duration::from_millis(self.tts_ms)
    }
}

/// Timing and framing of the conversational loop.
///
/// ## Fields:
/// - `silence_threshold_ms`: Gap without inbound frames that ends an utterance
/// - `min_utterance_ms`: Buffers shorter than this are kept, not transcribed
/// - `frame_bytes` / `frame_duration_ms`: The playback quantum (160 bytes = 20ms of 8kHz mu-law)
/// - `wire_sample_rate`: Sample rate of the telephony wire format
/// - `backend_sample_rate`: Sample rate the STT backends expect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub silence_threshold_ms: u64,
    pub min_utterance_ms: u64,
    pub frame_bytes: usize,
    pub frame_duration_ms: u64,
    pub wire_sample_rate: u32,
    pub backend_sample_rate: u32,
}

impl VoiceConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn min_utterance(&self) -> Duration {
        Duration::from_millis(self.min_utterance_ms)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    /// Wire bytes per second. mu-law carries one byte per sample.
    pub fn wire_bytes_per_second(&self) -> u64 {
        self.wire_sample_rate as u64
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 500,
            min_utterance_ms: 1000,
            frame_bytes: 160,
            frame_duration_ms: 20,
            wire_sample_rate: 8000,
            backend_sample_rate: 16000,
        }
    }
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Calls beyond this are refused before the WebSocket upgrade
/// - `heartbeat_interval_secs`: How often the gateway pings the media stream
/// - `heartbeat_timeout_secs`: Silence on the socket after which the call is torn down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            backends: BackendsConfig {
                stt_mode: SttMode::Batch,
                whisper_url: "http://stt:8000".to_string(),
                stt_language: "de".to_string(),
                streaming_stt_url: "ws://stt:8001/stream".to_string(),
                dialogue_url: "http://n8n:5678/webhook/voice-chat".to_string(),
                tts_url: "http://tts:5002".to_string(),
            },
            timeouts: TimeoutsConfig {
                stt_ms: 10_000,
                dialogue_ms: 7_000,
                tts_ms: 15_000,
            },
            voice: VoiceConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 50,
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 60,
            },
        }
    }
}

/// Deployment shorthands and the config key each one overrides.
const SHORTHAND_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("N8N_URL", "backends.dialogue_url"),
    ("WHISPER_URL", "backends.whisper_url"),
    ("STREAMING_STT_URL", "backends.streaming_stt_url"),
    ("STT_LANGUAGE", "backends.stt_language"),
    ("TTS_URL", "backends.tts_url"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_BACKENDS__STT_MODE=streaming`: Switch new calls to streaming STT
    /// - `APP_VOICE__SILENCE_THRESHOLD_MS=700`: Longer pause before an utterance ends
    /// - `N8N_URL=http://localhost:5678/webhook/voice-chat`: Dialogue webhook
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in SHORTHAND_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0
            || self.performance.heartbeat_timeout_secs < self.performance.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat timeout must be at least the (non-zero) heartbeat interval"
            ));
        }

        let voice = &self.voice;
        if voice.frame_bytes == 0 || voice.frame_duration_ms == 0 {
            return Err(anyhow::anyhow!("Playback frame size and duration must be greater than 0"));
        }
        if voice.silence_threshold_ms == 0 {
            return Err(anyhow::anyhow!("Silence threshold must be greater than 0"));
        }
        if voice.wire_sample_rate == 0 || voice.backend_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        let timeouts = &self.timeouts;
        if timeouts.stt_ms == 0 || timeouts.dialogue_ms == 0 || timeouts.tts_ms == 0 {
            return Err(anyhow::anyhow!("Backend timeouts must be greater than 0"));
        }

        let backends = &self.backends;
        for (name, url) in [
            ("whisper_url", &backends.whisper_url),
            ("streaming_stt_url", &backends.streaming_stt_url),
            ("dialogue_url", &backends.dialogue_url),
            ("tts_url", &backends.tts_url),
        ] {
            reqwest::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", name, url, e))?;
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON are changed; for example
    /// `{"voice": {"silence_threshold_ms": 800}}` only changes the silence threshold.
    /// The merged configuration must still pass `validate()`; on failure `self` is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, &patch);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `target`, object keys only.
fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.voice.frame_bytes, 160);
        assert_eq!(config.voice.silence_threshold_ms, 500);
        assert_eq!(config.timeouts.dialogue_ms, 7_000);
        assert_eq!(config.backends.stt_mode, SttMode::Batch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.voice.frame_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backends.dialogue_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "voice": {"silence_threshold_ms": 800}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.voice.silence_threshold_ms, 800);
        // Untouched fields keep their values
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.voice.min_utterance_ms, 1000);
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"timeouts": {"tts_ms": 0}}"#).is_err());
        assert_eq!(config.timeouts.tts_ms, 15_000);

        assert!(config.update_from_json(r#"{"backends": {"stt_mode": "carrier-pigeon"}}"#).is_err());
        assert_eq!(config.backends.stt_mode, SttMode::Batch);
    }

    #[test]
    fn test_stt_mode_parsing() {
        assert_eq!("Streaming".parse::<SttMode>(), Ok(SttMode::Streaming));
        assert_eq!("batch".parse::<SttMode>(), Ok(SttMode::Batch));
        assert!("whisper".parse::<SttMode>().is_err());
    }
}
