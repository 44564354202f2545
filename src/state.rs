//! # Application State Management
//!
//! Everything shared between HTTP handlers and call sessions lives here.
//!
//! ## What is shared:
//! - **Configuration**: read by every new call, replaceable at runtime
//! - **HTTP metrics**: per-endpoint counters written by the metrics middleware
//! - **Call metrics**: lock-free counters bumped by the call sessions
//! - **Session registry**: the live calls, for `/api/v1/calls` and admission control
//! - **Backends**: the STT, dialogue and TTS clients, pooled across all calls
//!
//! Calls never share mutable state with each other; the only cross-call
//! writes are counter increments and registry entries.

use crate::audio::codec::{CodecAdapter, TelephonyCodec};
use crate::audio::session::SessionManager;
use crate::config::{AppConfig, SttMode};
use crate::dialogue::{DialogueBackend, WebhookDialogue};
use crate::transcription::{SpeechBackend, WebSocketStreamingStt, WhisperHttpStt};
use crate::tts::{HttpTts, TtsBackend};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers
/// and WebSocket sessions.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Conversational-loop counters, updated by call sessions
    pub call_metrics: Arc<CallMetrics>,

    /// Live calls
    pub sessions: Arc<SessionManager>,

    /// Backend clients for new calls; rebuilt when the configuration changes
    pub backends: Arc<RwLock<Backends>>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// Counters for the conversational loop, shared by every call.
///
/// ## Fields:
/// - `calls_started` / `active_calls`: admission and teardown
/// - `transcriptions`: STT requests issued (batch) or finals received (streaming)
/// - `replies_spoken`: replies whose playback ran to completion
/// - `turns_abandoned`: turns dropped on a backend error or timeout
/// - `barge_ins`: replies interrupted by the caller
/// - `malformed_replies`: dialogue replies rejected as misconfigured
/// - `frames_sent`: outbound media frames across all calls
#[derive(Debug, Default)]
pub struct CallMetrics {
    pub calls_started: AtomicU64,
    pub active_calls: AtomicU64,
    pub transcriptions: AtomicU64,
    pub replies_spoken: AtomicU64,
    pub turns_abandoned: AtomicU64,
    pub barge_ins: AtomicU64,
    pub malformed_replies: AtomicU64,
    pub frames_sent: AtomicU64,
}

/// Point-in-time copy of [`CallMetrics`] for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallMetricsSnapshot {
    pub calls_started: u64,
    pub active_calls: u64,
    pub transcriptions: u64,
    pub replies_spoken: u64,
    pub turns_abandoned: u64,
    pub barge_ins: u64,
    pub malformed_replies: u64,
    pub frames_sent: u64,
}

impl CallMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn call_started(&self) {
        Self::incr(&self.calls_started);
        Self::incr(&self.active_calls);
    }

    /// Saturates at zero.
    pub fn call_ended(&self) {
        let _ = self
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            calls_started: self.calls_started.load(Ordering::Relaxed),
            active_calls: self.active_calls.load(Ordering::Relaxed),
            transcriptions: self.transcriptions.load(Ordering::Relaxed),
            replies_spoken: self.replies_spoken.load(Ordering::Relaxed),
            turns_abandoned: self.turns_abandoned.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            malformed_replies: self.malformed_replies.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
        }
    }
}

/// The stateless collaborators a call talks to.
///
/// Cloning is cheap; every call gets its own clone at connect time.
#[derive(Clone)]
pub struct Backends {
    pub speech: SpeechBackend,
    pub dialogue: Arc<dyn DialogueBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub codec: Arc<dyn CodecAdapter>,
}

impl Backends {
    /// Build the HTTP/WebSocket clients described by `config`.
    ///
    /// All HTTP backends share one connection pool.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()?;
        Ok(Self::with_client(config, client))
    }

    fn with_client(config: &AppConfig, client: reqwest::Client) -> Self {
        let backends = &config.backends;
        let timeouts = &config.timeouts;

        let speech = match backends.stt_mode {
            SttMode::Batch => SpeechBackend::Batch(Arc::new(WhisperHttpStt::new(
                client.clone(),
                &backends.whisper_url,
                backends.stt_language.clone(),
                timeouts.stt(),
            ))),
            SttMode::Streaming => SpeechBackend::Streaming(Arc::new(WebSocketStreamingStt::new(
                backends.streaming_stt_url.clone(),
                timeouts.stt(),
            ))),
        };

        Self {
            speech,
            dialogue: Arc::new(WebhookDialogue::new(
                client.clone(),
                backends.dialogue_url.clone(),
                timeouts.dialogue(),
            )),
            tts: Arc::new(HttpTts::new(client, &backends.tts_url, timeouts.tts())),
            codec: Arc::new(TelephonyCodec::new(
                config.voice.wire_sample_rate,
                config.voice.backend_sample_rate,
            )),
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let backends = Backends::from_config(&config)?;
        Ok(Self::with_backends(config, backends))
    }

    /// State with explicit backends (fakes in tests).
    pub fn with_backends(config: AppConfig, backends: Backends) -> Self {
        let sessions = SessionManager::new(config.performance.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            call_metrics: Arc::new(CallMetrics::default()),
            sessions: Arc::new(sessions),
            backends: Arc::new(RwLock::new(backends)),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn get_backends(&self) -> Backends {
        self.backends.read().clone()
    }

    /// Validate and install a new configuration.
    ///
    /// Backends are rebuilt so new calls see new URLs and timeouts; calls
    /// already in progress keep the clients they started with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        let backends = Backends::from_config(&new_config).map_err(|e| e.to_string())?;

        self.sessions
            .set_capacity(new_config.performance.max_concurrent_sessions);
        *self.backends.write() = backends;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_active_calls_never_underflow() {
        let metrics = CallMetrics::default();
        metrics.call_ended();
        metrics.call_started();
        metrics.call_ended();
        metrics.call_ended();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_started, 1);
        assert_eq!(snapshot.active_calls, 0);
    }

    #[test]
    fn test_invalid_config_update_is_rejected() {
        let state = AppState::new(AppConfig::default()).unwrap();
        let mut bad = state.get_config();
        bad.server.port = 0;

        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }

    #[test]
    fn test_config_update_switches_stt_mode() {
        let state = AppState::new(AppConfig::default()).unwrap();
        assert_eq!(state.get_backends().speech.mode_name(), "batch");

        let mut config = state.get_config();
        config.backends.stt_mode = SttMode::Streaming;
        state.update_config(config).unwrap();
        assert_eq!(state.get_backends().speech.mode_name(), "streaming");
    }
}
