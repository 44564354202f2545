//! # Speech Backend Capability
//!
//! One abstraction over the two transcription strategies. A call session
//! receives a [`SpeechBackend`] at construction and switches on its variant
//! exactly once, when it builds its segmenter.

use crate::error::GatewayError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A transcript pushed by a streaming provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    /// `false` for an interim hypothesis that may still change
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Request/response transcription of a complete utterance.
#[async_trait]
pub trait BatchStt: Send + Sync {
    /// Transcribe one WAV file. An empty string means nothing was recognized.
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, GatewayError>;
}

/// Continuous transcription over a long-lived connection.
#[async_trait]
pub trait StreamingStt: Send + Sync {
    /// Open a stream for one call.
    async fn open(&self, call_id: &str) -> Result<SttStream, GatewayError>;
}

/// Both directions of an open streaming-STT connection.
///
/// Dropping `audio` ends the upstream half; the provider then flushes its
/// last finals and `events` closes.
pub struct SttStream {
    /// Little-endian PCM16 chunks toward the provider
    pub audio: mpsc::UnboundedSender<Vec<u8>>,
    pub events: mpsc::UnboundedReceiver<TranscriptEvent>,
}

/// Which transcription strategy a call uses.
#[derive(Clone)]
pub enum SpeechBackend {
    Batch(Arc<dyn BatchStt>),
    Streaming(Arc<dyn StreamingStt>),
}

impl SpeechBackend {
    pub fn mode_name(&self) -> &'static str {
        match self {
            SpeechBackend::Batch(_) => "batch",
            SpeechBackend::Streaming(_) => "streaming",
        }
    }
}

impl std::fmt::Debug for SpeechBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpeechBackend::{}", self.mode_name())
    }
}
