//! # Transcription Module
//!
//! Speech-to-text for call audio, behind one capability with two strategies:
//!
//! - **Batch**: the gateway segments utterances itself and posts each one as a
//!   WAV file to a Whisper-style HTTP service (`whisper.rs`).
//! - **Streaming**: every inbound frame is forwarded over a WebSocket to a
//!   provider that segments on its side and pushes partial/final transcripts
//!   back (`streaming.rs`).
//!
//! The call session is written once against [`SpeechBackend`]; it never
//! knows which concrete service is behind it.

pub mod engine;      // SpeechBackend capability and transcript events
pub mod streaming;   // WebSocket streaming STT client
pub mod whisper;     // Whisper HTTP batch STT client

pub use engine::{BatchStt, SpeechBackend, StreamingStt, SttStream, TranscriptEvent};
pub use streaming::WebSocketStreamingStt;
pub use whisper::WhisperHttpStt;
