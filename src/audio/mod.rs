//! # Audio Pipeline
//!
//! Everything between the telephony wire and the backends.
//!
//! ## Key Components:
//! - **Codec**: mu-law 8kHz wire audio to and from WAV/PCM for the backends
//! - **Buffer**: Ordered frames of the utterance in progress
//! - **Segmenter**: Decides when an utterance ends (silence or streaming STT)
//! - **Playback**: Paced outbound frames with barge-in cancellation
//! - **Session**: The per-call state machine and the registry of live calls
//!
//! ## Wire Format:
//! - **Encoding**: G.711 mu-law, 8kHz, mono
//! - **Frame**: 160 bytes (20ms), base64 inside the transport's JSON messages

pub mod buffer;
pub mod codec;
pub mod playback;
pub mod segmenter;
pub mod session;
