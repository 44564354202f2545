//! # Playback Controller
//!
//! Speaks a reply: synthesize, convert to wire audio, slice into fixed
//! frames and send them at real-time cadence.
//!
//! ## Outbound gate
//! Every outbound event passes through one [`OutboundGate`] per call. It owns
//! the stream id and serializes sends against barge-in: a frame is sent only
//! after checking the cancel token *under the gate lock*, and barge-in
//! cancels the token and emits `clear` under the same lock. Once `clear` is
//! on the wire, no frame of the interrupted reply can follow it.
//!
//! ## Pacing
//! Frame `i` leaves at `start + i * quantum`. The wait between frames races
//! the cancel token, so barge-in never waits out a quantum.

use super::codec::CodecAdapter;
use crate::error::{Backend, GatewayError};
use crate::tts::TtsBackend;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the marker sent after every reply.
pub const END_OF_AUDIO_MARK: &str = "end-of-audio";

/// An event for the caller's side of the media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// One frame of wire audio
    Media { stream_sid: String, payload: Vec<u8> },
    Mark { stream_sid: String, name: String },
    /// Drop whatever audio is buffered but not yet played
    Clear { stream_sid: String },
}

/// The transport's outbound half, as seen by a call.
pub trait MediaSink: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queue one event for delivery. Must not block.
    fn send(&self, event: OutboundEvent) -> Result<(), GatewayError>;
}

/// Result of a send attempted through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSend {
    Sent,
    Cancelled,
}

/// Routing and ordering point for everything a call sends.
pub struct OutboundGate {
    sink: Arc<dyn MediaSink>,
    stream_sid: Mutex<Option<String>>,
}

impl OutboundGate {
    pub fn new(sink: Arc<dyn MediaSink>) -> Self {
        Self {
            sink,
            stream_sid: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    pub fn set_stream_sid(&self, stream_sid: Option<String>) {
        *self.stream_sid.lock() = stream_sid;
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.stream_sid.lock().clone()
    }

    /// Send one playback frame unless `cancel` has fired.
    pub fn send_frame(
        &self,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<FrameSend, GatewayError> {
        let route = self.stream_sid.lock();
        if cancel.is_cancelled() {
            return Ok(FrameSend::Cancelled);
        }
        if !self.sink.is_open() {
            return Err(GatewayError::TransportClosed);
        }
        let stream_sid = route.clone().ok_or(GatewayError::MissingRoutingToken)?;
        self.sink.send(OutboundEvent::Media {
            stream_sid,
            payload,
        })?;
        Ok(FrameSend::Sent)
    }

    pub fn send_mark(&self, name: &str) -> Result<(), GatewayError> {
        let route = self.stream_sid.lock();
        if !self.sink.is_open() {
            return Err(GatewayError::TransportClosed);
        }
        let stream_sid = route.clone().ok_or(GatewayError::MissingRoutingToken)?;
        self.sink.send(OutboundEvent::Mark {
            stream_sid,
            name: name.to_string(),
        })
    }

    /// Cancel the playback bound to `cancel` and tell the far end to drop
    /// buffered audio.
    pub fn interrupt(&self, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let route = self.stream_sid.lock();
        cancel.cancel();
        if !self.sink.is_open() {
            return Err(GatewayError::TransportClosed);
        }
        let stream_sid = route.clone().ok_or(GatewayError::MissingRoutingToken)?;
        self.sink.send(OutboundEvent::Clear { stream_sid })
    }
}

/// How a reply's playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed { frames_sent: usize },
    /// Barge-in or teardown stopped the reply
    Cancelled { frames_sent: usize, total_frames: usize },
    /// The connection went away mid-reply
    ConnectionLost { frames_sent: usize, total_frames: usize },
}

impl PlaybackOutcome {
    pub fn frames_sent(&self) -> usize {
        match *self {
            PlaybackOutcome::Completed { frames_sent }
            | PlaybackOutcome::Cancelled { frames_sent, .. }
            | PlaybackOutcome::ConnectionLost { frames_sent, .. } => frames_sent,
        }
    }
}

/// Splits wire audio into playback frames; the last one may be shorter.
pub fn frame_audio(wire: &[u8], frame_bytes: usize) -> Vec<Vec<u8>> {
    wire.chunks(frame_bytes.max(1)).map(<[u8]>::to_vec).collect()
}

/// Speaks replies for one call.
pub struct PlaybackController {
    tts: Arc<dyn TtsBackend>,
    codec: Arc<dyn CodecAdapter>,
    gate: Arc<OutboundGate>,
    frame_bytes: usize,
    quantum: Duration,
    tts_timeout: Duration,
}

impl PlaybackController {
    pub fn new(
        tts: Arc<dyn TtsBackend>,
        codec: Arc<dyn CodecAdapter>,
        gate: Arc<OutboundGate>,
        frame_bytes: usize,
        quantum: Duration,
        tts_timeout: Duration,
    ) -> Self {
        Self {
            tts,
            codec,
            gate,
            frame_bytes,
            quantum,
            tts_timeout,
        }
    }

    /// Synthesize `text` and play it, stopping as soon as `cancel` fires.
    pub async fn speak(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome, GatewayError> {
        if !self.gate.is_open() {
            return Err(GatewayError::TransportClosed);
        }
        if self.gate.stream_sid().is_none() {
            return Err(GatewayError::MissingRoutingToken);
        }

        let synthesis = tokio::time::timeout(self.tts_timeout, self.tts.synthesize(text));
        let synthesized = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Reply cancelled during synthesis");
                return Ok(PlaybackOutcome::Cancelled { frames_sent: 0, total_frames: 0 });
            }
            result = synthesis => result.map_err(|_| GatewayError::BackendTimeout {
                backend: Backend::Tts,
                after: self.tts_timeout,
            })??,
        };

        let converted_at = std::time::Instant::now();
        let wire = self.codec.wav_to_wire(&synthesized)?;
        debug!(
            tts_bytes = synthesized.len(),
            wire_bytes = wire.len(),
            convert_ms = converted_at.elapsed().as_millis() as u64,
            "Reply audio converted"
        );

        let frames = frame_audio(&wire, self.frame_bytes);
        let outcome = self.play_frames(frames, cancel).await;
        self.finish(&outcome);
        outcome
    }

    async fn play_frames(
        &self,
        frames: Vec<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome, GatewayError> {
        let total_frames = frames.len();
        let started = Instant::now();
        let mut frames_sent = 0;

        for (index, frame) in frames.into_iter().enumerate() {
            if index > 0 {
                let due = started + self.quantum * index as u32;
                tokio::select! {
                    _ = tokio::time::sleep_until(due) => {}
                    _ = cancel.cancelled() => {
                        return Ok(PlaybackOutcome::Cancelled { frames_sent, total_frames });
                    }
                }
            }

            match self.gate.send_frame(frame, cancel) {
                Ok(FrameSend::Sent) => frames_sent += 1,
                Ok(FrameSend::Cancelled) => {
                    return Ok(PlaybackOutcome::Cancelled { frames_sent, total_frames })
                }
                Err(GatewayError::TransportClosed) => {
                    return Ok(PlaybackOutcome::ConnectionLost { frames_sent, total_frames })
                }
                Err(GatewayError::MissingRoutingToken) => {
                    error!(
                        frames_sent,
                        total_frames, "Stream id vanished mid-reply; aborting playback"
                    );
                    return Err(GatewayError::MissingRoutingToken);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            frames_sent,
            total_frames,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reply audio sent"
        );
        Ok(PlaybackOutcome::Completed { frames_sent })
    }

    /// End-of-audio marker after a started reply, if the far end can still take it.
    fn finish(&self, outcome: &Result<PlaybackOutcome, GatewayError>) {
        match outcome {
            Ok(PlaybackOutcome::Cancelled {
                frames_sent,
                total_frames,
            }) => info!(frames_sent, total_frames, "Reply interrupted"),
            Ok(PlaybackOutcome::ConnectionLost {
                frames_sent,
                total_frames,
            }) => warn!(frames_sent, total_frames, "Connection closed during reply"),
            _ => {}
        }

        if !self.gate.is_open() {
            return;
        }
        match self.gate.send_mark(END_OF_AUDIO_MARK) {
            Ok(()) => debug!("End-of-audio mark sent"),
            Err(e) => debug!("End-of-audio mark not sent: {}", e),
        }
    }
}
