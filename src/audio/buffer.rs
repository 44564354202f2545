//! # Utterance Buffer
//!
//! Accumulates inbound telephony frames between utterance boundaries. The
//! whole buffer is handed to transcription in one atomic swap, so a frame is
//! either part of the utterance being transcribed or seeds the next one,
//! never both and never neither.

use std::time::Duration;
use tokio::time::Instant;

/// One inbound audio frame as received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Raw wire bytes (mu-law)
    pub payload: Vec<u8>,
    /// When the frame reached the gateway
    pub received_at: Instant,
}

impl AudioFrame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            received_at: Instant::now(),
        }
    }
}

/// A complete utterance taken out of the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Concatenated wire bytes, in arrival order
    pub audio: Vec<u8>,
    pub frame_count: usize,
    pub duration: Duration,
}

/// Ordered frames accumulated since the last utterance boundary.
#[derive(Debug)]
pub struct UtteranceBuffer {
    frames: Vec<AudioFrame>,
    total_bytes: usize,
    bytes_per_second: u64,
}

impl UtteranceBuffer {
    /// `bytes_per_second` of the wire format (8000 for 8kHz mu-law).
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            frames: Vec::new(),
            total_bytes: 0,
            bytes_per_second: bytes_per_second.max(1),
        }
    }

    pub fn push(&mut self, frame: AudioFrame) {
        self.total_bytes += frame.payload.len();
        self.frames.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Audio time covered by the buffered bytes.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.total_bytes as u64 * 1000 / self.bytes_per_second)
    }

    /// Swap the buffered frames out, leaving the buffer empty.
    pub fn take(&mut self) -> Utterance {
        let duration = self.duration();
        let frames = std::mem::take(&mut self.frames);
        self.total_bytes = 0;

        let frame_count = frames.len();
        let mut audio = Vec::with_capacity(frames.iter().map(|f| f.payload.len()).sum());
        for frame in frames {
            audio.extend_from_slice(&frame.payload);
        }

        Utterance {
            audio,
            frame_count,
            duration,
        }
    }

    /// Drop everything (session teardown only).
    pub fn clear(&mut self) {
        self.frames.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_follows_byte_count() {
        let mut buffer = UtteranceBuffer::new(8000);
        for _ in 0..60 {
            buffer.push(AudioFrame::new(vec![0xFF; 160]));
        }
        assert_eq!(buffer.duration(), Duration::from_millis(1200));
        assert_eq!(buffer.len_bytes(), 9600);
    }

    #[test]
    fn test_take_preserves_order_and_empties_buffer() {
        let mut buffer = UtteranceBuffer::new(8000);
        buffer.push(AudioFrame::new(vec![1, 2]));
        buffer.push(AudioFrame::new(vec![3]));
        buffer.push(AudioFrame::new(vec![4, 5, 6]));

        let utterance = buffer.take();
        assert_eq!(utterance.audio, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(utterance.frame_count, 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len_bytes(), 0);
        assert_eq!(buffer.duration(), Duration::ZERO);
    }

    #[test]
    fn test_frames_after_take_start_a_new_utterance() {
        let mut buffer = UtteranceBuffer::new(8000);
        buffer.push(AudioFrame::new(vec![1; 160]));
        let first = buffer.take();
        buffer.push(AudioFrame::new(vec![2; 160]));
        let second = buffer.take();

        assert!(first.audio.iter().all(|&b| b == 1));
        assert!(second.audio.iter().all(|&b| b == 2));
    }
}
