//! # Voice Activity Segmenter
//!
//! Decides when the caller has finished an utterance, or has started talking
//! over a reply. Two strategies, picked once per call from the
//! [`SpeechBackend`](crate::transcription::SpeechBackend) variant:
//!
//! ## Batch
//! Frames accumulate in an [`UtteranceBuffer`]. Every frame re-arms a silence
//! deadline; when it expires the session asks [`BatchSegmenter::on_silence`]
//! what to do. Buffers shorter than the minimum utterance are kept and wait
//! for more audio. While a transcription is outstanding, the boundary is
//! remembered instead of acted on.
//!
//! ## Streaming
//! Frames go straight to the provider, which does its own segmentation.
//! [`classify`] maps each incoming transcript event onto barge-in and
//! dispatch decisions.

use super::buffer::{AudioFrame, Utterance, UtteranceBuffer};
use crate::transcription::{SttStream, TranscriptEvent};
use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

/// A cancellable, re-armable one-shot deadline.
///
/// [`SilenceDeadline::expired`] resolves once per arming: firing disarms the
/// deadline in the same poll, so a late frame can never observe a half-fired
/// timer.
#[derive(Debug)]
pub struct SilenceDeadline {
    threshold: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl SilenceDeadline {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            sleep: None,
        }
    }

    /// (Re)start the countdown from now.
    pub fn arm(&mut self) {
        let deadline = Instant::now() + self.threshold;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    pub fn disarm(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves when the armed deadline passes. Pending forever when disarmed.
    pub async fn expired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending::<()>().await,
        }
    }
}

/// What to do at a silence boundary.
#[derive(Debug, PartialEq)]
pub enum BoundaryDecision {
    /// Transcribe this utterance now.
    Transcribe(Utterance),
    /// Buffered audio is below the minimum; keep it and wait for more.
    TooShort(Duration),
    /// A transcription is outstanding; act on this boundary once it resolves.
    Deferred,
    /// Nothing buffered.
    Empty,
}

/// Local silence-based segmentation for batch transcription.
#[derive(Debug)]
pub struct BatchSegmenter {
    buffer: UtteranceBuffer,
    silence: SilenceDeadline,
    min_utterance: Duration,
    boundary_pending: bool,
    stopped: bool,
}

impl BatchSegmenter {
    pub fn new(bytes_per_second: u64, silence_threshold: Duration, min_utterance: Duration) -> Self {
        Self {
            buffer: UtteranceBuffer::new(bytes_per_second),
            silence: SilenceDeadline::new(silence_threshold),
            min_utterance,
            boundary_pending: false,
            stopped: false,
        }
    }

    pub fn on_frame(&mut self, frame: AudioFrame) {
        self.buffer.push(frame);
        self.boundary_pending = false;
        self.silence.arm();
    }

    pub async fn silence_expired(&mut self) {
        self.silence.expired().await
    }

    /// Called when the silence deadline fired.
    pub fn on_silence(&mut self, transcribing: bool) -> BoundaryDecision {
        if self.buffer.is_empty() {
            return BoundaryDecision::Empty;
        }
        if transcribing {
            self.boundary_pending = true;
            return BoundaryDecision::Deferred;
        }
        let buffered = self.buffer.duration();
        if buffered < self.min_utterance {
            return BoundaryDecision::TooShort(buffered);
        }
        self.boundary_pending = false;
        BoundaryDecision::Transcribe(self.buffer.take())
    }

    /// Called when the outstanding transcription resolved, either way.
    ///
    /// Returns the next utterance if a boundary was deferred meanwhile, or if
    /// the stream stopped with audio still buffered.
    pub fn on_transcription_finished(&mut self) -> Option<Utterance> {
        if self.buffer.is_empty() {
            self.boundary_pending = false;
            return None;
        }
        if self.stopped {
            return Some(self.buffer.take());
        }
        if self.boundary_pending && self.buffer.duration() >= self.min_utterance {
            self.boundary_pending = false;
            return Some(self.buffer.take());
        }
        None
    }

    /// End of inbound audio. Whatever is buffered becomes the last utterance,
    /// regardless of length, unless a transcription is still outstanding (it
    /// is then picked up by [`Self::on_transcription_finished`]).
    pub fn flush(&mut self, transcribing: bool) -> Option<Utterance> {
        self.stopped = true;
        self.silence.disarm();
        if self.buffer.is_empty() || transcribing {
            return None;
        }
        Some(self.buffer.take())
    }

    pub fn buffered(&self) -> Duration {
        self.buffer.duration()
    }

    pub fn is_armed(&self) -> bool {
        self.silence.is_armed()
    }

    fn teardown(&mut self) {
        self.silence.disarm();
        if !self.buffer.is_empty() {
            debug!("Discarding {} buffered bytes at teardown", self.buffer.len_bytes());
        }
        self.buffer.clear();
    }
}

/// What a streaming transcript event means for the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingDecision {
    Ignore,
    /// The caller talks over the reply: stop playback.
    BargeIn,
    /// A finished utterance to send to the dialogue backend.
    Dispatch(String),
    /// A finished utterance that also interrupts the reply.
    BargeInAndDispatch(String),
}

/// Classify a streaming transcript given whether a reply is playing.
pub fn classify(event: &TranscriptEvent, speaking: bool) -> StreamingDecision {
    let text = event.text.trim();
    if text.is_empty() {
        return StreamingDecision::Ignore;
    }
    match (event.is_final, speaking) {
        (true, true) => StreamingDecision::BargeInAndDispatch(text.to_string()),
        (true, false) => StreamingDecision::Dispatch(text.to_string()),
        (false, true) => StreamingDecision::BargeIn,
        (false, false) => StreamingDecision::Ignore,
    }
}

/// Provider-side segmentation: forwards audio, surfaces transcript events.
///
/// Audio arriving while the upstream connection is still being opened is
/// held back and replayed on [`attach`](Self::attach).
pub struct StreamingSegmenter {
    audio: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: Option<mpsc::UnboundedReceiver<TranscriptEvent>>,
    connecting: bool,
    backlog: Vec<Vec<u8>>,
    audio_finished: bool,
}

impl StreamingSegmenter {
    pub fn new() -> Self {
        Self {
            audio: None,
            events: None,
            connecting: false,
            backlog: Vec::new(),
            audio_finished: false,
        }
    }

    /// Start holding audio until the upstream stream is attached.
    pub fn begin_connect(&mut self) {
        self.connecting = true;
    }

    /// Neither attached nor waiting for a connection.
    pub fn needs_connect(&self) -> bool {
        !self.connecting && !self.is_attached()
    }

    pub fn attach(&mut self, stream: SttStream) {
        self.connecting = false;
        let backlog = std::mem::take(&mut self.backlog);
        if !backlog.is_empty() {
            debug!(frames = backlog.len(), "Replaying audio held during connect");
        }
        for pcm in backlog {
            if stream.audio.send(pcm).is_err() {
                break;
            }
        }
        self.audio = if self.audio_finished {
            None
        } else {
            Some(stream.audio)
        };
        self.events = Some(stream.events);
    }

    /// The upstream connection could not be opened; drop held audio.
    pub fn connect_failed(&mut self) {
        self.connecting = false;
        self.backlog.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.events.is_some()
    }

    /// Forward one frame of PCM to the provider.
    pub fn on_audio(&mut self, pcm: Vec<u8>) {
        let Some(audio) = self.audio.as_ref() else {
            if self.connecting {
                self.backlog.push(pcm);
            }
            return;
        };
        if audio.send(pcm).is_err() {
            warn!("Streaming STT upstream is gone; continuing without transcription");
            self.audio = None;
        }
    }

    /// Close the upstream half; pending finals still arrive.
    pub fn finish_audio(&mut self) {
        self.audio_finished = true;
        self.audio = None;
    }

    /// Next event from the provider; `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<TranscriptEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => pending().await,
        }
    }

    fn detach(&mut self) {
        self.audio = None;
        self.events = None;
        self.connecting = false;
        self.backlog.clear();
    }
}

impl Default for StreamingSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the segmenter wants the session to react to.
#[derive(Debug)]
pub enum SegmenterSignal {
    SilenceElapsed,
    Transcript(TranscriptEvent),
    StreamEnded,
}

/// The per-call segmenter, one of the two strategies.
pub enum VoiceActivitySegmenter {
    Batch(BatchSegmenter),
    Streaming(StreamingSegmenter),
}

impl VoiceActivitySegmenter {
    /// Resolves with the next signal. Pending forever if there is nothing to wait for.
    pub async fn next_signal(&mut self) -> SegmenterSignal {
        match self {
            VoiceActivitySegmenter::Batch(batch) => {
                batch.silence_expired().await;
                SegmenterSignal::SilenceElapsed
            }
            VoiceActivitySegmenter::Streaming(streaming) => match streaming.next_event().await {
                Some(event) => SegmenterSignal::Transcript(event),
                None => {
                    streaming.detach();
                    SegmenterSignal::StreamEnded
                }
            },
        }
    }

    /// Drop buffered audio, timers and upstream connections.
    pub fn teardown(&mut self) {
        match self {
            VoiceActivitySegmenter::Batch(batch) => batch.teardown(),
            VoiceActivitySegmenter::Streaming(streaming) => streaming.detach(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0xFF; 160])
    }

    fn segmenter() -> BatchSegmenter {
        BatchSegmenter::new(8000, Duration::from_millis(500), Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_once_per_silence() {
        let mut deadline = SilenceDeadline::new(Duration::from_millis(500));
        deadline.arm();
        let started = Instant::now();
        deadline.expired().await;
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert!(!deadline.is_armed());

        let second = tokio::time::timeout(Duration::from_secs(5), deadline.expired()).await;
        assert!(second.is_err(), "disarmed deadline must not fire again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_frame_resets_the_deadline() {
        let mut deadline = SilenceDeadline::new(Duration::from_millis(500));
        let started = Instant::now();
        for _ in 0..10 {
            deadline.arm();
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        deadline.expired().await;
        assert_eq!(started.elapsed(), Duration::from_millis(4000 + 100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_utterance_is_taken_at_silence() {
        let mut seg = segmenter();
        for _ in 0..60 {
            seg.on_frame(frame());
        }
        seg.silence_expired().await;
        match seg.on_silence(false) {
            BoundaryDecision::Transcribe(utterance) => {
                assert_eq!(utterance.audio.len(), 9600);
                assert_eq!(utterance.duration, Duration::from_millis(1200));
            }
            other => panic!("expected Transcribe, got {:?}", other),
        }
        assert_eq!(seg.buffered(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_buffer_is_retained() {
        let mut seg = segmenter();
        for _ in 0..30 {
            seg.on_frame(frame());
        }
        assert_eq!(
            seg.on_silence(false),
            BoundaryDecision::TooShort(Duration::from_millis(600))
        );
        assert_eq!(seg.buffered(), Duration::from_millis(600));

        // More speech completes the utterance
        for _ in 0..30 {
            seg.on_frame(frame());
        }
        assert!(matches!(seg.on_silence(false), BoundaryDecision::Transcribe(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_while_transcribing_is_deferred() {
        let mut seg = segmenter();
        for _ in 0..60 {
            seg.on_frame(frame());
        }
        assert_eq!(seg.on_silence(true), BoundaryDecision::Deferred);
        assert_eq!(seg.buffered(), Duration::from_millis(1200));

        let next = seg.on_transcription_finished().expect("deferred utterance");
        assert_eq!(next.audio.len(), 9600);
        assert!(seg.on_transcription_finished().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_frames_cancel_a_deferred_boundary() {
        let mut seg = segmenter();
        for _ in 0..60 {
            seg.on_frame(frame());
        }
        assert_eq!(seg.on_silence(true), BoundaryDecision::Deferred);
        seg.on_frame(frame());
        assert!(seg.on_transcription_finished().is_none());
        assert!(seg.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_ignores_minimum() {
        let mut seg = segmenter();
        for _ in 0..5 {
            seg.on_frame(frame());
        }
        let last = seg.flush(false).expect("flushed");
        assert_eq!(last.audio.len(), 800);
        assert!(!seg.is_armed());
        assert!(seg.flush(false).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_outstanding_transcription() {
        let mut seg = segmenter();
        for _ in 0..5 {
            seg.on_frame(frame());
        }
        assert!(seg.flush(true).is_none());
        let last = seg.on_transcription_finished().expect("flushed after stop");
        assert_eq!(last.audio.len(), 800);
    }

    #[test]
    fn test_classify_streaming_events() {
        use StreamingDecision::*;
        assert_eq!(classify(&TranscriptEvent::partial("hal"), true), BargeIn);
        assert_eq!(classify(&TranscriptEvent::partial("hal"), false), Ignore);
        assert_eq!(classify(&TranscriptEvent::partial("   "), true), Ignore);
        assert_eq!(
            classify(&TranscriptEvent::final_(" hallo "), false),
            Dispatch("hallo".to_string())
        );
        assert_eq!(
            classify(&TranscriptEvent::final_("stop"), true),
            BargeInAndDispatch("stop".to_string())
        );
        assert_eq!(classify(&TranscriptEvent::final_(""), true), Ignore);
    }

    #[tokio::test]
    async fn test_streaming_segmenter_forwards_and_ends() {
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut seg = VoiceActivitySegmenter::Streaming(StreamingSegmenter::new());
        if let VoiceActivitySegmenter::Streaming(streaming) = &mut seg {
            streaming.attach(SttStream {
                audio: audio_tx,
                events: events_rx,
            });
            streaming.on_audio(vec![1, 2, 3]);
        }
        assert_eq!(audio_rx.recv().await, Some(vec![1, 2, 3]));

        events_tx.send(TranscriptEvent::final_("ja")).unwrap();
        drop(events_tx);
        assert!(matches!(
            seg.next_signal().await,
            SegmenterSignal::Transcript(event) if event.text == "ja"
        ));
        assert!(matches!(seg.next_signal().await, SegmenterSignal::StreamEnded));
    }

    #[tokio::test]
    async fn test_audio_during_connect_is_replayed_on_attach() {
        let mut streaming = StreamingSegmenter::new();
        assert!(streaming.needs_connect());
        streaming.begin_connect();
        assert!(!streaming.needs_connect());

        streaming.on_audio(vec![1]);
        streaming.on_audio(vec![2]);
        streaming.finish_audio();

        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        streaming.attach(SttStream {
            audio: audio_tx,
            events: events_rx,
        });

        assert_eq!(audio_rx.recv().await, Some(vec![1]));
        assert_eq!(audio_rx.recv().await, Some(vec![2]));
        // Stop arrived while connecting, so the upstream half is already closed
        assert_eq!(audio_rx.recv().await, None);
    }

    #[test]
    fn test_failed_connect_drops_held_audio() {
        let mut streaming = StreamingSegmenter::new();
        streaming.begin_connect();
        streaming.on_audio(vec![1]);
        streaming.connect_failed();
        streaming.on_audio(vec![2]);

        assert!(streaming.backlog.is_empty());
        assert!(streaming.needs_connect());
    }
}
