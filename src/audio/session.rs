//! # Call Session
//!
//! One [`CallSession`] per media-stream connection. It owns every piece of
//! per-call state and runs as a single task: transport events, silence
//! deadlines, streaming transcripts and the results of backend calls are all
//! handled one at a time by the same event loop, so no per-call state is
//! ever touched concurrently.
//!
//! ## Conversational loop:
//! ```text
//! Idle -(start)-> Listening -(utterance)-> AwaitingTranscript -(transcript)-> Dispatching
//!      -(reply)-> Speaking -(finished | barge-in)-> Listening -(stop)-> Idle -(close)-> Closed
//! ```
//!
//! Backend calls run as spawned tasks and report back over an internal
//! channel; the loop never waits on a backend. Each kind of work is
//! serialized:
//! - **Transcription**: at most one outstanding per call
//! - **Dispatch**: transcripts queue up and are sent one at a time, in order
//! - **Playback**: a new reply waits for the previous one to resolve
//!
//! ## Session Registry:
//! [`SessionManager`] keeps a snapshot of every live call for the HTTP API
//! and enforces the concurrent call limit.

use crate::audio::buffer::{AudioFrame, Utterance};
use crate::audio::codec::CodecAdapter;
use crate::audio::playback::{MediaSink, OutboundGate, PlaybackController, PlaybackOutcome};
use crate::audio::segmenter::{
    classify, BatchSegmenter, BoundaryDecision, SegmenterSignal, StreamingDecision,
    StreamingSegmenter, VoiceActivitySegmenter,
};
use crate::config::{TimeoutsConfig, VoiceConfig};
use crate::dialogue::{CallMetadata, TranscriptDispatcher};
use crate::error::{Backend, GatewayError};
use crate::state::{Backends, CallMetrics};
use crate::transcription::{SpeechBackend, SttStream};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Where a call is in the conversational loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Connected, no stream yet (or the stream stopped)
    Idle,
    Listening,
    AwaitingTranscript,
    Dispatching,
    Speaking,
    /// Connection gone; terminal
    Closed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Listening => "listening",
            CallState::AwaitingTranscript => "awaiting_transcript",
            CallState::Dispatching => "dispatching",
            CallState::Speaking => "speaking",
            CallState::Closed => "closed",
        }
    }
}

/// Stream metadata carried by the transport's `start` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Routing token for outbound audio
    pub stream_sid: Option<String>,
    pub call_sid: String,
    pub caller_number: Option<String>,
}

/// Transport-agnostic inbound events, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Start(StreamMetadata),
    /// One frame of wire audio
    Media(Vec<u8>),
    /// The far end played up to one of our marks
    Mark(String),
    Stop,
}

/// Everything a new call needs from the process.
#[derive(Clone)]
pub struct SessionContext {
    pub connection_id: String,
    pub backends: Backends,
    pub voice: VoiceConfig,
    pub timeouts: TimeoutsConfig,
    pub metrics: Arc<CallMetrics>,
    pub registry: Arc<SessionManager>,
}

/// Results reported back to the loop by spawned turn work.
enum TurnEvent {
    SttConnected(Result<SttStream, GatewayError>),
    Transcribed(Result<String, GatewayError>),
    Replied(Result<Option<String>, GatewayError>),
    PlaybackFinished {
        generation: u64,
        result: Result<PlaybackOutcome, GatewayError>,
    },
}

/// Start a call session task and return its inbound event sender.
///
/// Dropping the sender tears the session down.
pub fn spawn_call(
    context: SessionContext,
    sink: Arc<dyn MediaSink>,
) -> (mpsc::UnboundedSender<TransportEvent>, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let span = info_span!("call", connection_id = %context.connection_id);
    let session = CallSession::new(context, sink);
    let handle = tokio::spawn(session.run(events_rx).instrument(span));
    (events_tx, handle)
}

/// All state of one call.
pub struct CallSession {
    connection_id: String,
    metadata: CallMetadata,
    stream_sid: Option<String>,
    state: CallState,

    started: bool,
    stopped: bool,
    /// A reply is playing (or queued behind one that is)
    speaking: bool,
    transcribing: bool,
    dispatching: bool,

    last_frame_at: Option<Instant>,
    pending_transcripts: VecDeque<String>,
    playback_generation: u64,
    turns: u64,

    segmenter: VoiceActivitySegmenter,
    speech: SpeechBackend,
    codec: Arc<dyn CodecAdapter>,
    dispatcher: Arc<TranscriptDispatcher>,
    playback: Arc<PlaybackController>,
    gate: Arc<OutboundGate>,
    /// Parent of every playback's cancel token; replaced after each barge-in
    barge_in: CancellationToken,
    stt_timeout: Duration,

    metrics: Arc<CallMetrics>,
    registry: Arc<SessionManager>,

    turn_tx: mpsc::UnboundedSender<TurnEvent>,
    turn_rx: mpsc::UnboundedReceiver<TurnEvent>,
    connect_task: Option<JoinHandle<()>>,
    transcription_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
    playback_task: Option<JoinHandle<()>>,
}

impl CallSession {
    pub fn new(context: SessionContext, sink: Arc<dyn MediaSink>) -> Self {
        let SessionContext {
            connection_id,
            backends,
            voice,
            timeouts,
            metrics,
            registry,
        } = context;

        let segmenter = match &backends.speech {
            SpeechBackend::Batch(_) => VoiceActivitySegmenter::Batch(BatchSegmenter::new(
                voice.wire_bytes_per_second(),
                voice.silence_threshold(),
                voice.min_utterance(),
            )),
            SpeechBackend::Streaming(_) => {
                VoiceActivitySegmenter::Streaming(StreamingSegmenter::new())
            }
        };

        let gate = Arc::new(OutboundGate::new(sink));
        let playback = PlaybackController::new(
            backends.tts.clone(),
            backends.codec.clone(),
            gate.clone(),
            voice.frame_bytes,
            voice.frame_duration(),
            timeouts.tts(),
        );
        let dispatcher = TranscriptDispatcher::new(backends.dialogue.clone(), timeouts.dialogue());
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();

        Self {
            connection_id,
            metadata: CallMetadata::default(),
            stream_sid: None,
            state: CallState::Idle,
            started: false,
            stopped: false,
            speaking: false,
            transcribing: false,
            dispatching: false,
            last_frame_at: None,
            pending_transcripts: VecDeque::new(),
            playback_generation: 0,
            turns: 0,
            segmenter,
            speech: backends.speech,
            codec: backends.codec,
            dispatcher: Arc::new(dispatcher),
            playback: Arc::new(playback),
            gate,
            barge_in: CancellationToken::new(),
            stt_timeout: timeouts.stt(),
            metrics,
            registry,
            turn_tx,
            turn_rx,
            connect_task: None,
            transcription_task: None,
            dispatch_task: None,
            playback_task: None,
        }
    }

    /// Event loop. Returns when the transport side hangs up.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        self.metrics.call_started();
        info!(stt_mode = self.speech.mode_name(), "Call session opened");

        loop {
            tokio::select! {
                biased;
                event = inbound.recv() => match event {
                    Some(event) => self.on_transport(event),
                    None => break,
                },
                Some(event) = self.turn_rx.recv() => self.on_turn_event(event),
                signal = self.segmenter.next_signal() => self.on_segmenter_signal(signal),
            }
            self.refresh_state();
        }

        self.teardown();
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => debug!("Media stream connected"),
            TransportEvent::Start(metadata) => self.on_start(metadata),
            TransportEvent::Media(payload) => self.on_media(payload),
            TransportEvent::Mark(name) => debug!(mark = %name, "Playback reached mark"),
            TransportEvent::Stop => self.on_stop(),
        }
    }

    fn on_start(&mut self, metadata: StreamMetadata) {
        if self.started {
            warn!("Repeated start message; replacing stream metadata");
        }
        info!(
            call_sid = %metadata.call_sid,
            stream_sid = ?metadata.stream_sid,
            "Stream started"
        );
        match &metadata.caller_number {
            Some(number) => info!(caller_number = %number, "Caller identified"),
            None => info!("Caller number not provided"),
        }
        if metadata.stream_sid.is_none() {
            warn!("Start message without streamSid; replies cannot be routed");
        }

        self.gate.set_stream_sid(metadata.stream_sid.clone());
        self.stream_sid = metadata.stream_sid;
        self.metadata = CallMetadata {
            session_id: metadata.call_sid,
            caller_number: metadata.caller_number,
        };
        self.started = true;

        self.connect_streaming_stt();

        let snapshot_metadata = self.metadata.clone();
        let stream_sid = self.stream_sid.clone();
        self.registry.update(&self.connection_id, |snapshot| {
            snapshot.call_sid = Some(snapshot_metadata.session_id);
            snapshot.caller_number = snapshot_metadata.caller_number;
            snapshot.stream_sid = stream_sid;
        });
    }

    fn on_media(&mut self, payload: Vec<u8>) {
        if !self.started {
            debug!("Media before start ignored");
            return;
        }
        if self.stopped {
            debug!("Media after stop ignored");
            return;
        }

        let frame = AudioFrame::new(payload);
        self.last_frame_at = Some(frame.received_at);
        match &mut self.segmenter {
            VoiceActivitySegmenter::Batch(segmenter) => segmenter.on_frame(frame),
            VoiceActivitySegmenter::Streaming(segmenter) => {
                segmenter.on_audio(self.codec.wire_to_pcm(&frame.payload))
            }
        }
    }

    fn on_stop(&mut self) {
        info!("Stream stopped");
        self.stopped = true;
        let flushed = match &mut self.segmenter {
            VoiceActivitySegmenter::Batch(segmenter) => segmenter.flush(self.transcribing),
            VoiceActivitySegmenter::Streaming(segmenter) => {
                segmenter.finish_audio();
                None
            }
        };
        if let Some(utterance) = flushed {
            info!("Flushing remaining audio after stop");
            self.start_transcription(utterance);
        }
    }

    fn on_segmenter_signal(&mut self, signal: SegmenterSignal) {
        match signal {
            SegmenterSignal::SilenceElapsed => {
                let VoiceActivitySegmenter::Batch(segmenter) = &mut self.segmenter else {
                    return;
                };
                let since_last_frame_ms = self
                    .last_frame_at
                    .map(|at| at.elapsed().as_millis() as u64)
                    .unwrap_or_default();
                match segmenter.on_silence(self.transcribing) {
                    BoundaryDecision::Transcribe(utterance) => {
                        debug!(since_last_frame_ms, "Silence ended the utterance");
                        self.start_transcription(utterance);
                    }
                    BoundaryDecision::TooShort(buffered) => debug!(
                        buffered_ms = buffered.as_millis() as u64,
                        "Utterance too short, waiting for more audio"
                    ),
                    BoundaryDecision::Deferred => debug!(
                        buffered_ms = segmenter.buffered().as_millis() as u64,
                        "Transcription outstanding, utterance boundary deferred"
                    ),
                    BoundaryDecision::Empty => {}
                }
            }
            SegmenterSignal::Transcript(event) => {
                if event.is_final && !event.text.trim().is_empty() {
                    CallMetrics::incr(&self.metrics.transcriptions);
                    info!(transcript = %event.text.trim(), "Caller said");
                }
                match classify(&event, self.speaking) {
                    StreamingDecision::Ignore => {}
                    StreamingDecision::BargeIn => self.barge_in(),
                    StreamingDecision::Dispatch(transcript) => self.enqueue_transcript(transcript),
                    StreamingDecision::BargeInAndDispatch(transcript) => {
                        self.barge_in();
                        self.enqueue_transcript(transcript);
                    }
                }
            }
            SegmenterSignal::StreamEnded => {
                warn!("Streaming STT closed, call continues without transcription")
            }
        }
    }

    fn on_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::SttConnected(result) => self.on_stt_connected(result),
            TurnEvent::Transcribed(result) => self.on_transcribed(result),
            TurnEvent::Replied(result) => self.on_replied(result),
            TurnEvent::PlaybackFinished { generation, result } => {
                self.on_playback_finished(generation, result)
            }
        }
    }

    /// Open the upstream stream off the event loop; audio is held meanwhile.
    fn connect_streaming_stt(&mut self) {
        let (SpeechBackend::Streaming(stt), VoiceActivitySegmenter::Streaming(segmenter)) =
            (&self.speech, &mut self.segmenter)
        else {
            return;
        };
        if !segmenter.needs_connect() {
            return;
        }
        segmenter.begin_connect();

        let stt = stt.clone();
        let call_id = self.metadata.session_id.clone();
        let tx = self.turn_tx.clone();
        let task = async move {
            let result = stt.open(&call_id).await;
            let _ = tx.send(TurnEvent::SttConnected(result));
        };
        self.connect_task = Some(tokio::spawn(task.in_current_span()));
    }

    fn on_stt_connected(&mut self, result: Result<SttStream, GatewayError>) {
        self.connect_task = None;
        let VoiceActivitySegmenter::Streaming(segmenter) = &mut self.segmenter else {
            return;
        };
        match result {
            Ok(stream) => {
                info!("Streaming STT connected");
                segmenter.attach(stream);
            }
            Err(e) => {
                warn!("Streaming STT unavailable, call continues without it: {}", e);
                segmenter.connect_failed();
            }
        }
    }

    fn start_transcription(&mut self, utterance: Utterance) {
        let SpeechBackend::Batch(stt) = &self.speech else {
            return;
        };
        let stt = stt.clone();
        let codec = self.codec.clone();
        let timeout = self.stt_timeout;
        let tx = self.turn_tx.clone();

        self.transcribing = true;
        CallMetrics::incr(&self.metrics.transcriptions);
        info!(
            bytes = utterance.audio.len(),
            frames = utterance.frame_count,
            duration_ms = utterance.duration.as_millis() as u64,
            "Transcribing utterance"
        );

        let task = async move {
            let result = async {
                let wav = codec.wire_to_wav(&utterance.audio)?;
                tokio::time::timeout(timeout, stt.transcribe(wav))
                    .await
                    .map_err(|_| GatewayError::BackendTimeout {
                        backend: Backend::Stt,
                        after: timeout,
                    })?
            }
            .await;
            let _ = tx.send(TurnEvent::Transcribed(result));
        };
        self.transcription_task = Some(tokio::spawn(task.in_current_span()));
    }

    fn on_transcribed(&mut self, result: Result<String, GatewayError>) {
        self.transcribing = false;
        self.transcription_task = None;

        match result {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    debug!("Empty transcript discarded");
                } else {
                    info!(transcript = %text, "Caller said");
                    self.enqueue_transcript(text.to_string());
                }
            }
            Err(e) => {
                warn!("Transcription failed, turn abandoned: {}", e);
                CallMetrics::incr(&self.metrics.turns_abandoned);
            }
        }

        let next = match &mut self.segmenter {
            VoiceActivitySegmenter::Batch(segmenter) => segmenter.on_transcription_finished(),
            VoiceActivitySegmenter::Streaming(_) => None,
        };
        if let Some(utterance) = next {
            self.start_transcription(utterance);
        }
    }

    fn enqueue_transcript(&mut self, transcript: String) {
        self.pending_transcripts.push_back(transcript);
        self.dispatch_next();
    }

    fn dispatch_next(&mut self) {
        if self.dispatching {
            if !self.pending_transcripts.is_empty() {
                debug!(
                    queued = self.pending_transcripts.len(),
                    "Dialogue request outstanding, transcript queued"
                );
            }
            return;
        }
        let Some(transcript) = self.pending_transcripts.pop_front() else {
            return;
        };

        self.dispatching = true;
        let dispatcher = self.dispatcher.clone();
        let metadata = self.metadata.clone();
        let tx = self.turn_tx.clone();
        let task = async move {
            let result = dispatcher.dispatch(&transcript, &metadata).await;
            let _ = tx.send(TurnEvent::Replied(result));
        };
        self.dispatch_task = Some(tokio::spawn(task.in_current_span()));
    }

    fn on_replied(&mut self, result: Result<Option<String>, GatewayError>) {
        self.dispatching = false;
        self.dispatch_task = None;

        match result {
            Ok(Some(reply)) => self.start_playback(reply),
            Ok(None) => info!("No reply for this turn"),
            Err(e) if e.is_misconfiguration() => {
                error!("Dialogue backend misconfigured, reply not spoken: {}", e);
                CallMetrics::incr(&self.metrics.malformed_replies);
                CallMetrics::incr(&self.metrics.turns_abandoned);
            }
            Err(e) => {
                warn!("Dialogue request failed, turn abandoned: {}", e);
                CallMetrics::incr(&self.metrics.turns_abandoned);
            }
        }

        self.dispatch_next();
    }

    fn start_playback(&mut self, reply: String) {
        self.playback_generation += 1;
        let generation = self.playback_generation;
        self.speaking = true;

        let cancel = self.barge_in.child_token();
        let previous = self.playback_task.take();
        let playback = self.playback.clone();
        let tx = self.turn_tx.clone();
        let task = async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = playback.speak(&reply, &cancel).await;
            let _ = tx.send(TurnEvent::PlaybackFinished { generation, result });
        };
        self.playback_task = Some(tokio::spawn(task.in_current_span()));
    }

    fn on_playback_finished(
        &mut self,
        generation: u64,
        result: Result<PlaybackOutcome, GatewayError>,
    ) {
        if generation == self.playback_generation {
            self.speaking = false;
            self.playback_task = None;
        }

        match result {
            Ok(outcome) => {
                CallMetrics::add(&self.metrics.frames_sent, outcome.frames_sent() as u64);
                if let PlaybackOutcome::Completed { .. } = outcome {
                    CallMetrics::incr(&self.metrics.replies_spoken);
                    self.turns += 1;
                    let turns = self.turns;
                    self.registry
                        .update(&self.connection_id, |snapshot| snapshot.turns = turns);
                }
            }
            Err(e) => {
                warn!("Reply playback failed: {}", e);
                CallMetrics::incr(&self.metrics.turns_abandoned);
            }
        }
    }

    /// Stop the playing reply and flush the caller-side buffer.
    fn barge_in(&mut self) {
        if !self.speaking {
            return;
        }
        info!("Barge-in, stopping reply");
        CallMetrics::incr(&self.metrics.barge_ins);

        if let Err(e) = self.gate.interrupt(&self.barge_in) {
            debug!("Clear not sent: {}", e);
        }
        self.barge_in = CancellationToken::new();
        self.speaking = false;
    }

    fn refresh_state(&mut self) {
        let state = if !self.started {
            CallState::Idle
        } else if self.speaking {
            CallState::Speaking
        } else if self.dispatching {
            CallState::Dispatching
        } else if self.transcribing {
            CallState::AwaitingTranscript
        } else if self.stopped {
            CallState::Idle
        } else {
            CallState::Listening
        };

        if state != self.state {
            debug!(from = self.state.as_str(), to = state.as_str(), "Call state changed");
            self.state = state;
            self.registry
                .update(&self.connection_id, |snapshot| snapshot.state = state);
        }
    }

    fn teardown(&mut self) {
        self.state = CallState::Closed;
        self.segmenter.teardown();
        self.barge_in.cancel();
        for task in [
            self.connect_task.take(),
            self.transcription_task.take(),
            self.dispatch_task.take(),
            self.playback_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.gate.set_stream_sid(None);
        self.pending_transcripts.clear();

        self.registry.remove(&self.connection_id);
        self.metrics.call_ended();
        info!(turns = self.turns, "Call session closed");
    }
}

/// Snapshot of one live call for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub connection_id: String,
    pub call_sid: Option<String>,
    pub stream_sid: Option<String>,
    pub caller_number: Option<String>,
    pub state: CallState,
    pub stt_mode: &'static str,
    /// Replies spoken to completion
    pub turns: u64,
    pub started_at: DateTime<Utc>,
}

/// Registry of live calls and the concurrent call limit.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, CallSnapshot>>,
    max_concurrent_sessions: AtomicUsize,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: AtomicUsize::new(max_concurrent_sessions),
        }
    }

    pub fn set_capacity(&self, max_concurrent_sessions: usize) {
        self.max_concurrent_sessions
            .store(max_concurrent_sessions, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::Relaxed)
    }

    /// Admit a new connection.
    ///
    /// ## Returns:
    /// - **Ok(())**: Registered in `Idle`
    /// - **Err(message)**: At capacity, or the id is already taken
    pub fn register(&self, connection_id: &str, stt_mode: &'static str) -> Result<(), String> {
        let mut sessions = self.sessions.write();
        let capacity = self.capacity();
        if sessions.len() >= capacity {
            return Err(format!("Maximum concurrent calls ({}) reached", capacity));
        }
        if sessions.contains_key(connection_id) {
            return Err(format!("Connection '{}' already exists", connection_id));
        }

        sessions.insert(
            connection_id.to_string(),
            CallSnapshot {
                connection_id: connection_id.to_string(),
                call_sid: None,
                stream_sid: None,
                caller_number: None,
                state: CallState::Idle,
                stt_mode,
                turns: 0,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Apply `change` to a call's snapshot, if it is still registered.
    pub fn update(&self, connection_id: &str, change: impl FnOnce(&mut CallSnapshot)) {
        if let Some(snapshot) = self.sessions.write().get_mut(connection_id) {
            change(snapshot);
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<CallSnapshot> {
        self.sessions.read().get(connection_id).cloned()
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        self.sessions.write().remove(connection_id).is_some()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// All live calls, oldest first.
    pub fn list(&self) -> Vec<CallSnapshot> {
        let mut calls: Vec<CallSnapshot> = self.sessions.read().values().cloned().collect();
        calls.sort_by_key(|call| call.started_at);
        calls
    }
}
