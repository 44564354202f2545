//! # Media Stream WebSocket Handler
//!
//! Transport adapter for Twilio-style media streams. The telephony provider
//! connects to `/media-stream` (or `/`) and exchanges JSON text frames:
//!
//! ## Inbound (provider → gateway):
//! - `connected`: informational
//! - `start`: stream and call metadata
//! - `media`: base64 mu-law 8kHz mono, one 20ms frame per message
//! - `mark`: the provider played up to one of our marks
//! - `stop`: the stream ended
//!
//! ## Outbound (gateway → provider):
//! - `media` with `streamSid` and a base64 payload
//! - `mark` named `end-of-audio` after each reply
//! - `clear` on barge-in
//!
//! Each connection is one actix actor. The actor only translates messages;
//! the conversational loop runs in the call session task it spawns.

use crate::audio::playback::{MediaSink, OutboundEvent};
use crate::audio::session::{
    spawn_call, SessionContext, SessionManager, StreamMetadata, TransportEvent,
};
use crate::config::PerformanceConfig;
use crate::error::{AppError, GatewayError};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbound media-stream messages, discriminated by `event`.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundMessage {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        #[serde(default)]
        start: Value,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },
    Stop {},
}

#[derive(Debug, Deserialize, Serialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct MarkPayload {
    name: String,
}

/// Outbound media-stream messages.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundMessage<'a> {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        mark: MarkPayload,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
}

/// Where the caller number may hide in a `start` message, in probe order.
const CALLER_NUMBER_FIELDS: &[&str] = &[
    "/customParameters/callerNumber",
    "/customParameters/from",
    "/from",
    "/call/from",
];

/// Translate one inbound text frame into a transport event.
pub fn parse_inbound(text: &str) -> Result<TransportEvent, GatewayError> {
    let message: InboundMessage = serde_json::from_str(text)
        .map_err(|e| GatewayError::Protocol(format!("unrecognized message: {}", e)))?;

    Ok(match message {
        InboundMessage::Connected { protocol } => {
            debug!(protocol = ?protocol, "Provider connected");
            TransportEvent::Connected
        }
        InboundMessage::Start { stream_sid, start } => {
            TransportEvent::Start(stream_metadata(stream_sid, &start))
        }
        InboundMessage::Media { media } => {
            let audio = STANDARD
                .decode(media.payload.as_bytes())
                .map_err(|e| GatewayError::Protocol(format!("invalid media payload: {}", e)))?;
            TransportEvent::Media(audio)
        }
        InboundMessage::Mark { mark } => {
            TransportEvent::Mark(mark.map(|m| m.name).unwrap_or_default())
        }
        InboundMessage::Stop {} => TransportEvent::Stop,
    })
}

/// Pull stream metadata out of a `start` body.
///
/// Missing fields never fail the call: the call id falls back to a fresh
/// UUID and the caller number to `None`.
fn stream_metadata(top_level_stream_sid: Option<String>, start: &Value) -> StreamMetadata {
    let text = |pointer: &str| {
        start
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    StreamMetadata {
        stream_sid: text("/streamSid").or(top_level_stream_sid),
        call_sid: text("/callSid")
            .or_else(|| text("/call/callSid"))
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        caller_number: CALLER_NUMBER_FIELDS.iter().find_map(|field| text(field)),
    }
}

/// Serialize an outbound event as a media-stream JSON frame.
pub fn encode_outbound(event: &OutboundEvent) -> Result<String, GatewayError> {
    let message = match event {
        OutboundEvent::Media {
            stream_sid,
            payload,
        } => OutboundMessage::Media {
            stream_sid,
            media: MediaPayload {
                payload: STANDARD.encode(payload),
            },
        },
        OutboundEvent::Mark { stream_sid, name } => OutboundMessage::Mark {
            stream_sid,
            mark: MarkPayload { name: name.clone() },
        },
        OutboundEvent::Clear { stream_sid } => OutboundMessage::Clear { stream_sid },
    };
    serde_json::to_string(&message).map_err(|e| GatewayError::Protocol(e.to_string()))
}

/// Text frame for the actor to write.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// [`MediaSink`] that writes through the connection's actor.
struct ActorSink {
    addr: Addr<MediaStreamSocket>,
    open: Arc<AtomicBool>,
}

impl MediaSink for ActorSink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.addr.connected()
    }

    fn send(&self, event: OutboundEvent) -> Result<(), GatewayError> {
        if !self.is_open() {
            return Err(GatewayError::TransportClosed);
        }
        self.addr.do_send(SendText(encode_outbound(&event)?));
        Ok(())
    }
}

/// WebSocket actor for one media stream.
pub struct MediaStreamSocket {
    connection_id: String,
    /// Handed to the call session when the actor starts
    context: Option<SessionContext>,
    registry: Arc<SessionManager>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    open: Arc<AtomicBool>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl MediaStreamSocket {
    pub fn new(context: SessionContext, performance: &PerformanceConfig) -> Self {
        Self {
            connection_id: context.connection_id.clone(),
            registry: context.registry.clone(),
            context: Some(context),
            events: None,
            open: Arc::new(AtomicBool::new(true)),
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(performance.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(performance.heartbeat_timeout_secs),
        }
    }

    fn forward(&mut self, event: TransportEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(events) = &self.events else {
            return;
        };
        if events.send(event).is_err() {
            warn!(connection_id = %self.connection_id, "Call session gone, closing media stream");
            ctx.stop();
        }
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Media stream connected");

        if let Some(context) = self.context.take() {
            let sink = Arc::new(ActorSink {
                addr: ctx.address(),
                open: self.open.clone(),
            });
            let (events, _handle) = spawn_call(context, sink);
            self.events = Some(events);
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.last_heartbeat.elapsed() > act.heartbeat_timeout {
                warn!(connection_id = %act.connection_id, "Media stream heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Media stream closed");
        self.open.store(false, Ordering::Release);

        // Dropping the sender ends the call session, which unregisters itself
        if self.events.take().is_none() {
            self.registry.remove(&self.connection_id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match parse_inbound(&text) {
                    Ok(event) => self.forward(event, ctx),
                    Err(e) => warn!(connection_id = %self.connection_id, "Ignoring message: {}", e),
                }
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(bytes = data.len(), "Unexpected binary frame on media stream");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Media stream closed by provider: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Unexpected continuation frame on media stream");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("Media stream protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket endpoint handler.
///
/// Calls beyond `max_concurrent_sessions` are refused with 503 before the
/// upgrade.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let connection_id = Uuid::new_v4().to_string();
    let config = app_state.get_config();
    let backends = app_state.get_backends();

    if let Err(message) = app_state
        .sessions
        .register(&connection_id, backends.speech.mode_name())
    {
        warn!("Refusing media stream: {}", message);
        return Err(AppError::ServiceUnavailable(message).into());
    }

    info!(
        connection_id = %connection_id,
        peer = ?req.connection_info().peer_addr(),
        stt_mode = backends.speech.mode_name(),
        "New media stream request"
    );

    let context = SessionContext {
        connection_id: connection_id.clone(),
        backends,
        voice: config.voice.clone(),
        timeouts: config.timeouts.clone(),
        metrics: app_state.call_metrics.clone(),
        registry: app_state.sessions.clone(),
    };
    let socket = MediaStreamSocket::new(context, &config.performance);

    let response = ws::start(socket, &req, stream);
    if response.is_err() {
        app_state.sessions.remove(&connection_id);
    }
    response
}
