//! # Streaming STT Client
//!
//! Opens one WebSocket per call to a streaming transcription service.
//!
//! ## Wire protocol:
//! - **Upstream**: binary messages of little-endian PCM16 at the backend rate
//! - **Downstream**: text messages `{"text": "...", "is_final": true}`
//!   (`isFinal` and `transcript` are accepted as aliases)
//!
//! Two tasks pump the halves of the socket so neither direction can stall
//! the other. Both end when the call drops its [`SttStream`].

use super::engine::{StreamingStt, SttStream, TranscriptEvent};
use crate::error::{Backend, GatewayError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct WireTranscript {
    #[serde(default, alias = "transcript")]
    text: String,
    #[serde(default, alias = "isFinal")]
    is_final: bool,
}

/// WebSocket client for a streaming transcription service.
pub struct WebSocketStreamingStt {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketStreamingStt {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamingStt for WebSocketStreamingStt {
    async fn open(&self, call_id: &str) -> Result<SttStream, GatewayError> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| GatewayError::BackendTimeout {
                backend: Backend::Stt,
                after: self.connect_timeout,
            })?
            .map_err(|e| GatewayError::failure(Backend::Stt, e))?;
        info!("Streaming STT connected for call {}", call_id);

        let (mut upstream, mut downstream) = socket.split();
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer_call = call_id.to_string();
        tokio::spawn(async move {
            while let Some(pcm) = audio_rx.recv().await {
                if let Err(e) = upstream.send(Message::Binary(pcm)).await {
                    warn!("Streaming STT send failed for call {}: {}", writer_call, e);
                    break;
                }
            }
            let _ = upstream.close().await;
            debug!("Streaming STT upstream closed for call {}", writer_call);
        });

        let reader_call = call_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = downstream.next().await {
                match message {
                    Ok(Message::Text(text)) => match parse_transcript_event(&text) {
                        Ok(Some(event)) => {
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Ignoring streaming STT message: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("Streaming STT closed by provider: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Streaming STT receive failed for call {}: {}", reader_call, e);
                        break;
                    }
                }
            }
        });

        Ok(SttStream {
            audio: audio_tx,
            events: events_rx,
        })
    }
}

/// Decode one downstream message. Keep-alives without text yield `None`.
pub fn parse_transcript_event(text: &str) -> Result<Option<TranscriptEvent>, GatewayError> {
    let wire: WireTranscript =
        serde_json::from_str(text).map_err(|e| GatewayError::malformed(Backend::Stt, e))?;
    if wire.text.trim().is_empty() && !wire.is_final {
        return Ok(None);
    }
    Ok(Some(if wire.is_final {
        TranscriptEvent::final_(wire.text)
    } else {
        TranscriptEvent::partial(wire.text)
    }))
}
