//! Debug endpoints for exercising the backends without a phone call.
//!
//! Both run against the same backend clients new calls would get, so a
//! misconfigured webhook or TTS service shows up here first.

use actix_web::{web, HttpResponse, Result as ActixResult};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::audio::playback::frame_audio;
use crate::dialogue::{CallMetadata, TranscriptDispatcher};
use crate::error::{AppError, Backend, GatewayError};
use crate::state::AppState;

/// Request to run one dialogue turn
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub transcript: String,
    /// Defaults to `debug-<uuid>`
    pub session_id: Option<String>,
    pub caller_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub session_id: String,
    /// `None` when the backend had nothing to say
    pub reply: Option<String>,
    pub latency_ms: u64,
}

/// Request to synthesize a reply
#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SynthesizeResponse {
    pub tts_bytes: usize,
    pub wire_bytes: usize,
    pub frames: usize,
    /// Playback length at the configured frame cadence
    pub duration_ms: u64,
    pub synthesis_ms: u64,
    pub conversion_ms: u64,
}

/// Send a transcript through the TranscriptDispatcher.
///
/// POST /api/v1/debug/dispatch
/// Body: {"transcript": "wie spät ist es", "caller_number": "+49..."}
pub async fn debug_dispatch(
    state: web::Data<AppState>,
    req: web::Json<DispatchRequest>,
) -> ActixResult<HttpResponse, AppError> {
    let req = req.into_inner();
    if req.transcript.trim().is_empty() {
        return Err(AppError::ValidationError("transcript must not be empty".to_string()));
    }

    let config = state.get_config();
    let dispatcher =
        TranscriptDispatcher::new(state.get_backends().dialogue, config.timeouts.dialogue());
    let metadata = CallMetadata {
        session_id: req
            .session_id
            .unwrap_or_else(|| format!("debug-{}", uuid::Uuid::new_v4())),
        caller_number: req.caller_number,
    };

    tracing::info!("Debug: dispatching transcript '{}'", req.transcript);
    let started = Instant::now();
    let reply = dispatcher.dispatch(&req.transcript, &metadata).await?;

    Ok(HttpResponse::Ok().json(DispatchResponse {
        session_id: metadata.session_id,
        reply,
        latency_ms: started.elapsed().as_millis() as u64,
    }))
}

/// Run TTS, the outbound codec and framing on `text`.
///
/// POST /api/v1/debug/synthesize
/// Body: {"text": "Hallo"}
pub async fn debug_synthesize(
    state: web::Data<AppState>,
    req: web::Json<SynthesizeRequest>,
) -> ActixResult<HttpResponse, AppError> {
    if req.text.trim().is_empty() {
        return Err(AppError::ValidationError("text must not be empty".to_string()));
    }

    let config = state.get_config();
    let backends = state.get_backends();
    let timeout = config.timeouts.tts();

    let started = Instant::now();
    let wav = tokio::time::timeout(timeout, backends.tts.synthesize(&req.text))
        .await
        .map_err(|_| GatewayError::BackendTimeout {
            backend: Backend::Tts,
            after: timeout,
        })??;
    let synthesis_ms = started.elapsed().as_millis() as u64;

    let converted = Instant::now();
    let wire = backends.codec.wav_to_wire(&wav)?;
    let frames = frame_audio(&wire, config.voice.frame_bytes).len();

    tracing::info!(
        tts_bytes = wav.len(),
        wire_bytes = wire.len(),
        frames,
        "Debug: synthesized reply"
    );
    Ok(HttpResponse::Ok().json(SynthesizeResponse {
        tts_bytes: wav.len(),
        wire_bytes: wire.len(),
        frames,
        duration_ms: frames as u64 * config.voice.frame_duration_ms,
        synthesis_ms,
        conversion_ms: converted.elapsed().as_millis() as u64,
    }))
}

/// Configuration for debug routes
pub fn configure_debug_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/debug")
            .route("/dispatch", web::post().to(debug_dispatch))
            .route("/synthesize", web::post().to(debug_synthesize)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::CodecAdapter;
    use crate::config::AppConfig;
    use crate::dialogue::{DialogueBackend, DialogueRequest};
    use crate::state::Backends;
    use crate::transcription::{BatchStt, SpeechBackend};
    use crate::tts::TtsBackend;
    use actix_web::{http::StatusCode, App};
    use actix_web::test as actix_test;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl DialogueBackend for Echo {
        async fn converse(&self, request: &DialogueRequest) -> Result<Value, GatewayError> {
            match request.transcript.as_str() {
                "kaputt" => Err(GatewayError::failure(Backend::Dialogue, "HTTP 500")),
                "template" => Ok(json!({"response": "{{ $json.output }}"})),
                text => Ok(json!([{"output": format!("Du sagtest: {}", text)}])),
            }
        }
    }

    struct Silent;

    #[async_trait]
    impl BatchStt for Silent {
        async fn transcribe(&self, _wav: Vec<u8>) -> Result<String, GatewayError> {
            Ok(String::new())
        }
    }

    struct FixedTts;

    #[async_trait]
    impl TtsBackend for FixedTts {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, GatewayError> {
            Ok(vec![0; 400])
        }
    }

    struct Passthrough;

    impl CodecAdapter for Passthrough {
        fn wire_to_wav(&self, wire: &[u8]) -> Result<Vec<u8>, GatewayError> {
            Ok(wire.to_vec())
        }
        fn wire_to_pcm(&self, wire: &[u8]) -> Vec<u8> {
            wire.to_vec()
        }
        fn wav_to_wire(&self, wav: &[u8]) -> Result<Vec<u8>, GatewayError> {
            Ok(wav.to_vec())
        }
    }

    fn app_state() -> AppState {
        AppState::with_backends(
            AppConfig::default(),
            Backends {
                speech: SpeechBackend::Batch(Arc::new(Silent)),
                dialogue: Arc::new(Echo),
                tts: Arc::new(FixedTts),
                codec: Arc::new(Passthrough),
            },
        )
    }

    async fn post(uri: &str, body: Value) -> (StatusCode, Value) {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .configure(configure_debug_routes),
        )
        .await;
        let req = actix_test::TestRequest::post().uri(uri).set_json(body).to_request();
        let resp = actix_test::call_service(&app, req).await;
        let status = resp.status();
        let body: Value = actix_test::read_body_json(resp).await;
        (status, body)
    }

    #[actix_web::test]
    async fn test_dispatch_returns_extracted_reply() {
        let (status, body) =
            post("/debug/dispatch", json!({"transcript": "hallo", "session_id": "CA1"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "Du sagtest: hallo");
        assert_eq!(body["session_id"], "CA1");
    }

    #[actix_web::test]
    async fn test_dispatch_surfaces_backend_errors() {
        let (status, body) = post("/debug/dispatch", json!({"transcript": "kaputt"})).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "backend_error");

        let (status, body) = post("/debug/dispatch", json!({"transcript": "template"})).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["type"], "backend_misconfigured");

        let (status, _) = post("/debug/dispatch", json!({"transcript": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_synthesize_reports_frames() {
        let (status, body) = post("/debug/synthesize", json!({"text": "Hallo"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wire_bytes"], 400);
        assert_eq!(body["frames"], 3);
        assert_eq!(body["duration_ms"], 60);
    }
}
