//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`GatewayError`]: everything that can go wrong during one conversational
//!   turn of a call (backend timeouts, unusable replies, a vanished transport).
//!   These never escape the call session; they are logged and the turn is dropped.
//! - [`AppError`]: errors returned by the HTTP API, converted into JSON responses.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Server port cannot be 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The external services a call talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Stt,
    Dialogue,
    Tts,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Stt => "stt",
            Backend::Dialogue => "dialogue",
            Backend::Tts => "tts",
        };
        f.write_str(name)
    }
}

/// Turn-level failures of a call session.
///
/// Only transport teardown ends a session; every variant here abandons the
/// current turn at most.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The media-stream connection is gone.
    #[error("transport connection is closed")]
    TransportClosed,

    #[error("{backend} backend timed out after {}ms", after.as_millis())]
    BackendTimeout { backend: Backend, after: Duration },

    /// Non-2xx status, connection refused, unreadable body.
    #[error("{backend} backend failed: {reason}")]
    BackendFailure { backend: Backend, reason: String },

    /// The backend answered with a shape we cannot use.
    #[error("{backend} backend returned a malformed response: {reason}")]
    MalformedBackendResponse { backend: Backend, reason: String },

    /// The dialogue reply still contains `{{ ... }}` placeholders.
    #[error("dialogue backend returned an unevaluated template: {excerpt}")]
    TemplateMarker { excerpt: String },

    /// Unparseable or unknown inbound transport message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An outbound frame was about to leave without a stream id.
    #[error("no stream id known for outbound audio")]
    MissingRoutingToken,

    #[error("audio conversion failed: {0}")]
    Codec(String),
}

impl GatewayError {
    pub fn failure(backend: Backend, reason: impl fmt::Display) -> Self {
        GatewayError::BackendFailure {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn malformed(backend: Backend, reason: impl fmt::Display) -> Self {
        GatewayError::MalformedBackendResponse {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Map a reqwest error from `backend` onto the taxonomy.
    pub fn from_reqwest(backend: Backend, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::BackendTimeout {
                backend,
                after: timeout,
            }
        } else if err.is_decode() {
            GatewayError::malformed(backend, err)
        } else {
            GatewayError::failure(backend, err)
        }
    }

    /// Misconfigured backends are reported apart from network trouble.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            GatewayError::TemplateMarker { .. } | GatewayError::MalformedBackendResponse { .. }
        )
    }
}

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// No room for another call.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A backend failed while serving a debug request.
    #[error("Upstream error: {0}")]
    Upstream(#[from] GatewayError),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(GatewayError::BackendTimeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg.clone()),
            AppError::BadRequest(msg) => ("bad_request", msg.clone()),
            AppError::ConfigError(msg) => ("config_error", msg.clone()),
            AppError::ValidationError(msg) => ("validation_error", msg.clone()),
            AppError::ServiceUnavailable(msg) => ("capacity_exceeded", msg.clone()),
            AppError::Upstream(err) if err.is_misconfiguration() => {
                ("backend_misconfigured", err.to_string())
            }
            AppError::Upstream(err) => ("backend_error", err.to_string()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, hence 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}
