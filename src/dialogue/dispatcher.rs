//! # Transcript Dispatcher
//!
//! Sends a final transcript to the dialogue backend and works out what, if
//! anything, should be spoken back.
//!
//! ## Reply extraction:
//! The workflow behind the webhook answers in whatever shape its last node
//! produced. The reply is located with one fixed algorithm:
//!
//! 1. If the body is an array, look at its first element only.
//! 2. Probe `response`, then `text`, then `output`; fall back to the value itself.
//! 3. If that yields an object, probe the same three keys one level deeper.
//! 4. Strings are the reply; numbers and booleans are stringified;
//!    `null` means no reply; anything else is malformed.
//!
//! A body that still carries `{{` or `}}` anywhere in its text means the
//! workflow never evaluated its template. That is rejected as a
//! misconfiguration and never spoken.

use super::webhook::{excerpt, DialogueBackend, DialogueRequest};
use crate::error::{Backend, GatewayError};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Keys probed for the reply, highest precedence first.
const REPLY_KEYS: [&str; 3] = ["response", "text", "output"];

/// Per-call metadata sent alongside every transcript.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallMetadata {
    pub session_id: String,
    pub caller_number: Option<String>,
}

/// Turns transcripts into dialogue replies for one or more calls.
pub struct TranscriptDispatcher {
    backend: Arc<dyn DialogueBackend>,
    timeout: Duration,
}

impl TranscriptDispatcher {
    pub fn new(backend: Arc<dyn DialogueBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Ask the dialogue backend for a reply to `transcript`.
    ///
    /// `Ok(None)` means the turn ends silently: the transcript was blank or
    /// the backend had nothing to say.
    pub async fn dispatch(
        &self,
        transcript: &str,
        metadata: &CallMetadata,
    ) -> Result<Option<String>, GatewayError> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            debug!("Skipping dispatch of blank transcript");
            return Ok(None);
        }

        let request = DialogueRequest {
            transcript: transcript.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id: metadata.session_id.clone(),
            caller_number: metadata.caller_number.clone(),
        };

        let started = Instant::now();
        let body = tokio::time::timeout(self.timeout, self.backend.converse(&request))
            .await
            .map_err(|_| GatewayError::BackendTimeout {
                backend: Backend::Dialogue,
                after: self.timeout,
            })??;
        info!(
            latency_ms = started.elapsed().as_millis() as u64,
            "Dialogue backend answered"
        );

        let reply = extract_reply(&body)?;
        match &reply {
            Some(text) => debug!("Dialogue reply: {}", excerpt(text, 120)),
            None => info!("Dialogue backend returned no reply"),
        }
        Ok(reply)
    }
}

/// Locate and validate the reply text in a dialogue response body.
pub fn extract_reply(body: &Value) -> Result<Option<String>, GatewayError> {
    if let Some(marked) = find_template_marker(body) {
        return Err(GatewayError::TemplateMarker {
            excerpt: excerpt(marked, 80),
        });
    }

    let top = match body {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    };
    let mut extracted = probe(top);
    if extracted.is_object() {
        extracted = probe(extracted);
    }

    let text = match extracted {
        Value::Null => return Ok(None),
        Value::String(text) => text.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            return Err(GatewayError::malformed(
                Backend::Dialogue,
                format!("no reply field among keys {:?}", keys),
            ));
        }
        Value::Array(_) => {
            return Err(GatewayError::malformed(
                Backend::Dialogue,
                "reply is a nested array",
            ))
        }
    };

    if contains_marker(&text) {
        return Err(GatewayError::TemplateMarker {
            excerpt: excerpt(&text, 80),
        });
    }

    let text = text.trim();
    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text.to_string()))
    }
}

/// First key in [`REPLY_KEYS`] holding a usable value, or `value` itself.
///
/// Blank strings and nulls fall through to the next key. If only blank
/// strings are found, the first of them is returned so the turn ends
/// without a reply.
fn probe(value: &Value) -> &Value {
    if let Value::Object(map) = value {
        let mut blank = None;
        for key in REPLY_KEYS {
            match map.get(key) {
                None | Some(Value::Null) => continue,
                Some(Value::String(s)) if s.trim().is_empty() => blank = blank.or(Some(key)),
                Some(found) => return found,
            }
        }
        if let Some(found) = blank.and_then(|key| map.get(key)) {
            return found;
        }
    }
    value
}

fn contains_marker(text: &str) -> bool {
    text.contains("{{") || text.contains("}}")
}

/// First string or object key anywhere in `body` that carries a template
/// marker.
fn find_template_marker(body: &Value) -> Option<&str> {
    match body {
        Value::String(s) if contains_marker(s) => Some(s),
        Value::Array(items) => items.iter().find_map(find_template_marker),
        Value::Object(map) => map.iter().find_map(|(key, value)| {
            if contains_marker(key) {
                Some(key.as_str())
            } else {
                find_template_marker(value)
            }
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_extract_bare_string() {
        assert_eq!(extract_reply(&json!(" Hallo! ")).unwrap(), Some("Hallo!".to_string()));
    }

    #[test]
    fn test_extract_key_precedence() {
        let body = json!({"output": "third", "text": "second", "response": "first"});
        assert_eq!(extract_reply(&body).unwrap(), Some("first".to_string()));

        let body = json!({"output": "third", "text": "second"});
        assert_eq!(extract_reply(&body).unwrap(), Some("second".to_string()));

        let body = json!({"output": "third"});
        assert_eq!(extract_reply(&body).unwrap(), Some("third".to_string()));
    }

    #[test]
    fn test_blank_key_falls_through() {
        let body = json!({"response": "", "text": "fallback"});
        assert_eq!(extract_reply(&body).unwrap(), Some("fallback".to_string()));
    }

    #[test]
    fn test_extract_first_array_element() {
        let body = json!([{"output": "one"}, {"output": "two"}]);
        assert_eq!(extract_reply(&body).unwrap(), Some("one".to_string()));
    }

    #[test]
    fn test_extract_one_level_deeper() {
        let body = json!({"response": {"text": "nested"}});
        assert_eq!(extract_reply(&body).unwrap(), Some("nested".to_string()));

        let body = json!([{"output": {"response": "deep"}}]);
        assert_eq!(extract_reply(&body).unwrap(), Some("deep".to_string()));
    }

    #[test]
    fn test_object_without_reply_is_malformed() {
        let err = extract_reply(&json!({"status": "ok"})).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedBackendResponse { .. }));

        let err = extract_reply(&json!({"response": {"a": {"text": "too deep"}}})).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedBackendResponse { .. }));

        assert!(extract_reply(&json!({"response": null})).unwrap_err().is_misconfiguration());
    }

    #[test]
    fn test_blank_and_null_mean_no_reply() {
        assert_eq!(extract_reply(&json!("   ")).unwrap(), None);
        assert_eq!(extract_reply(&json!(null)).unwrap(), None);
        assert_eq!(extract_reply(&json!([])).unwrap(), None);
    }

    #[test]
    fn test_blank_reply_fields_mean_no_reply() {
        assert_eq!(extract_reply(&json!({"response": ""})).unwrap(), None);
        assert_eq!(extract_reply(&json!({"text": "  "})).unwrap(), None);
        assert_eq!(extract_reply(&json!([{"output": ""}])).unwrap(), None);
        assert_eq!(
            extract_reply(&json!({"response": "", "text": " ", "output": null})).unwrap(),
            None
        );
        assert_eq!(extract_reply(&json!({"response": {"text": ""}})).unwrap(), None);
    }

    #[test]
    fn test_scalars_are_stringified() {
        assert_eq!(extract_reply(&json!({"response": 42})).unwrap(), Some("42".to_string()));
        assert_eq!(extract_reply(&json!(true)).unwrap(), Some("true".to_string()));
    }

    #[test]
    fn test_template_marker_is_never_spoken() {
        let err = extract_reply(&json!({"response": "Hallo {{ $json.name }}"})).unwrap_err();
        assert!(matches!(err, GatewayError::TemplateMarker { .. }));

        // Marker outside the extracted field still poisons the body
        let err = extract_reply(&json!({"response": "ok", "debug": "{{ $node }}"})).unwrap_err();
        assert!(matches!(err, GatewayError::TemplateMarker { .. }));

        let err = extract_reply(&json!("{{ $json.output }}")).unwrap_err();
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn test_template_marker_in_key_is_never_spoken() {
        let err = extract_reply(&json!({"{{ $json.key }}": 1, "response": "hi"})).unwrap_err();
        assert!(matches!(err, GatewayError::TemplateMarker { .. }));

        let body = json!([{"output": "hi", "meta": {"}} trailing": true}}]);
        assert!(extract_reply(&body).unwrap_err().is_misconfiguration());
    }

    #[test]
    fn test_json_structure_braces_are_not_markers() {
        let body = json!({"response": {"text": {"inner": "x"}}});
        let err = extract_reply(&body).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedBackendResponse { .. }));
    }

    struct ScriptedDialogue {
        reply: Value,
        delay: Duration,
        seen: Mutex<Vec<DialogueRequest>>,
    }

    #[async_trait]
    impl DialogueBackend for ScriptedDialogue {
        async fn converse(&self, request: &DialogueRequest) -> Result<Value, GatewayError> {
            self.seen.lock().push(request.clone());
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    fn scripted(reply: Value, delay: Duration) -> Arc<ScriptedDialogue> {
        Arc::new(ScriptedDialogue {
            reply,
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn metadata() -> CallMetadata {
        CallMetadata {
            session_id: "CA123".to_string(),
            caller_number: Some("+4930123".to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_sends_metadata_and_extracts_reply() {
        let backend = scripted(json!({"response": "hello"}), Duration::from_millis(300));
        let dispatcher = TranscriptDispatcher::new(backend.clone(), Duration::from_secs(7));

        let reply = dispatcher.dispatch("  wie geht's  ", &metadata()).await.unwrap();
        assert_eq!(reply, Some("hello".to_string()));

        let seen = backend.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].transcript, "wie geht's");
        assert_eq!(seen[0].session_id, "CA123");
        assert_eq!(seen[0].caller_number.as_deref(), Some("+4930123"));
        assert!(chrono::DateTime::parse_from_rfc3339(&seen[0].timestamp).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let backend = scripted(json!("too late"), Duration::from_secs(30));
        let dispatcher = TranscriptDispatcher::new(backend, Duration::from_secs(7));

        let err = dispatcher.dispatch("hallo", &metadata()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::BackendTimeout {
                backend: Backend::Dialogue,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_transcript_is_not_sent() {
        let backend = scripted(json!("unused"), Duration::ZERO);
        let dispatcher = TranscriptDispatcher::new(backend.clone(), Duration::from_secs(7));

        assert_eq!(dispatcher.dispatch(" \n ", &metadata()).await.unwrap(), None);
        assert!(backend.seen.lock().is_empty());
    }
}
