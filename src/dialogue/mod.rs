//! # Dialogue Module
//!
//! Turns a final transcript into the text the caller should hear.
//!
//! - `webhook.rs`: the HTTP client for the external dialogue workflow
//! - `dispatcher.rs`: timeout, reply extraction and template-marker checks

pub mod dispatcher;
pub mod webhook;

pub use dispatcher::{extract_reply, CallMetadata, TranscriptDispatcher};
pub use webhook::{DialogueBackend, DialogueRequest, WebhookDialogue};
