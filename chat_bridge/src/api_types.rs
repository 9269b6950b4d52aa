//! # API-Facing Data Contracts
//!
//! Rust representations of the public dispatch request/response pair.
//! These are the shapes an HTTP layer (out of scope here) would serialize;
//! the service consumes and produces them directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Bounds violated by a request before the engine ever runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("content must not be empty")]
    EmptyContent,

    #[error("content exceeds {max} characters (got {len})")]
    ContentTooLong { len: usize, max: usize },
}

/// One user utterance plus optional request-scoped hints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    /// Free-text user input, 1..=255 characters.
    pub content: String,
    /// Optional IANA timezone the caller wants answers evaluated in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl DispatchRequest {
    pub fn new(content: impl Into<String>) -> Self {
        DispatchRequest {
            content: content.into(),
            timezone: None,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Validates the content bounds. Character count, not bytes, so
    /// multi-byte input is not penalised.
    pub fn validate(&self, max_chars: usize) -> Result<(), RequestError> {
        let len = self.content.chars().count();
        if self.content.trim().is_empty() {
            return Err(RequestError::EmptyContent);
        }
        if len > max_chars {
            return Err(RequestError::ContentTooLong { len, max: max_chars });
        }
        Ok(())
    }
}

/// The reply: the echoed question, the answer text, and an optional opaque
/// payload forwarded verbatim from a callback (a map marker, for
/// instance).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchResponse {
    pub question: String,
    pub answer: String,
    pub payload: Option<Value>,
}
