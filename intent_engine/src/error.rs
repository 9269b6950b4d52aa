// Error taxonomy for the dispatch engine.
//
// None of these surface to the end user as a request failure: the service
// layer always produces a reply. They exist so that skipped rules, dead
// sources and failing callbacks are logged with enough identity for
// operators to act on.

use thiserror::Error;

/// Engine-level error categories.
///
/// Recovery per category:
/// - `SourceUnavailable`: keep the last good compiled list, or an empty
///   list on a cold start.
/// - `MalformedEntry`: drop only the offending entry.
/// - `PatternCompile`: treat the rule as non-matching.
/// - `CallbackFailure`: substitute the generic fallback reply.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A rule source could not be read at all.
    #[error("rule source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// A single rule definition is unusable.
    #[error("malformed rule entry '{entry}' from source '{source_name}': {reason}")]
    MalformedEntry {
        source_name: String,
        entry: String,
        reason: String,
    },

    /// A regex failed to compile or execute.
    #[error("pattern for rule '{rule}' failed to compile: {reason}")]
    PatternCompile { rule: String, reason: String },

    /// A bound action returned an error.
    #[error("callback '{callback}' failed: {reason}")]
    CallbackFailure { callback: String, reason: String },
}

/// Error returned by a bound callback action.
///
/// Callbacks signal failure through this type; the dispatch boundary
/// converts it into the generic fallback reply, never into a request
/// failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CallbackError {
    pub message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        CallbackError {
            message: message.into(),
        }
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        CallbackError { message }
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        CallbackError {
            message: message.to_string(),
        }
    }
}
