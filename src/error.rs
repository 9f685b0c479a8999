//! # Error Handling
//!
//! Error taxonomy for the audio streaming protocol. Every failure that can happen
//! while a connection is alive maps to exactly one variant, and the variant decides
//! how far the failure is allowed to spread:
//!
//! | Variant             | Recovery granularity | Connection fatal? |
//! |---------------------|----------------------|-------------------|
//! | `Parse`             | frame                | no                |
//! | `Validation`        | envelope             | no                |
//! | `ProtocolViolation` | envelope             | no                |
//! | `Pipeline`          | chunk / job          | no                |
//! | `Synthesis`         | text request         | no                |
//! | `Codec`             | chunk                | no                |
//! | `Transport`         | connection           | yes               |
//!
//! ## Rust Concepts:
//! - **enum with data**: each variant carries the context needed for a client reply
//! - **Display trait**: human-readable text that is safe to send to clients
//! - **From trait**: lets `?` convert lower-level errors automatically

use std::fmt;

/// Errors produced by the streaming core.
///
/// ## Usage Example:
/// ```rust
/// use audio_stream_backend::error::StreamError;
///
/// let err = StreamError::protocol("audio", "no active stream, send control-start first");
/// assert!(!err.is_fatal());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    /// Malformed envelope bytes (bad JSON, missing `type`, payload of the wrong shape)
    Parse(String),

    /// Out-of-range values supplied by the client
    Validation {
        operation: &'static str,
        reason: String,
    },

    /// Envelope type is illegal in the current session state
    ProtocolViolation {
        operation: &'static str,
        reason: String,
    },

    /// The model invocation for a chunk failed or timed out
    Pipeline {
        job_id: String,
        reason: String,
    },

    /// Speech synthesis for a `text` message failed or timed out
    Synthesis {
        request_id: String,
        reason: String,
    },

    /// Audio could not be converted between representations
    Codec(String),

    /// Socket-level failure; the only connection-fatal kind
    Transport(String),
}

impl StreamError {
    /// Shorthand for a validation failure of `operation`.
    pub fn validation(operation: &'static str, reason: impl Into<String>) -> Self {
        StreamError::Validation {
            operation,
            reason: reason.into(),
        }
    }

    /// Shorthand for a protocol violation of `operation`.
    pub fn protocol(operation: &'static str, reason: impl Into<String>) -> Self {
        StreamError::ProtocolViolation {
            operation,
            reason: reason.into(),
        }
    }

    /// Name of the operation that failed, as reported to clients.
    pub fn operation(&self) -> &'static str {
        match self {
            StreamError::Parse(_) => "decode",
            StreamError::Validation { operation, .. } => operation,
            StreamError::ProtocolViolation { operation, .. } => operation,
            StreamError::Pipeline { .. } => "process-audio",
            StreamError::Synthesis { .. } => "synthesize",
            StreamError::Codec(_) => "codec",
            StreamError::Transport(_) => "transport",
        }
    }

    /// Machine-readable error kind used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::Parse(_) => "parse_error",
            StreamError::Validation { .. } => "validation_error",
            StreamError::ProtocolViolation { .. } => "protocol_violation",
            StreamError::Pipeline { .. } => "pipeline_error",
            StreamError::Synthesis { .. } => "synthesis_error",
            StreamError::Codec(_) => "codec_error",
            StreamError::Transport(_) => "transport_error",
        }
    }

    /// Job (or synthesis request) the failure is scoped to, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            StreamError::Pipeline { job_id, .. } => Some(job_id),
            StreamError::Synthesis { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Only transport failures terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Parse(msg) => write!(f, "Malformed envelope: {}", msg),
            StreamError::Validation { operation, reason } => {
                write!(f, "{} rejected: {}", operation, reason)
            }
            StreamError::ProtocolViolation { operation, reason } => {
                write!(f, "{} not allowed: {}", operation, reason)
            }
            StreamError::Pipeline { job_id, reason } => {
                write!(f, "Audio processing failed for job {}: {}", job_id, reason)
            }
            StreamError::Synthesis { reason, .. } => {
                write!(f, "Speech synthesis failed: {}", reason)
            }
            StreamError::Codec(msg) => write!(f, "Audio codec error: {}", msg),
            StreamError::Transport(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

/// JSON failures are always malformed input from the peer.
impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}

/// Type alias for Results that use the streaming error type.
pub type StreamResult<T> = Result<T, StreamError>;
