//! # Message Envelope
//!
//! Every frame on the socket, control or data, is one JSON envelope:
//!
//! ```json
//! { "type": "audio", "payload": { "sampleRate": 16000, "samples": [0.1] }, "correlationId": "..." }
//! ```
//!
//! ## Parsing Rules:
//! - Field-tagged, never positional: the top level must be a JSON object
//! - Unrecognised fields are ignored so newer peers can add data
//! - A malformed structure, or a recognised `type` with a payload of the wrong
//!   shape, is a `ParseError`
//! - An unrecognised `type` is NOT an error: it decodes to
//!   [`Message::Unknown`] (`control-unknown`), which the dispatcher logs and drops
//!
//! ## Rust Concepts:
//! - **Tagged enum**: the payload shape is fixed by the variant, so an envelope with
//!   the wrong payload for its type cannot be constructed
//! - **#[serde(untagged)]**: `audio-response` carries either a chunk or a status

use crate::audio::{AudioSample, ProcessingParams};
use crate::error::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Envelope type names as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Audio,
    AudioResponse,
    ControlStart,
    ControlStop,
    Text,
    Error,
    Ready,
    Ping,
    Pong,
    /// Internal marker for a well-formed envelope with an unrecognised type
    ControlUnknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Audio => "audio",
            MessageKind::AudioResponse => "audio-response",
            MessageKind::ControlStart => "control-start",
            MessageKind::ControlStop => "control-stop",
            MessageKind::Text => "text",
            MessageKind::Error => "error",
            MessageKind::Ready => "ready",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::ControlUnknown => "control-unknown",
        }
    }

    /// Map a wire name to a kind. `control-unknown` is never accepted from the wire.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "audio" => Some(MessageKind::Audio),
            "audio-response" => Some(MessageKind::AudioResponse),
            "control-start" => Some(MessageKind::ControlStart),
            "control-stop" => Some(MessageKind::ControlStop),
            "text" => Some(MessageKind::Text),
            "error" => Some(MessageKind::Error),
            "ready" => Some(MessageKind::Ready),
            "ping" => Some(MessageKind::Ping),
            "pong" => Some(MessageKind::Pong),
            _ => None,
        }
    }
}

/// Payload of an `audio-response`: a processed chunk or a stream status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioResponse {
    Chunk(AudioSample),
    Status(StreamStatus),
}

/// Status notification sent in place of audio.
///
/// `stop` acknowledges `control-stop`; `processing` and `finished` bracket the
/// audio streamed back for a `text` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub status: StatusKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Stop,
    Processing,
    Finished,
}

/// Payload of an `error` envelope.
///
/// `reason` is human-readable and never contains internal stack detail;
/// `operation` names what failed so the client can act on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub reason: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl From<&StreamError> for ErrorPayload {
    fn from(err: &StreamError) -> Self {
        Self {
            reason: err.to_string(),
            operation: err.operation().to_string(),
            job_id: err.job_id().map(str::to_string),
        }
    }
}

/// One conversational text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub text: String,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: u64,
}

/// Sent by the server as soon as a connection opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub session_id: String,
}

/// Application-level ping/pong payload; the timestamp is echoed unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub timestamp: f64,
}

/// Typed message carried by an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Audio(AudioSample),
    AudioResponse(AudioResponse),
    ControlStart(ProcessingParams),
    ControlStop,
    Text(ConversationMessage),
    Error(ErrorPayload),
    Ready(ReadyPayload),
    Ping(Heartbeat),
    Pong(Heartbeat),
    /// Well-formed envelope whose type this build does not know
    Unknown { kind: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Audio(_) => MessageKind::Audio,
            Message::AudioResponse(_) => MessageKind::AudioResponse,
            Message::ControlStart(_) => MessageKind::ControlStart,
            Message::ControlStop => MessageKind::ControlStop,
            Message::Text(_) => MessageKind::Text,
            Message::Error(_) => MessageKind::Error,
            Message::Ready(_) => MessageKind::Ready,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Unknown { .. } => MessageKind::ControlUnknown,
        }
    }
}

/// A typed message plus the session/user identifier it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub correlation_id: String,
}

/// Field-tagged wire shape used for decoding.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "correlationId")]
    correlation_id: String,
}

impl Envelope {
    /// Wrap a message for sending.
    pub fn new(message: Message, correlation_id: impl Into<String>) -> Self {
        Self {
            message,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// `error` envelope for a recoverable failure.
    pub fn error(err: &StreamError, correlation_id: impl Into<String>) -> Self {
        Self::new(Message::Error(ErrorPayload::from(err)), correlation_id)
    }

    /// `audio-response` carrying a processed chunk.
    pub fn audio_chunk(sample: AudioSample, correlation_id: impl Into<String>) -> Self {
        Self::new(
            Message::AudioResponse(AudioResponse::Chunk(sample)),
            correlation_id,
        )
    }

    /// `audio-response` carrying a status instead of audio.
    pub fn status(
        status: StatusKind,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::new(
            Message::AudioResponse(AudioResponse::Status(StreamStatus {
                status,
                message: message.into(),
            })),
            correlation_id,
        )
    }

    /// `audio-response` acknowledging `control-stop`.
    pub fn stop_ack(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::status(StatusKind::Stop, message, correlation_id)
    }

    /// Serialize to the JSON text frame sent over the socket.
    pub fn encode(&self) -> StreamResult<String> {
        let payload = match &self.message {
            Message::Audio(sample) => serde_json::to_value(sample)?,
            Message::AudioResponse(response) => serde_json::to_value(response)?,
            Message::ControlStart(params) => serde_json::to_value(params)?,
            Message::ControlStop => json!({}),
            Message::Text(text) => serde_json::to_value(text)?,
            Message::Error(error) => serde_json::to_value(error)?,
            Message::Ready(ready) => serde_json::to_value(ready)?,
            Message::Ping(beat) | Message::Pong(beat) => serde_json::to_value(beat)?,
            Message::Unknown { .. } => Value::Null,
        };

        let kind = match &self.message {
            Message::Unknown { kind } => kind.as_str(),
            other => other.kind().as_str(),
        };

        let wire = json!({
            "type": kind,
            "payload": payload,
            "correlationId": self.correlation_id,
        });
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse raw frame bytes. Fails closed on malformed structure.
    pub fn decode(raw: &[u8]) -> StreamResult<Envelope> {
        let value: Value = serde_json::from_slice(raw)?;
        if !value.is_object() {
            return Err(StreamError::Parse(
                "envelope must be a JSON object".to_string(),
            ));
        }

        let raw: RawEnvelope = serde_json::from_value(value)?;
        let kind = match MessageKind::from_wire(&raw.kind) {
            Some(kind) => kind,
            None => {
                return Ok(Envelope::new(
                    Message::Unknown { kind: raw.kind },
                    raw.correlation_id,
                ))
            }
        };

        let message = match kind {
            MessageKind::Audio => Message::Audio(payload_as(kind, raw.payload)?),
            MessageKind::AudioResponse => Message::AudioResponse(payload_as(kind, raw.payload)?),
            MessageKind::ControlStart => Message::ControlStart(payload_as(kind, raw.payload)?),
            MessageKind::ControlStop => Message::ControlStop,
            MessageKind::Text => Message::Text(payload_as(kind, raw.payload)?),
            MessageKind::Error => Message::Error(payload_as(kind, raw.payload)?),
            MessageKind::Ready => Message::Ready(payload_as(kind, raw.payload)?),
            MessageKind::Ping => Message::Ping(heartbeat_payload(raw.payload)?),
            MessageKind::Pong => Message::Pong(heartbeat_payload(raw.payload)?),
            MessageKind::ControlUnknown => Message::Unknown { kind: raw.kind },
        };

        Ok(Envelope::new(message, raw.correlation_id))
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(kind: MessageKind, payload: Value) -> StreamResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| StreamError::Parse(format!("invalid {} payload: {}", kind.as_str(), e)))
}

/// Ping/pong may omit the payload entirely.
fn heartbeat_payload(payload: Value) -> StreamResult<Heartbeat> {
    if payload.is_null() {
        return Ok(Heartbeat { timestamp: 0.0 });
    }
    payload_as(MessageKind::Ping, payload)
}
