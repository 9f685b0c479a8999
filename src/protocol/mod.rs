//! # Wire Protocol
//!
//! JSON envelopes exchanged over the WebSocket, shared by the server actor and
//! the streaming client.

pub mod envelope;

pub use envelope::{
    AudioResponse, ConversationMessage, Envelope, ErrorPayload, Heartbeat, Message,
    MessageKind, ReadyPayload, StatusKind, StreamStatus,
};
