//! # Audio Stream Backend
//!
//! Real-time audio streaming over WebSocket: clients open a session, start a
//! stream with processing parameters, push audio chunks and get processed audio
//! back on the same connection.
//!
//! ## Module Layout:
//! - **audio**: sample representations, the codec and the model collaborator
//! - **protocol**: JSON envelopes exchanged on the socket
//! - **session**: per-connection protocol state machine
//! - **pipeline**: per-job chunk queue and model invocation
//! - **transport**: outbound buffering and backpressure
//! - **websocket**: the actix actor that ties a socket to a session
//! - **client**: `tokio-tungstenite` client for the same protocol
//! - **config / state / health / observe / error**: the service around it

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod observe;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod websocket;

use actix_web::web;

/// Register the HTTP and WebSocket routes.
///
/// Shared by `main` and the integration tests so both serve the same app.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/audio", web::get().to(websocket::audio_websocket))
        .route("/health", web::get().to(health::health_check));
}
