//! # Streaming Client
//!
//! Client side of the audio streaming protocol, built on `tokio-tungstenite`.
//!
//! ## Typical Flow:
//! ```rust,ignore
//! let mut client = StreamingClient::connect("ws://127.0.0.1:8080/ws/audio", ReconnectPolicy::default()).await?;
//! client.start(ProcessingParams::new(0.8, 0.0, 1.0)).await?;
//! client.push(&captured).await?;
//! while let Some(event) = client.next_event().await? {
//!     if let ClientEvent::Audio(buffer) = event {
//!         recorder.play(&buffer)?;
//!     }
//! }
//! ```
//!
//! ## Send Guard:
//! Sending while the socket is not open is a logged no-op, never an error or a
//! panic. Capture callbacks keep firing while a connection is being re-established,
//! and those chunks are simply dropped.

pub mod playback;
pub mod reconnect;

pub use playback::{PlaybackSink, WavRecorder};
pub use reconnect::ReconnectPolicy;

use crate::audio::codec;
use crate::audio::{NativeBuffer, ProcessingParams};
use crate::error::{StreamError, StreamResult};
use crate::protocol::{
    AudioResponse, ConversationMessage, Envelope, ErrorPayload, Heartbeat, Message, StatusKind,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something the server told us.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection accepted; a new session exists on the server
    Ready { session_id: String },
    /// One processed chunk, decoded for playback
    Audio(NativeBuffer),
    /// The stream was stopped (acknowledges `control-stop`)
    Stopped { message: String },
    /// The server started answering a text message with speech
    Processing { message: String },
    /// All speech for the last text message has been sent
    Finished { message: String },
    /// Server-stamped echo of a conversation message
    Text(ConversationMessage),
    /// Recoverable failure reported by the server
    Error(ErrorPayload),
    /// Answer to an application-level ping
    Pong(Heartbeat),
}

/// WebSocket client for one streaming connection.
pub struct StreamingClient {
    url: String,
    policy: ReconnectPolicy,
    socket: Option<Socket>,
    /// Identifier sent with every envelope
    correlation_id: String,
    session_id: Option<String>,
}

impl StreamingClient {
    /// Connect, retrying according to `policy`.
    pub async fn connect(url: impl Into<String>, policy: ReconnectPolicy) -> StreamResult<Self> {
        let url = url.into();
        let socket = open_socket(&url, &policy).await?;
        Ok(Self {
            url,
            policy,
            socket: Some(socket),
            correlation_id: Uuid::new_v4().to_string(),
            session_id: None,
        })
    }

    /// Drop the current connection (if any) and open a new one.
    ///
    /// The new connection is a new session; any job on the old one is gone.
    pub async fn reconnect(&mut self) -> StreamResult<()> {
        if let Some(mut old) = self.socket.take() {
            let _ = old.close(None).await;
        }
        self.session_id = None;
        self.socket = Some(open_socket(&self.url, &self.policy).await?);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Session id announced by the server's `ready` envelope.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Begin a streaming job with the given parameters.
    pub async fn start(&mut self, params: ProcessingParams) -> StreamResult<()> {
        self.send(Message::ControlStart(params)).await
    }

    /// Encode a captured buffer and send it as an `audio` envelope.
    ///
    /// Only channel 0 is sent. Empty buffers are not sent at all.
    pub async fn push(&mut self, buffer: &NativeBuffer) -> StreamResult<()> {
        let sample = codec::encode(buffer);
        if sample.is_empty() {
            return Ok(());
        }
        self.send(Message::Audio(sample)).await
    }

    /// Like [`push`](Self::push), but as a compact 16-bit PCM binary frame.
    pub async fn push_pcm16(&mut self, buffer: &NativeBuffer) -> StreamResult<()> {
        let sample = codec::encode(buffer);
        if sample.is_empty() {
            return Ok(());
        }
        self.send_frame(WsMessage::Binary(codec::encode_pcm16(&sample)))
            .await
    }

    pub async fn stop(&mut self) -> StreamResult<()> {
        self.send(Message::ControlStop).await
    }

    /// Send a conversation message; the server answers with speech.
    pub async fn say(&mut self, text: impl Into<String>) -> StreamResult<()> {
        self.send(Message::Text(ConversationMessage {
            text: text.into(),
            timestamp: 0,
        }))
        .await
    }

    pub async fn ping(&mut self, timestamp: f64) -> StreamResult<()> {
        self.send(Message::Ping(Heartbeat { timestamp })).await
    }

    /// Wait for the next event from the server.
    ///
    /// Returns `Ok(None)` once the connection is closed. Envelopes that do not
    /// concern the client (unknown types, client→server types) are skipped.
    pub async fn next_event(&mut self) -> StreamResult<Option<ClientEvent>> {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(None);
            };

            let next = socket.next().await;
            let frame = match next {
                None => {
                    self.socket = None;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(e.into());
                }
                Some(Ok(frame)) => frame,
            };

            match frame {
                WsMessage::Text(text) => {
                    let envelope = Envelope::decode(text.as_bytes())?;
                    if let Some(event) = self.event_from(envelope)? {
                        return Ok(Some(event));
                    }
                }
                WsMessage::Close(frame) => {
                    info!(?frame, "Server closed the connection");
                    self.socket = None;
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself
                _ => {}
            }
        }
    }

    /// Send a close frame and drop the socket.
    pub async fn close(&mut self) -> StreamResult<()> {
        if let Some(mut socket) = self.socket.take() {
            socket.close(None).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> StreamResult<()> {
        let envelope = Envelope::new(message, self.correlation_id.clone());
        let text = envelope.encode()?;
        self.send_frame(WsMessage::Text(text)).await
    }

    async fn send_frame(&mut self, frame: WsMessage) -> StreamResult<()> {
        let Some(socket) = self.socket.as_mut() else {
            warn!("WebSocket is not open, frame not sent");
            return Ok(());
        };

        let sent = socket.send(frame).await;
        if let Err(e) = sent {
            self.socket = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn event_from(&mut self, envelope: Envelope) -> StreamResult<Option<ClientEvent>> {
        let event = match envelope.message {
            Message::Ready(ready) => {
                self.session_id = Some(ready.session_id.clone());
                ClientEvent::Ready {
                    session_id: ready.session_id,
                }
            }
            Message::AudioResponse(AudioResponse::Chunk(sample)) => {
                ClientEvent::Audio(codec::decode(&sample)?)
            }
            Message::AudioResponse(AudioResponse::Status(status)) => match status.status {
                StatusKind::Stop => ClientEvent::Stopped {
                    message: status.message,
                },
                StatusKind::Processing => ClientEvent::Processing {
                    message: status.message,
                },
                StatusKind::Finished => ClientEvent::Finished {
                    message: status.message,
                },
            },
            Message::Text(text) => ClientEvent::Text(text),
            Message::Error(error) => ClientEvent::Error(error),
            Message::Pong(beat) => ClientEvent::Pong(beat),
            other => {
                debug!(kind = other.kind().as_str(), "Ignoring envelope");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

async fn open_socket(url: &str, policy: &ReconnectPolicy) -> StreamResult<Socket> {
    let mut attempts = 0;
    loop {
        match connect_async(url).await {
            Ok((socket, _response)) => {
                info!(url, "Connected");
                return Ok(socket);
            }
            Err(e) => {
                attempts += 1;
                if !policy.should_retry(attempts) {
                    return Err(StreamError::Transport(format!(
                        "could not connect to {} after {} attempt(s): {}",
                        url, attempts, e
                    )));
                }
                let delay = policy.delay_for_attempt(attempts);
                warn!(url, attempts, delay_ms = delay.as_millis() as u64, error = %e, "Connect failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_gives_up_after_policy_attempts() {
        // Nothing listens on port 1.
        let policy = ReconnectPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            multiplier: 1.0,
        };
        let err = StreamingClient::connect("ws://127.0.0.1:1/ws/audio", policy)
            .await
            .err()
            .unwrap();

        assert!(err.is_fatal());
        assert!(err.to_string().contains("after 2 attempt(s)"));
    }
}
