//! # WebSocket Audio Streaming Handler
//!
//! Handles real-time audio streaming via WebSocket. Clients connect to `/ws/audio`,
//! start a stream with processing parameters, send audio chunks and receive the
//! processed audio back on the same socket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server answers with a `ready` envelope carrying the session id
//! 2. **Start**: client sends `control-start` with `{volume, pitch, speed}`
//! 3. **Audio Streaming**: `audio` envelopes (JSON text) or 16-bit PCM binary frames
//! 4. **Results**: one `audio-response` (or `error`) per processed chunk
//! 5. **Stop**: `control-stop`, acknowledged with `audio-response {status: "stop"}`
//! 6. **Text**: echoed, then answered with synthesized speech bracketed by
//!    `processing` and `finished` statuses
//!
//! Inbound frames may be up to `streaming.max_frame_bytes`; larger frames are a
//! socket-level protocol error.
//!
//! ## Actor Model:
//! Each connection is one actor. Frames are handled in arrival order by the actor's
//! mailbox, the [`Session`] decides what to do, and this actor carries out the
//! resulting effects: writing replies through the [`Transport`], spawning model
//! calls as actor-owned futures, and cancelling them when a job ends.

use crate::audio::codec;
use crate::audio::AudioModel;
use crate::config::StreamingConfig;
use crate::error::StreamError;
use crate::observe::{StreamEvent, StreamObserver, TracingObserver};
use crate::pipeline::{self, Invocation, Synthesis};
use crate::protocol::{Envelope, Message};
use crate::session::{Effect, Session, SessionSettings};
use crate::state::AppState;
use crate::transport::{FrameSink, Transport};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl FrameSink for ws::WebsocketContext<AudioStreamSocket> {
    fn send_text(&mut self, frame: String) {
        self.text(frame);
    }
}

/// WebSocket actor for one audio streaming connection.
pub struct AudioStreamSocket {
    /// Protocol state and the active job
    session: Session,

    /// Outbound buffering and link state
    transport: Transport,

    /// Model shared by all connections
    model: Arc<dyn AudioModel>,

    observer: Arc<dyn StreamObserver>,

    /// Streaming settings (timeouts, intervals)
    config: StreamingConfig,

    /// Running model calls, keyed by job or synthesis request id
    in_flight: HashMap<String, SpawnHandle>,

    /// Last time the client showed any sign of life
    last_heartbeat: Instant,
}

impl AudioStreamSocket {
    /// Create a new WebSocket actor.
    pub fn new(
        config: StreamingConfig,
        model: Arc<dyn AudioModel>,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let session = Session::new(SessionSettings::from(&config), observer.clone());
        let transport = Transport::new(
            session.id(),
            config.outbound_capacity,
            config.send_window,
            observer.clone(),
        );

        Self {
            session,
            transport,
            model,
            observer,
            config,
            in_flight: HashMap::new(),
            last_heartbeat: Instant::now(),
        }
    }

    /// Carry out what the session asked for, in order.
    fn apply(&mut self, effects: Vec<Effect>, ctx: &mut ws::WebsocketContext<Self>) {
        for effect in effects {
            match effect {
                Effect::Reply(envelope) => {
                    self.transport.send(&envelope, ctx);
                }
                Effect::Invoke(invocation) => self.invoke(invocation, ctx),
                Effect::Synthesize(synthesis) => self.synthesize(synthesis, ctx),
                Effect::Cancel { job_id } => self.cancel(&job_id, ctx),
            }
        }
    }

    /// Run a model call as a future owned by this actor.
    ///
    /// The future is dropped with the actor, so a closed connection never keeps a
    /// model call alive.
    fn invoke(&mut self, invocation: Invocation, ctx: &mut ws::WebsocketContext<Self>) {
        let job_id = invocation.job_id.clone();
        let call = pipeline::run_invocation(
            self.model.clone(),
            invocation,
            self.config.model_timeout(),
        );

        let handle = ctx.spawn(call.into_actor(self).map(|result, act, ctx| {
            act.in_flight.remove(&result.job_id);
            let effects = act.session.on_invocation_complete(result);
            act.apply(effects, ctx);
        }));

        self.in_flight.insert(job_id, handle);
    }

    fn synthesize(&mut self, synthesis: Synthesis, ctx: &mut ws::WebsocketContext<Self>) {
        let request_id = synthesis.request_id.clone();
        let call = pipeline::run_synthesis(
            self.model.clone(),
            synthesis,
            self.config.model_timeout(),
        );

        let handle = ctx.spawn(call.into_actor(self).map(|result, act, ctx| {
            act.in_flight.remove(&result.request_id);
            let effects = act.session.on_synthesis_complete(result);
            act.apply(effects, ctx);
        }));

        self.in_flight.insert(request_id, handle);
    }

    fn cancel(&mut self, job_id: &str, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(handle) = self.in_flight.remove(job_id) {
            debug!(session_id = %self.session.id(), job_id, "Cancelling model call");
            ctx.cancel_future(handle);
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let effects = match Envelope::decode(text.as_bytes()) {
            Ok(envelope) => self.session.dispatch(envelope),
            Err(err) => self.session.reject(err),
        };
        self.apply(effects, ctx);
    }

    /// Binary frames are 16-bit PCM and count as an `audio` envelope.
    fn handle_binary(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let effects = match codec::decode_pcm16(data) {
            Ok(sample) => {
                let envelope = Envelope::new(Message::Audio(sample), self.session.id());
                self.session.dispatch(envelope)
            }
            Err(err) => self.session.reject(err),
        };
        self.apply(effects, ctx);
    }
}

/// Implement Actor trait for WebSocket handling.
impl Actor for AudioStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        self.observer
            .record(self.session.id(), StreamEvent::ConnectionOpened);

        let greeting = self.session.greeting();
        self.transport.send(&greeting, ctx);

        // Start heartbeat timer
        let timeout = self.config.client_timeout();
        ctx.run_interval(self.config.heartbeat_interval(), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(session_id = %act.session.id(), "WebSocket heartbeat timeout, closing connection");
                act.transport.begin_close();
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        // Open a new send window every tick
        ctx.run_interval(self.config.flush_interval(), |act, ctx| {
            act.transport.refill(ctx);
        });
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, ctx: &mut Self::Context) {
        self.transport.closed();
        let effects = self.session.close();
        self.apply(effects, ctx);

        self.observer
            .record(self.session.id(), StreamEvent::ConnectionClosed);
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.handle_binary(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.id(), ?reason, "WebSocket closed by client");
                self.transport.begin_close();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Continuation frames are not used in our protocol
                warn!(session_id = %self.session.id(), "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                let err = StreamError::Transport(err.to_string());
                error!(session_id = %self.session.id(), error = %err, "WebSocket protocol error");
                self.transport.begin_close();
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// This function handles the initial HTTP request and upgrades it to a WebSocket connection.
/// The actual WebSocket communication is handled by the AudioStreamSocket actor.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);
    info!(peer = ?peer, "New WebSocket connection request");

    let observer: Arc<dyn StreamObserver> =
        Arc::new(TracingObserver::new(app_state.metrics.clone()));
    let streaming = app_state.config.streaming.clone();
    let frame_size = streaming.max_frame_bytes;
    let socket = AudioStreamSocket::new(streaming, app_state.model.clone(), observer);

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(frame_size)
        .start()
}
