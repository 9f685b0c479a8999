//! # Session State Machine
//!
//! One `Session` per WebSocket connection. The session owns the connection's
//! protocol state and its (at most one) streaming job, and turns every inbound
//! envelope into a list of [`Effect`]s for the transport to carry out.
//!
//! ## States:
//! ```text
//!            control-start               close
//!   Idle ───────────────────► Streaming ───────► Closing ──► Closed
//!    ▲ │                         │
//!    │ └──────── close ──────────┼──────────────►
//!    └──────── control-stop ─────┘
//! ```
//!
//! ## Rust Concepts:
//! - **Pure state machine**: no I/O happens here. Replies, model invocations and
//!   cancellations are returned as values, which keeps the logic testable without
//!   a socket or a model
//! - **Exhaustive match**: every (state, message) pair is handled explicitly
//!
//! ## Text Messages:
//! A `text` message is echoed with a server timestamp, then answered with speech:
//! `audio-response {status: "processing"}`, the synthesized audio as
//! `audio-response` chunks, and `audio-response {status: "finished"}`. One
//! synthesis runs per session at a time; it is independent of the streaming job,
//! so `control-stop` leaves it running and only close cancels it.

use crate::audio::{AudioSample, ProcessingParams};
use crate::config::StreamingConfig;
use crate::error::StreamError;
use crate::observe::{DropReason, StreamEvent, StreamObserver};
use crate::pipeline::{
    split_chunks, Invocation, InvocationResult, StreamingJob, Synthesis, SynthesisResult,
};
use crate::protocol::{ConversationMessage, Envelope, Message, ReadyPayload, StatusKind};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Whether inbound envelopes are still processed.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Streaming)
    }
}

/// Work the session asks its transport to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send this envelope to the client
    Reply(Envelope),
    /// Start a model call
    Invoke(Invocation),
    /// Start speech synthesis for a text message
    Synthesize(Synthesis),
    /// Abandon the in-flight model call of this job or synthesis request
    Cancel { job_id: String },
}

/// Settings a session needs from the streaming configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub job_queue_capacity: usize,
    pub conversation_history: usize,
    pub synthesis_chunk_ms: u64,
}

impl From<&StreamingConfig> for SessionSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            job_queue_capacity: config.job_queue_capacity,
            conversation_history: config.conversation_history,
            synthesis_chunk_ms: config.synthesis_chunk_ms,
        }
    }
}

/// Protocol state of one connection.
pub struct Session {
    id: String,
    state: SessionState,
    last_activity: DateTime<Utc>,
    job: Option<StreamingJob>,
    history: VecDeque<ConversationMessage>,
    /// Request id of the synthesis in flight
    synthesis: Option<String>,
    settings: SessionSettings,
    observer: Arc<dyn StreamObserver>,
}

impl Session {
    /// Create a session in `Idle` with a fresh id.
    pub fn new(settings: SessionSettings, observer: Arc<dyn StreamObserver>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Idle,
            last_activity: Utc::now(),
            job: None,
            history: VecDeque::with_capacity(settings.conversation_history),
            synthesis: None,
            settings,
            observer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn job(&self) -> Option<&StreamingJob> {
        self.job.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.history.iter()
    }

    pub fn synthesizing(&self) -> bool {
        self.synthesis.is_some()
    }

    /// Welcome envelope sent as soon as the connection opens.
    pub fn greeting(&self) -> Envelope {
        Envelope::new(
            Message::Ready(ReadyPayload {
                session_id: self.id.clone(),
            }),
            self.id.clone(),
        )
    }

    /// Route one inbound envelope.
    ///
    /// Envelopes are handled strictly one at a time, in the order the transport
    /// delivers them. Nothing here can close the connection.
    pub fn dispatch(&mut self, envelope: Envelope) -> Vec<Effect> {
        if !self.state.is_live() {
            return Vec::new();
        }
        self.last_activity = Utc::now();

        match (self.state, envelope.message) {
            (SessionState::Idle, Message::ControlStart(params)) => self.start(params),
            (SessionState::Streaming, Message::ControlStart(_)) => self.reject(
                StreamError::protocol("control-start", "a stream is already active"),
            ),

            (SessionState::Streaming, Message::Audio(sample)) => self.accept_audio(sample),
            (SessionState::Idle, Message::Audio(_)) => self.reject(StreamError::protocol(
                "audio",
                "no active stream, send control-start first",
            )),

            (SessionState::Streaming, Message::ControlStop) => self.stop(),
            (SessionState::Idle, Message::ControlStop) => {
                self.reject(StreamError::protocol("control-stop", "no active stream"))
            }

            (_, Message::Text(message)) => self.converse(message),
            (_, Message::Ping(beat)) => vec![Effect::Reply(Envelope::new(
                Message::Pong(beat),
                self.id.clone(),
            ))],

            (_, Message::Unknown { kind }) => {
                self.observer
                    .record(&self.id, StreamEvent::UnknownEnvelope { kind: &kind });
                Vec::new()
            }

            (_, other) => {
                let kind = other.kind().as_str();
                self.reject(StreamError::protocol(
                    kind,
                    "this message type is only sent by the server",
                ))
            }
        }
    }

    /// Turn a failure into an `error` reply. The session state is untouched.
    pub fn reject(&self, error: StreamError) -> Vec<Effect> {
        self.observer
            .record(&self.id, StreamEvent::EnvelopeRejected { error: &error });
        vec![Effect::Reply(Envelope::error(&error, self.id.clone()))]
    }

    /// Feed a finished model call back into the job.
    ///
    /// Results for a job that was stopped or replaced, or for a chunk that is no
    /// longer the one in flight, are discarded without a reply.
    pub fn on_invocation_complete(&mut self, result: InvocationResult) -> Vec<Effect> {
        let Some(job) = self
            .job
            .as_mut()
            .filter(|job| job.id() == result.job_id && job.in_flight() == Some(result.seq))
        else {
            self.observer.record(
                &self.id,
                StreamEvent::StaleResult {
                    job_id: &result.job_id,
                },
            );
            return Vec::new();
        };

        let mut effects = Vec::with_capacity(2);
        let success = result.outcome.is_ok();
        match result.outcome {
            Ok(sample) => {
                self.observer.record(
                    &self.id,
                    StreamEvent::ChunkProcessed {
                        job_id: &result.job_id,
                        elapsed_ms: result.elapsed.as_millis() as u64,
                    },
                );
                effects.push(Effect::Reply(Envelope::audio_chunk(sample, self.id.clone())));
            }
            Err(error) => {
                self.observer.record(
                    &self.id,
                    StreamEvent::ChunkFailed {
                        job_id: &result.job_id,
                        error: &error,
                    },
                );
                effects.push(Effect::Reply(Envelope::error(&error, self.id.clone())));
            }
        }

        if let Some(next) = job.finish(success) {
            effects.push(Effect::Invoke(next));
        }
        effects
    }

    /// Feed finished speech synthesis back into the session.
    ///
    /// A result for a request that is no longer in flight is discarded.
    pub fn on_synthesis_complete(&mut self, result: SynthesisResult) -> Vec<Effect> {
        if self.synthesis.as_deref() != Some(result.request_id.as_str()) {
            self.observer.record(
                &self.id,
                StreamEvent::StaleResult {
                    job_id: &result.request_id,
                },
            );
            return Vec::new();
        }
        self.synthesis = None;

        match result.outcome {
            Ok(speech) => {
                let chunks = split_chunks(speech, self.settings.synthesis_chunk_ms);
                self.observer.record(
                    &self.id,
                    StreamEvent::SynthesisFinished {
                        request_id: &result.request_id,
                        chunks: chunks.len(),
                        elapsed_ms: result.elapsed.as_millis() as u64,
                    },
                );

                let mut effects: Vec<Effect> = chunks
                    .into_iter()
                    .map(|chunk| Effect::Reply(Envelope::audio_chunk(chunk, self.id.clone())))
                    .collect();
                effects.push(Effect::Reply(Envelope::status(
                    StatusKind::Finished,
                    "Speech finished",
                    self.id.clone(),
                )));
                effects
            }
            Err(error) => {
                self.observer.record(
                    &self.id,
                    StreamEvent::SynthesisFailed {
                        request_id: &result.request_id,
                        error: &error,
                    },
                );
                vec![Effect::Reply(Envelope::error(&error, self.id.clone()))]
            }
        }
    }

    /// Tear the session down after the transport closed (or on shutdown).
    ///
    /// Runs at most once; later calls return nothing.
    pub fn close(&mut self) -> Vec<Effect> {
        if !self.state.is_live() {
            return Vec::new();
        }

        self.transition(SessionState::Closing);
        let mut effects = self.release_job();
        if let Some(request_id) = self.synthesis.take() {
            effects.push(Effect::Cancel { job_id: request_id });
        }
        self.transition(SessionState::Closed);
        effects
    }

    fn start(&mut self, params: ProcessingParams) -> Vec<Effect> {
        if let Err(error) = params.validate() {
            return self.reject(error);
        }

        let job = StreamingJob::new(params, self.settings.job_queue_capacity);
        self.observer
            .record(&self.id, StreamEvent::JobStarted { job_id: job.id() });
        self.job = Some(job);
        self.transition(SessionState::Streaming);
        Vec::new()
    }

    fn accept_audio(&mut self, sample: AudioSample) -> Vec<Effect> {
        if sample.is_empty() {
            return Vec::new();
        }
        if let Err(error) = sample.validate() {
            return self.reject(error);
        }

        let Some(job) = self.job.as_mut() else {
            return self.reject(StreamError::protocol("audio", "no active stream"));
        };

        self.observer.record(
            &self.id,
            StreamEvent::ChunkReceived {
                job_id: job.id(),
                samples: sample.len(),
                duration_ms: sample.duration_ms(),
            },
        );

        let submission = job.submit(sample);
        if submission.evicted {
            self.observer.record(
                &self.id,
                StreamEvent::ChunkDropped {
                    reason: DropReason::JobQueueFull,
                },
            );
        }
        submission.invoke.map(Effect::Invoke).into_iter().collect()
    }

    fn stop(&mut self) -> Vec<Effect> {
        let mut effects = self.release_job();
        effects.push(Effect::Reply(Envelope::stop_ack(
            "Streaming stopped",
            self.id.clone(),
        )));
        self.transition(SessionState::Idle);
        effects
    }

    fn converse(&mut self, message: ConversationMessage) -> Vec<Effect> {
        if message.text.trim().is_empty() {
            return self.reject(StreamError::validation("text", "text must not be empty"));
        }
        if self.synthesis.is_some() {
            return self.reject(StreamError::protocol(
                "text",
                "the previous message is still being answered",
            ));
        }

        let stamped = ConversationMessage {
            text: message.text,
            timestamp: self.last_activity.timestamp_millis().max(0) as u64,
        };

        if self.history.len() >= self.settings.conversation_history.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(stamped.clone());

        let synthesis = Synthesis::new(stamped.text.clone());
        self.observer.record(
            &self.id,
            StreamEvent::SynthesisStarted {
                request_id: &synthesis.request_id,
                chars: stamped.text.chars().count(),
            },
        );
        self.synthesis = Some(synthesis.request_id.clone());

        vec![
            Effect::Reply(Envelope::new(Message::Text(stamped), self.id.clone())),
            Effect::Reply(Envelope::status(
                StatusKind::Processing,
                "Synthesizing speech",
                self.id.clone(),
            )),
            Effect::Synthesize(synthesis),
        ]
    }

    /// Destroy the current job, cancelling its in-flight call.
    fn release_job(&mut self) -> Vec<Effect> {
        let Some(job) = self.job.take() else {
            return Vec::new();
        };

        let stats = job.stats();
        self.observer.record(
            &self.id,
            StreamEvent::JobStopped {
                job_id: job.id(),
                processed: stats.processed,
                failed: stats.failed,
                dropped: stats.dropped,
                age_ms: job.age().as_millis() as u64,
            },
        );

        match job.in_flight() {
            Some(_) => vec![Effect::Cancel {
                job_id: job.id().to_string(),
            }],
            None => Vec::new(),
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.observer
            .record(&self.id, StreamEvent::StateChanged { from, to });
    }
}
