//! # Observability Hook
//!
//! The transport adapter and the session machine never log through globals; they
//! report [`StreamEvent`]s to a [`StreamObserver`] handed to them at construction.
//! Production uses [`TracingObserver`], which turns events into structured
//! `tracing` records and bumps the shared [`StreamMetrics`].

use crate::error::StreamError;
use crate::session::SessionState;
use crate::state::StreamMetrics;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a chunk or frame was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The job's input queue was full; the oldest queued chunk was evicted
    JobQueueFull,
    /// The outbound buffer was saturated; the oldest unsent audio-response was evicted
    OutboundSaturated,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::JobQueueFull => "job_queue_full",
            DropReason::OutboundSaturated => "outbound_saturated",
        }
    }
}

/// Everything worth recording about a session.
#[derive(Debug, Clone, Copy)]
pub enum StreamEvent<'a> {
    ConnectionOpened,
    ConnectionClosed,
    StateChanged { from: SessionState, to: SessionState },
    JobStarted { job_id: &'a str },
    JobStopped { job_id: &'a str, processed: u64, failed: u64, dropped: u64, age_ms: u64 },
    ChunkReceived { job_id: &'a str, samples: usize, duration_ms: f64 },
    ChunkProcessed { job_id: &'a str, elapsed_ms: u64 },
    ChunkFailed { job_id: &'a str, error: &'a StreamError },
    ChunkDropped { reason: DropReason },
    StaleResult { job_id: &'a str },
    SynthesisStarted { request_id: &'a str, chars: usize },
    SynthesisFinished { request_id: &'a str, chunks: usize, elapsed_ms: u64 },
    SynthesisFailed { request_id: &'a str, error: &'a StreamError },
    EnvelopeRejected { error: &'a StreamError },
    UnknownEnvelope { kind: &'a str },
    SendSkipped { kind: &'a str },
}

/// Sink for stream events. Implementations must be cheap; they run on the
/// connection's event loop.
pub trait StreamObserver: Send + Sync {
    fn record(&self, session_id: &str, event: StreamEvent<'_>);
}

/// Observer that logs with `tracing` and updates the shared counters.
pub struct TracingObserver {
    metrics: Arc<StreamMetrics>,
}

impl TracingObserver {
    pub fn new(metrics: Arc<StreamMetrics>) -> Self {
        Self { metrics }
    }
}

impl StreamObserver for TracingObserver {
    fn record(&self, session_id: &str, event: StreamEvent<'_>) {
        let m = &self.metrics;
        match event {
            StreamEvent::ConnectionOpened => {
                m.connection_opened();
                info!(session_id, "Connection opened");
            }
            StreamEvent::ConnectionClosed => {
                m.connection_closed();
                info!(session_id, "Connection closed");
            }
            StreamEvent::StateChanged { from, to } => {
                debug!(session_id, from = from.as_str(), to = to.as_str(), "Session state changed");
            }
            StreamEvent::JobStarted { job_id } => {
                StreamMetrics::incr(&m.jobs_started);
                info!(session_id, job_id, "Streaming job started");
            }
            StreamEvent::JobStopped {
                job_id,
                processed,
                failed,
                dropped,
                age_ms,
            } => {
                info!(session_id, job_id, processed, failed, dropped, age_ms, "Streaming job stopped");
            }
            StreamEvent::ChunkReceived {
                job_id,
                samples,
                duration_ms,
            } => {
                StreamMetrics::incr(&m.chunks_received);
                debug!(session_id, job_id, samples, duration_ms, "Chunk received");
            }
            StreamEvent::ChunkProcessed { job_id, elapsed_ms } => {
                StreamMetrics::incr(&m.chunks_processed);
                debug!(session_id, job_id, elapsed_ms, "Chunk processed");
            }
            StreamEvent::ChunkFailed { job_id, error } => {
                StreamMetrics::incr(&m.chunks_failed);
                warn!(session_id, job_id, error = %error, "Chunk processing failed");
            }
            StreamEvent::ChunkDropped { reason } => {
                match reason {
                    DropReason::JobQueueFull => StreamMetrics::incr(&m.chunks_dropped),
                    DropReason::OutboundSaturated => StreamMetrics::incr(&m.frames_evicted),
                }
                warn!(session_id, reason = reason.as_str(), "Dropped audio chunk");
            }
            StreamEvent::StaleResult { job_id } => {
                debug!(session_id, job_id, "Discarding result for a finished job");
            }
            StreamEvent::SynthesisStarted { request_id, chars } => {
                info!(session_id, request_id, chars, "Speech synthesis started");
            }
            StreamEvent::SynthesisFinished {
                request_id,
                chunks,
                elapsed_ms,
            } => {
                StreamMetrics::incr(&m.syntheses_completed);
                info!(session_id, request_id, chunks, elapsed_ms, "Speech synthesis finished");
            }
            StreamEvent::SynthesisFailed { request_id, error } => {
                StreamMetrics::incr(&m.syntheses_failed);
                warn!(session_id, request_id, error = %error, "Speech synthesis failed");
            }
            StreamEvent::EnvelopeRejected { error } => {
                StreamMetrics::incr(&m.envelopes_rejected);
                warn!(session_id, kind = error.kind(), error = %error, "Envelope rejected");
            }
            StreamEvent::UnknownEnvelope { kind } => {
                warn!(session_id, kind, "Dropping envelope of unknown type");
            }
            StreamEvent::SendSkipped { kind } => {
                warn!(session_id, kind, "Socket not open, envelope not sent");
            }
        }
    }
}

/// Observer that remembers event names, for assertions in tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == name).count()
    }
}

#[cfg(test)]
impl StreamObserver for RecordingObserver {
    fn record(&self, _session_id: &str, event: StreamEvent<'_>) {
        let name = match event {
            StreamEvent::ConnectionOpened => "connection_opened".to_string(),
            StreamEvent::ConnectionClosed => "connection_closed".to_string(),
            StreamEvent::StateChanged { to, .. } => format!("state:{}", to.as_str()),
            StreamEvent::JobStarted { .. } => "job_started".to_string(),
            StreamEvent::JobStopped { .. } => "job_stopped".to_string(),
            StreamEvent::ChunkReceived { .. } => "chunk_received".to_string(),
            StreamEvent::ChunkProcessed { .. } => "chunk_processed".to_string(),
            StreamEvent::ChunkFailed { .. } => "chunk_failed".to_string(),
            StreamEvent::ChunkDropped { reason } => format!("dropped:{}", reason.as_str()),
            StreamEvent::StaleResult { .. } => "stale_result".to_string(),
            StreamEvent::SynthesisStarted { .. } => "synthesis_started".to_string(),
            StreamEvent::SynthesisFinished { .. } => "synthesis_finished".to_string(),
            StreamEvent::SynthesisFailed { .. } => "synthesis_failed".to_string(),
            StreamEvent::EnvelopeRejected { error } => format!("rejected:{}", error.kind()),
            StreamEvent::UnknownEnvelope { .. } => "unknown_envelope".to_string(),
            StreamEvent::SendSkipped { .. } => "send_skipped".to_string(),
        };
        self.events.lock().unwrap().push(name);
    }
}
