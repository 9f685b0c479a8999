//! # Transport Adapter
//!
//! Sits between a session and the raw socket on the way out. Every outbound
//! envelope goes through [`Transport::send`], which:
//!
//! 1. Drops it with a warning when the link is no longer open
//! 2. Encodes it to a JSON text frame
//! 3. Queues it in a bounded [`OutboundQueue`]
//! 4. Writes as many queued frames as the current send window allows
//!
//! ## Backpressure:
//! The socket accepts at most `send_window` frames per flush tick. Frames beyond
//! the window wait in the queue. When the queue holds `outbound_capacity` frames
//! the OLDEST unsent audio-response chunk is evicted to make room; control and
//! error frames are never evicted. A slow client therefore loses stale audio,
//! never protocol messages, and server memory per connection stays bounded.

use crate::observe::{DropReason, StreamEvent, StreamObserver};
use crate::protocol::{AudioResponse, Envelope, Message, MessageKind};
use std::collections::VecDeque;
use std::sync::Arc;

/// Anything that can put a text frame on the wire.
///
/// Implemented for the actix WebSocket context; tests use a plain `Vec<String>`.
pub trait FrameSink {
    fn send_text(&mut self, frame: String);
}

impl FrameSink for Vec<String> {
    fn send_text(&mut self, frame: String) {
        self.push(frame);
    }
}

/// Whether the socket can still carry frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct OutboundFrame {
    kind: MessageKind,
    text: String,
    evictable: bool,
}

/// Bounded buffer of encoded frames waiting for the socket.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<OutboundFrame>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue a frame. Returns `true` when an older audio chunk was evicted for it.
    ///
    /// If the queue is full of frames that may not be evicted, the frame is
    /// queued anyway.
    fn push(&mut self, frame: OutboundFrame) -> bool {
        let mut evicted = false;
        if self.frames.len() >= self.capacity {
            if let Some(index) = self.frames.iter().position(|f| f.evictable) {
                self.frames.remove(index);
                evicted = true;
            }
        }
        self.frames.push_back(frame);
        evicted
    }

    fn pop(&mut self) -> Option<OutboundFrame> {
        self.frames.pop_front()
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Outbound side of one connection.
pub struct Transport {
    session_id: String,
    link: LinkState,
    queue: OutboundQueue,
    window: usize,
    credits: usize,
    observer: Arc<dyn StreamObserver>,
}

impl Transport {
    pub fn new(
        session_id: impl Into<String>,
        outbound_capacity: usize,
        send_window: usize,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let window = send_window.max(1);
        Self {
            session_id: session_id.into(),
            link: LinkState::Open,
            queue: OutboundQueue::new(outbound_capacity),
            window,
            credits: window,
            observer,
        }
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn is_open(&self) -> bool {
        self.link == LinkState::Open
    }

    /// Frames encoded but not yet written.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Send an envelope. Never fails: a closed link or an encoding problem is
    /// logged and the envelope is dropped.
    ///
    /// Returns `true` if the envelope was accepted (written or queued).
    pub fn send<S: FrameSink>(&mut self, envelope: &Envelope, sink: &mut S) -> bool {
        let kind = envelope.kind();
        if !self.is_open() {
            self.observer.record(
                &self.session_id,
                StreamEvent::SendSkipped {
                    kind: kind.as_str(),
                },
            );
            return false;
        }

        let text = match envelope.encode() {
            Ok(text) => text,
            Err(error) => {
                tracing::error!(session_id = %self.session_id, error = %error, "Failed to encode envelope");
                return false;
            }
        };

        let evictable = matches!(
            envelope.message,
            Message::AudioResponse(AudioResponse::Chunk(_))
        );
        if self.queue.push(OutboundFrame {
            kind,
            text,
            evictable,
        }) {
            self.observer.record(
                &self.session_id,
                StreamEvent::ChunkDropped {
                    reason: DropReason::OutboundSaturated,
                },
            );
        }

        self.flush(sink);
        true
    }

    /// Start a new send window and write what fits. Called on every flush tick.
    pub fn refill<S: FrameSink>(&mut self, sink: &mut S) -> usize {
        self.credits = self.window;
        self.flush(sink)
    }

    /// Write queued frames while the window has room.
    pub fn flush<S: FrameSink>(&mut self, sink: &mut S) -> usize {
        if !self.is_open() {
            return 0;
        }

        let mut written = 0;
        while self.credits > 0 {
            let Some(frame) = self.queue.pop() else {
                break;
            };
            tracing::trace!(session_id = %self.session_id, kind = frame.kind.as_str(), "Writing frame");
            sink.send_text(frame.text);
            self.credits -= 1;
            written += 1;
        }
        written
    }

    /// The peer asked to close; nothing more will be written.
    pub fn begin_close(&mut self) {
        if self.link == LinkState::Open {
            self.link = LinkState::Closing;
        }
    }

    /// The socket is gone. Unsent frames are discarded.
    pub fn closed(&mut self) {
        self.link = LinkState::Closed;
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSample;
    use crate::error::StreamError;
    use crate::observe::RecordingObserver;
    use serde_json::Value;

    fn transport(capacity: usize, window: usize) -> (Transport, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        (
            Transport::new("s1", capacity, window, observer.clone()),
            observer,
        )
    }

    fn chunk(marker: f32) -> Envelope {
        Envelope::audio_chunk(AudioSample::new(16000, vec![marker]), "s1")
    }

    fn marker(frame: &str) -> Option<f64> {
        let json: Value = serde_json::from_str(frame).unwrap();
        json["payload"]["samples"][0].as_f64()
    }

    #[test]
    fn test_frames_within_window_are_written_immediately() {
        let (mut transport, _) = transport(8, 4);
        let mut sink = Vec::new();

        for i in 0..3 {
            assert!(transport.send(&chunk(i as f32 / 10.0), &mut sink));
        }
        assert_eq!(sink.len(), 3);
        assert_eq!(transport.pending(), 0);
    }

    #[test]
    fn test_saturation_evicts_oldest_unsent_chunk() {
        let (mut transport, observer) = transport(3, 2);
        let mut sink = Vec::new();

        // Window of 2 is used up by the first two frames.
        transport.send(&chunk(0.0), &mut sink);
        transport.send(&chunk(0.1), &mut sink);
        assert_eq!(sink.len(), 2);

        // Four more chunks against a capacity of 3: the oldest unsent one goes.
        for value in [0.2, 0.3, 0.4, 0.5] {
            transport.send(&chunk(value), &mut sink);
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(transport.pending(), 3);
        assert_eq!(observer.count("dropped:outbound_saturated"), 1);

        // Each tick delivers at most the window.
        assert_eq!(transport.refill(&mut sink), 2);
        assert_eq!(transport.refill(&mut sink), 1);

        let delivered: Vec<f64> = sink.iter().filter_map(|f| marker(f)).collect();
        let expected = [0.0, 0.1, 0.3, 0.4, 0.5];
        assert_eq!(delivered.len(), expected.len());
        for (got, want) in delivered.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{:?}", delivered);
        }
    }

    #[test]
    fn test_control_and_error_frames_are_never_evicted() {
        let (mut transport, _) = transport(2, 1);
        let mut sink = Vec::new();

        transport.send(&chunk(0.0), &mut sink);
        let error = StreamError::protocol("audio", "no active stream");
        transport.send(&Envelope::error(&error, "s1"), &mut sink);
        transport.send(&Envelope::stop_ack("Streaming stopped", "s1"), &mut sink);
        transport.send(&chunk(0.9), &mut sink);

        // Only audio chunks may make room, so the queue grows past capacity.
        assert_eq!(transport.pending(), 3);
        while transport.refill(&mut sink) > 0 {}

        let kinds: Vec<String> = sink
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["audio-response", "error", "audio-response", "audio-response"]);
    }

    #[test]
    fn test_send_after_close_is_a_logged_no_op() {
        let (mut transport, observer) = transport(4, 4);
        let mut sink = Vec::new();

        transport.begin_close();
        assert!(!transport.send(&chunk(0.0), &mut sink));
        transport.closed();
        assert!(!transport.send(&chunk(0.0), &mut sink));

        assert!(sink.is_empty());
        assert_eq!(transport.link(), LinkState::Closed);
        assert_eq!(observer.count("send_skipped"), 2);
    }
}
