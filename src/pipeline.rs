//! # Streaming Pipeline
//!
//! Per-job chunk flow between the session and the model:
//!
//! ```text
//! audio chunk → StreamingJob::submit → (idle?) → Invocation → run_invocation → result
//!                        │                                                      │
//!                        └── queued (bounded, drop-oldest) ◄── StreamingJob::finish
//! ```
//!
//! ## Guarantees:
//! - At most one model invocation is in flight per job
//! - Chunks are handed to the model in arrival order
//! - When the queue is full the OLDEST queued chunk is dropped, never the newest
//! - Every invocation is bounded by a timeout; a timeout counts as a failure
//!
//! Speech synthesis for `text` messages follows the same rules with its own
//! [`Synthesis`] request: one per session at a time, bounded by the same timeout.

use crate::audio::{AudioModel, AudioSample, ProcessingParams};
use crate::error::StreamError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Bounded FIFO of chunks waiting for the model.
#[derive(Debug)]
pub struct ChunkQueue {
    items: VecDeque<AudioSample>,
    capacity: usize,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a chunk, returning the chunk evicted to make room (if any).
    pub fn push(&mut self, chunk: AudioSample) -> Option<AudioSample> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(chunk);
        evicted
    }

    pub fn pop(&mut self) -> Option<AudioSample> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One model call for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub job_id: String,
    /// Position of the chunk within its job, starting at 0
    pub seq: u64,
    pub chunk: AudioSample,
    pub params: ProcessingParams,
}

/// Outcome of [`run_invocation`], fed back into the session.
#[derive(Debug)]
pub struct InvocationResult {
    pub job_id: String,
    pub seq: u64,
    pub elapsed: Duration,
    pub outcome: Result<AudioSample, StreamError>,
}

/// Per-job counters reported when the job ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// What happened to a submitted chunk.
#[derive(Debug, Default)]
pub struct Submission {
    /// Start this invocation now (the job was idle)
    pub invoke: Option<Invocation>,
    /// A queued chunk was dropped to make room
    pub evicted: bool,
}

/// A streaming job: the parameters fixed at `control-start` plus the chunk queue.
///
/// Destroyed on `control-stop` or close. A job never outlives its session and a
/// session owns at most one job.
#[derive(Debug)]
pub struct StreamingJob {
    id: String,
    params: ProcessingParams,
    queue: ChunkQueue,
    in_flight: Option<u64>,
    next_seq: u64,
    stats: JobStats,
    started_at: Instant,
}

impl StreamingJob {
    pub fn new(params: ProcessingParams, queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            params,
            queue: ChunkQueue::new(queue_capacity),
            in_flight: None,
            next_seq: 0,
            stats: JobStats::default(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> ProcessingParams {
        self.params
    }

    pub fn stats(&self) -> JobStats {
        self.stats
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Sequence number of the chunk currently with the model.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Accept a chunk from the client.
    ///
    /// If nothing is in flight the chunk goes straight to the model; otherwise it
    /// waits in the queue.
    pub fn submit(&mut self, chunk: AudioSample) -> Submission {
        self.stats.received += 1;

        if self.in_flight.is_none() {
            return Submission {
                invoke: Some(self.start(chunk)),
                evicted: false,
            };
        }

        let evicted = self.queue.push(chunk).is_some();
        if evicted {
            self.stats.dropped += 1;
        }
        Submission {
            invoke: None,
            evicted,
        }
    }

    /// Record the end of the in-flight invocation and return the next one, if any.
    pub fn finish(&mut self, success: bool) -> Option<Invocation> {
        self.in_flight = None;
        if success {
            self.stats.processed += 1;
        } else {
            self.stats.failed += 1;
        }

        let next = self.queue.pop()?;
        Some(self.start(next))
    }

    fn start(&mut self, chunk: AudioSample) -> Invocation {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some(seq);
        Invocation {
            job_id: self.id.clone(),
            seq,
            chunk,
            params: self.params,
        }
    }
}

/// One speech synthesis call for a `text` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub request_id: String,
    pub text: String,
}

impl Synthesis {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            text: text.into(),
        }
    }
}

/// Outcome of [`run_synthesis`].
#[derive(Debug)]
pub struct SynthesisResult {
    pub request_id: String,
    pub elapsed: Duration,
    pub outcome: Result<AudioSample, StreamError>,
}

/// Run one invocation against the model, bounded by `timeout`.
///
/// Model errors and timeouts both come back as `StreamError::Pipeline` carrying the
/// job id. The reason is the model's top-level message only.
pub async fn run_invocation(
    model: Arc<dyn AudioModel>,
    invocation: Invocation,
    timeout: Duration,
) -> InvocationResult {
    let started = Instant::now();
    let Invocation {
        job_id,
        seq,
        chunk,
        params,
    } = invocation;
    let input_rate = chunk.sample_rate;

    let outcome = match tokio::time::timeout(timeout, model.process_audio(chunk, params)).await {
        Err(_) => Err(format!(
            "model did not respond within {} ms",
            timeout.as_millis()
        )),
        Ok(Err(e)) => Err(format!("model failed: {}", e)),
        Ok(Ok(output)) if output.is_empty() => Err("model returned no audio".to_string()),
        Ok(Ok(output)) if output.sample_rate != input_rate => Err(format!(
            "model changed the sample rate from {} to {}",
            input_rate, output.sample_rate
        )),
        Ok(Ok(output)) => Ok(output),
    };

    InvocationResult {
        outcome: outcome.map_err(|reason| StreamError::Pipeline {
            job_id: job_id.clone(),
            reason,
        }),
        job_id,
        seq,
        elapsed: started.elapsed(),
    }
}

/// Run one synthesis request against the model, bounded by `timeout`.
pub async fn run_synthesis(
    model: Arc<dyn AudioModel>,
    synthesis: Synthesis,
    timeout: Duration,
) -> SynthesisResult {
    let started = Instant::now();
    let Synthesis { request_id, text } = synthesis;

    let outcome = match tokio::time::timeout(timeout, model.synthesize(&text)).await {
        Err(_) => Err(format!(
            "model did not respond within {} ms",
            timeout.as_millis()
        )),
        Ok(Err(e)) => Err(e.to_string()),
        Ok(Ok(speech)) if speech.is_empty() || speech.sample_rate == 0 => {
            Err("model returned no audio".to_string())
        }
        Ok(Ok(speech)) => Ok(speech),
    };

    SynthesisResult {
        outcome: outcome.map_err(|reason| StreamError::Synthesis {
            request_id: request_id.clone(),
            reason,
        }),
        request_id,
        elapsed: started.elapsed(),
    }
}

/// Cut audio into consecutive chunks of `chunk_ms` milliseconds (the last may be shorter).
pub fn split_chunks(sample: AudioSample, chunk_ms: u64) -> Vec<AudioSample> {
    let per_chunk = ((sample.sample_rate as u64 * chunk_ms) / 1000).max(1) as usize;
    if sample.len() <= per_chunk {
        return vec![sample];
    }

    sample
        .samples
        .chunks(per_chunk)
        .map(|chunk| AudioSample::new(sample.sample_rate, chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::DspModel;
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct FailingModel;

    #[async_trait]
    impl AudioModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process_audio(
            &self,
            _sample: AudioSample,
            _params: ProcessingParams,
        ) -> anyhow::Result<AudioSample> {
            Err(anyhow!("inference backend unavailable"))
        }
    }

    fn chunk(value: f32) -> AudioSample {
        AudioSample::new(16000, vec![value; 8])
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let mut queue = ChunkQueue::new(2);
        assert!(queue.push(chunk(0.1)).is_none());
        assert!(queue.push(chunk(0.2)).is_none());

        let evicted = queue.push(chunk(0.3)).unwrap();
        assert_eq!(evicted, chunk(0.1));
        assert_eq!(queue.pop(), Some(chunk(0.2)));
        assert_eq!(queue.pop(), Some(chunk(0.3)));
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 2);

        // A zero capacity still holds the newest chunk.
        let mut tiny = ChunkQueue::new(0);
        assert_eq!(tiny.capacity(), 1);
        tiny.push(chunk(0.1));
        assert_eq!(tiny.push(chunk(0.2)), Some(chunk(0.1)));
    }

    #[test]
    fn test_one_invocation_in_flight() {
        let mut job = StreamingJob::new(ProcessingParams::default(), 4);

        let first = job.submit(chunk(0.1));
        let invocation = first.invoke.unwrap();
        assert_eq!(invocation.seq, 0);
        assert_eq!(invocation.job_id, job.id());

        let second = job.submit(chunk(0.2));
        assert!(second.invoke.is_none());
        assert_eq!(job.queued(), 1);
        assert_eq!(job.in_flight(), Some(0));

        let next = job.finish(true).unwrap();
        assert_eq!(next.seq, 1);
        assert_eq!(next.chunk, chunk(0.2));
        assert!(job.finish(true).is_none());
        assert_eq!(job.in_flight(), None);
        assert_eq!(job.stats().processed, 2);
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let mut job = StreamingJob::new(ProcessingParams::default(), 2);
        job.submit(chunk(0.0));
        job.submit(chunk(0.1));
        job.submit(chunk(0.2));
        let third = job.submit(chunk(0.3));

        assert!(third.evicted);
        assert_eq!(job.stats().dropped, 1);
        assert_eq!(job.stats().received, 4);
        // The newest chunks survive, in order.
        assert_eq!(job.finish(true).unwrap().chunk, chunk(0.2));
        assert_eq!(job.finish(true).unwrap().chunk, chunk(0.3));
    }

    #[tokio::test]
    async fn test_invocation_keeps_sample_rate() {
        let model: Arc<dyn AudioModel> = Arc::new(DspModel::new());
        let mut job = StreamingJob::new(ProcessingParams::new(0.5, 0.0, 1.0), 4);
        let invocation = job.submit(AudioSample::new(16000, vec![0.5; 128])).invoke.unwrap();

        let result = run_invocation(model, invocation, Duration::from_secs(1)).await;
        let output = result.outcome.unwrap();
        assert_eq!(output.sample_rate, 16000);
        assert_eq!(output.len(), 128);
        assert_eq!(result.job_id, job.id());
    }

    #[tokio::test]
    async fn test_model_error_becomes_pipeline_error() {
        let model: Arc<dyn AudioModel> = Arc::new(FailingModel);
        let mut job = StreamingJob::new(ProcessingParams::default(), 4);
        let invocation = job.submit(chunk(0.1)).invoke.unwrap();

        let result = run_invocation(model, invocation, Duration::from_secs(1)).await;
        let err = result.outcome.unwrap_err();
        assert_eq!(err.job_id(), Some(job.id()));
        assert!(err.to_string().contains("inference backend unavailable"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let model: Arc<dyn AudioModel> = Arc::new(DspModel::new().with_latency(Duration::from_secs(10)));
        let mut job = StreamingJob::new(ProcessingParams::default(), 4);
        let invocation = job.submit(chunk(0.1)).invoke.unwrap();

        let result = run_invocation(model, invocation, Duration::from_millis(50)).await;
        let err = result.outcome.unwrap_err();
        assert!(err.to_string().contains("did not respond within 50 ms"));
    }

    #[tokio::test]
    async fn test_extreme_rate_is_a_chunk_failure() {
        let model: Arc<dyn AudioModel> = Arc::new(DspModel::new());
        let mut job = StreamingJob::new(ProcessingParams::new(0.8, 0.0, 1e-20), 4);
        let invocation = job.submit(AudioSample::new(16000, vec![0.5; 128])).invoke.unwrap();

        let result = run_invocation(model, invocation, Duration::from_secs(1)).await;
        let err = result.outcome.unwrap_err();
        assert_eq!(err.operation(), "process-audio");
        assert_eq!(err.job_id(), Some(job.id()));
    }

    #[tokio::test]
    async fn test_synthesis_result() {
        let model: Arc<dyn AudioModel> =
            Arc::new(DspModel::new().with_tone_duration(Duration::from_millis(200)));
        let synthesis = Synthesis::new("hello");
        let request_id = synthesis.request_id.clone();

        let result = run_synthesis(model, synthesis, Duration::from_secs(1)).await;
        assert_eq!(result.request_id, request_id);
        assert_eq!(result.outcome.unwrap().len(), 4_800);
    }

    #[tokio::test]
    async fn test_synthesis_unsupported_by_model() {
        let model: Arc<dyn AudioModel> = Arc::new(FailingModel);
        let result = run_synthesis(model, Synthesis::new("hello"), Duration::from_secs(1)).await;

        let err = result.outcome.unwrap_err();
        assert_eq!(err.operation(), "synthesize");
        assert!(err.to_string().contains("cannot synthesize"));
    }

    #[test]
    fn test_split_chunks() {
        let speech = AudioSample::new(24000, vec![0.1; 2_500]);
        let chunks = split_chunks(speech, 50);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1_200);
        assert_eq!(chunks[2].len(), 100);
        assert!(chunks.iter().all(|c| c.sample_rate == 24000));

        let short = split_chunks(AudioSample::new(24000, vec![0.1; 10]), 50);
        assert_eq!(short.len(), 1);
    }
}
