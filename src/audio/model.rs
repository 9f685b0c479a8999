//! # Audio Model Collaborator
//!
//! The model is an opaque asynchronous capability: given processing parameters and
//! a chunk of audio, it produces processed audio or fails. It can also turn a
//! conversational text message into speech. The streaming pipeline only ever talks
//! to the [`AudioModel`] trait, so a remote inference service and the local
//! [`DspModel`] are interchangeable.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crate::audio::codec::AudioSample;
use crate::audio::params::ProcessingParams;
use crate::config::ModelConfig;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

/// Sample rate of synthesized speech.
pub const SYNTHESIS_SAMPLE_RATE: u32 = 24_000;

const TONE_FREQUENCY_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.5;
const TONE_FADE: Duration = Duration::from_millis(100);

/// Asynchronous audio processing capability invoked once per chunk.
#[async_trait]
pub trait AudioModel: Send + Sync {
    /// Short name used in logs and the health endpoint.
    fn name(&self) -> &str;

    /// Process one chunk. The returned sample must keep the input sample rate.
    async fn process_audio(
        &self,
        sample: AudioSample,
        params: ProcessingParams,
    ) -> Result<AudioSample>;

    /// Turn a conversational message into speech.
    async fn synthesize(&self, text: &str) -> Result<AudioSample> {
        let _ = text;
        Err(anyhow!("model '{}' cannot synthesize speech", self.name()))
    }
}

/// Local signal-processing model.
///
/// ## Processing Steps:
/// 1. **Varispeed**: resample by `speed * 2^(pitch / 12)` using linear interpolation,
///    like a tape running faster or slower (pitch and tempo move together)
/// 2. **Gain**: multiply by `volume`
///
/// With `pitch = 0` and `speed = 1` the output has exactly as many samples as the input.
/// A rate that would stretch a chunk past `max_output_samples` is a processing error.
///
/// ## Synthesis:
/// Speech is stood in for by a 440 Hz tone at 24 kHz with short fades at both ends.
#[derive(Debug, Clone)]
pub struct DspModel {
    /// Artificial delay before each result, for exercising timeouts
    simulated_latency: Option<Duration>,
    max_output_samples: usize,
    tone_duration: Duration,
}

impl Default for DspModel {
    fn default() -> Self {
        Self {
            simulated_latency: None,
            max_output_samples: 1_440_000, // 30 s at 48 kHz
            tone_duration: Duration::from_millis(1000),
        }
    }
}

impl DspModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = Some(latency);
        self
    }

    pub fn with_max_output_samples(mut self, max: usize) -> Self {
        self.max_output_samples = max.max(1);
        self
    }

    pub fn with_tone_duration(mut self, duration: Duration) -> Self {
        self.tone_duration = duration;
        self
    }

    /// Synchronous core of the model, shared with tests.
    pub fn render(&self, sample: &AudioSample, params: &ProcessingParams) -> Result<AudioSample> {
        if sample.is_empty() {
            return Err(anyhow!("cannot process an empty chunk"));
        }

        let factor = params.rate_factor();
        if !factor.is_finite() || factor <= 0.0 {
            return Err(anyhow!("invalid playback rate {}", factor));
        }

        let out_len = (sample.len() as f64 / factor).ceil().max(1.0);
        if out_len > self.max_output_samples as f64 {
            return Err(anyhow!(
                "playback rate {:.3e} would stretch {} samples to {:.0}, more than the {} allowed",
                factor,
                sample.len(),
                out_len,
                self.max_output_samples
            ));
        }

        let mut output = resample_linear(&sample.samples, factor, out_len as usize);
        for value in &mut output {
            *value = (*value * params.volume).clamp(-1.0, 1.0);
        }

        Ok(AudioSample::new(sample.sample_rate, output))
    }

    /// Generate the stand-in tone for a synthesis request.
    pub fn tone(&self) -> AudioSample {
        let rate = SYNTHESIS_SAMPLE_RATE as f32;
        let len = samples_for(self.tone_duration, SYNTHESIS_SAMPLE_RATE).max(1);
        let fade = samples_for(TONE_FADE, SYNTHESIS_SAMPLE_RATE).min(len / 2).max(1);

        let samples = (0..len)
            .map(|i| {
                let value = TONE_AMPLITUDE * (2.0 * PI * TONE_FREQUENCY_HZ * i as f32 / rate).sin();
                let envelope = if i < fade {
                    i as f32 / fade as f32
                } else if i >= len - fade {
                    (len - 1 - i) as f32 / fade as f32
                } else {
                    1.0
                };
                value * envelope
            })
            .collect();

        AudioSample::new(SYNTHESIS_SAMPLE_RATE, samples)
    }
}

#[async_trait]
impl AudioModel for DspModel {
    fn name(&self) -> &str {
        "dsp"
    }

    /// Resampling runs on the blocking pool so a slow render never stalls the
    /// connection actor and the caller's timeout stays effective.
    async fn process_audio(
        &self,
        sample: AudioSample,
        params: ProcessingParams,
    ) -> Result<AudioSample> {
        if let Some(latency) = self.simulated_latency {
            tokio::time::sleep(latency).await;
        }

        let model = self.clone();
        tokio::task::spawn_blocking(move || model.render(&sample, &params))
            .await
            .map_err(|e| anyhow!("processing task failed: {}", e))?
    }

    async fn synthesize(&self, text: &str) -> Result<AudioSample> {
        if text.trim().is_empty() {
            return Err(anyhow!("nothing to synthesize"));
        }
        if let Some(latency) = self.simulated_latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.tone())
    }
}

/// Build the model named in the configuration.
pub fn from_config(config: &ModelConfig) -> Result<Arc<dyn AudioModel>> {
    match config.name.as_str() {
        "dsp" => {
            let mut model = DspModel::new()
                .with_max_output_samples(config.max_output_samples)
                .with_tone_duration(Duration::from_millis(config.tone_duration_ms));
            if config.simulated_latency_ms > 0 {
                model = model.with_latency(Duration::from_millis(config.simulated_latency_ms));
            }
            Ok(Arc::new(model))
        }
        other => Err(anyhow!("unknown model '{}'", other)),
    }
}

fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64).round() as usize
}

/// Read `input` at `factor` times its original rate, producing `out_len` samples.
fn resample_linear(input: &[f32], factor: f64, out_len: usize) -> Vec<f32> {
    if (factor - 1.0).abs() < f64::EPSILON {
        return input.to_vec();
    }

    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let position = i as f64 * factor;
            let index = position.floor() as usize;
            if index >= last {
                return input[last];
            }
            let frac = (position - index as f64) as f32;
            input[index] + (input[index + 1] - input[index]) * frac
        })
        .collect()
}
