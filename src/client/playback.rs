//! Playback side of the client: where decoded response audio ends up.

use crate::audio::NativeBuffer;
use crate::error::{StreamError, StreamResult};
use anyhow::{anyhow, Result};
use std::fs::File;
use std::path::Path;

/// Consumer of decoded audio (a speaker, a file, a test buffer).
pub trait PlaybackSink {
    fn play(&mut self, buffer: &NativeBuffer) -> StreamResult<()>;
}

/// Collects mono audio in memory and writes it out as a 32-bit float WAV file.
#[derive(Debug, Default)]
pub struct WavRecorder {
    sample_rate: Option<u32>,
    samples: Vec<f32>,
}

impl WavRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn duration_ms(&self) -> f64 {
        match self.sample_rate {
            Some(rate) if rate > 0 => self.samples.len() as f64 * 1000.0 / rate as f64,
            _ => 0.0,
        }
    }

    /// Write everything recorded so far.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let rate = self
            .sample_rate
            .ok_or_else(|| anyhow!("nothing has been recorded"))?;

        let header = wav::Header::new(wav::WAV_FORMAT_IEEE_FLOAT, 1, rate, 32);
        let mut file = File::create(path.as_ref())?;
        wav::write(
            header,
            &wav::BitDepth::ThirtyTwoFloat(self.samples.clone()),
            &mut file,
        )?;
        Ok(())
    }
}

impl PlaybackSink for WavRecorder {
    /// Appends channel 0. All buffers must share one sample rate.
    fn play(&mut self, buffer: &NativeBuffer) -> StreamResult<()> {
        let Some(channel) = buffer.channel(0) else {
            return Ok(());
        };

        match self.sample_rate {
            None => self.sample_rate = Some(buffer.sample_rate),
            Some(rate) if rate != buffer.sample_rate => {
                return Err(StreamError::Codec(format!(
                    "cannot record {} Hz audio into a {} Hz recording",
                    buffer.sample_rate, rate
                )));
            }
            Some(_) => {}
        }

        self.samples.extend_from_slice(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_rejects_rate_changes() {
        let mut recorder = WavRecorder::new();
        recorder.play(&NativeBuffer::mono(16000, vec![0.1; 160])).unwrap();
        recorder.play(&NativeBuffer::mono(16000, vec![0.2; 160])).unwrap();

        assert_eq!(recorder.samples().len(), 320);
        assert!((recorder.duration_ms() - 20.0).abs() < 1e-9);
        assert!(recorder.play(&NativeBuffer::mono(44100, vec![0.0; 10])).is_err());
    }

    #[test]
    fn test_write_float_wav() {
        let mut recorder = WavRecorder::new();
        recorder.play(&NativeBuffer::mono(22050, vec![0.5, -0.5, 0.25])).unwrap();

        let path = std::env::temp_dir().join(format!("recording-{}.wav", uuid::Uuid::new_v4()));
        recorder.write_to(&path).unwrap();

        let mut file = File::open(&path).unwrap();
        let (header, data) = wav::read(&mut file).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(header.sampling_rate, 22050);
        assert_eq!(header.channel_count, 1);
        match data {
            wav::BitDepth::ThirtyTwoFloat(samples) => assert_eq!(samples, vec![0.5, -0.5, 0.25]),
            _ => panic!("expected 32-bit float samples"),
        }
    }

    #[test]
    fn test_empty_recorder_cannot_be_written() {
        let path = std::env::temp_dir().join("never-written.wav");
        assert!(WavRecorder::new().write_to(&path).is_err());
    }
}
