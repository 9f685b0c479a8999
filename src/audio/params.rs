//! Processing parameters carried by `control-start`.

use crate::error::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};

/// How the model should transform the audio of one streaming job.
///
/// ## Valid Ranges:
/// - **volume**: 0.0 to 1.0
/// - **pitch**: any finite semitone offset (negative lowers the pitch)
/// - **speed**: finite and greater than 0.0 (1.0 = unchanged)
///
/// Out-of-range values are rejected by [`ProcessingParams::validate`], never clamped,
/// so the caller that sent them gets the error. Valid but extreme rates are
/// bounded by the model, which fails the chunk instead of producing unbounded output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParams {
    pub volume: f32,
    pub pitch: f32,
    pub speed: f32,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pitch: 0.0,
            speed: 1.0,
        }
    }
}

impl ProcessingParams {
    pub fn new(volume: f32, pitch: f32, speed: f32) -> Self {
        Self {
            volume,
            pitch,
            speed,
        }
    }

    /// Validate every field against its documented range.
    pub fn validate(&self) -> StreamResult<()> {
        if !self.volume.is_finite() || !(0.0..=1.0).contains(&self.volume) {
            return Err(StreamError::validation(
                "control-start",
                format!("volume {} is outside [0.0, 1.0]", self.volume),
            ));
        }

        if !self.pitch.is_finite() {
            return Err(StreamError::validation(
                "control-start",
                format!("pitch {} must be a finite semitone offset", self.pitch),
            ));
        }

        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(StreamError::validation(
                "control-start",
                format!("speed {} must be greater than 0.0", self.speed),
            ));
        }

        Ok(())
    }

    /// Combined playback-rate factor used by varispeed processing.
    pub fn rate_factor(&self) -> f64 {
        self.speed as f64 * 2f64.powf(self.pitch as f64 / 12.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_params() {
        assert!(ProcessingParams::new(0.8, 0.0, 1.0).validate().is_ok());
        assert!(ProcessingParams::new(0.0, -12.0, 0.25).validate().is_ok());
        assert!(ProcessingParams::new(1.0, 7.5, 4.0).validate().is_ok());
    }

    #[test]
    fn test_each_field_out_of_range_is_rejected() {
        let cases = [
            ProcessingParams::new(1.01, 0.0, 1.0),
            ProcessingParams::new(-0.1, 0.0, 1.0),
            ProcessingParams::new(f32::NAN, 0.0, 1.0),
            ProcessingParams::new(0.5, f32::INFINITY, 1.0),
            ProcessingParams::new(0.5, 0.0, 0.0),
            ProcessingParams::new(0.5, 0.0, -1.0),
            ProcessingParams::new(0.5, 0.0, f32::NAN),
        ];

        for params in cases {
            let err = params.validate().unwrap_err();
            assert_eq!(err.operation(), "control-start", "{:?}", params);
        }
    }

    #[test]
    fn test_rate_factor() {
        assert!((ProcessingParams::default().rate_factor() - 1.0).abs() < 1e-9);
        assert!((ProcessingParams::new(1.0, 12.0, 1.0).rate_factor() - 2.0).abs() < 1e-9);
        assert!((ProcessingParams::new(1.0, 0.0, 0.5).rate_factor() - 0.5).abs() < 1e-9);
    }
}
