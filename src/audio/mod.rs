//! # Audio Module
//!
//! Audio representations and the model collaborator used by the streaming pipeline.
//!
//! ## Key Components:
//! - **Codec**: native buffer ↔ transport sample, plus 16-bit PCM binary frames
//! - **Params**: per-job processing parameters and their validation
//! - **Model**: the asynchronous processing capability invoked for every chunk

pub mod codec;    // NativeBuffer / AudioSample conversions
pub mod model;    // AudioModel trait and the local DSP model
pub mod params;   // ProcessingParams

pub use codec::{AudioSample, NativeBuffer};
pub use model::{AudioModel, DspModel};
pub use params::ProcessingParams;
