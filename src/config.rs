//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and config formats
//! - **derive macros**: Automatically generate Debug, Clone, Serialize, Deserialize
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP__SERVER__PORT, APP__STREAMING__MODEL_TIMEOUT_MS, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// actix's own default frame limit; anything smaller rejects ordinary chunks.
const MIN_FRAME_BYTES: usize = 64 * 1024;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub streaming: StreamingConfig,
    pub model: ModelConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-connection streaming behaviour.
///
/// ## Fields:
/// - `job_queue_capacity`: chunks that may wait behind the in-flight model call
/// - `model_timeout_ms`: upper bound for one model invocation
/// - `outbound_capacity`: unsent frames buffered per connection before eviction
/// - `send_window`: frames written to the socket per flush tick
/// - `flush_interval_ms`: how often the send window is refilled
/// - `heartbeat_interval_secs` / `client_timeout_secs`: WebSocket keepalive
/// - `conversation_history`: text messages remembered per session
/// - `max_frame_bytes`: largest inbound WebSocket frame accepted
/// - `synthesis_chunk_ms`: length of each streamed chunk of synthesized speech
///
/// ## Tuning guidelines:
/// - Larger queues hide model jitter but add latency before frames are dropped
/// - A short model timeout keeps sessions responsive when the model stalls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub job_queue_capacity: usize,
    pub model_timeout_ms: u64,
    pub outbound_capacity: usize,
    pub send_window: usize,
    pub flush_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub conversation_history: usize,
    pub max_frame_bytes: usize,
    pub synthesis_chunk_ms: u64,
}

/// Model selection.
///
/// - `name`: which model implementation to run (`dsp` is the only local model)
/// - `simulated_latency_ms`: artificial delay per chunk, 0 disables it
/// - `max_output_samples`: longest chunk the model may produce
/// - `tone_duration_ms`: length of synthesized speech
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub simulated_latency_ms: u64,
    pub max_output_samples: usize,
    pub tone_duration_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            job_queue_capacity: 4,        // A handful of chunks
            model_timeout_ms: 5000,
            outbound_capacity: 32,
            send_window: 16,
            flush_interval_ms: 20,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
            conversation_history: 32,
            max_frame_bytes: 4 * 1024 * 1024, // ~300k samples of JSON audio
            synthesis_chunk_ms: 50,
        }
    }
}

impl StreamingConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            streaming: StreamingConfig::default(),
            model: ModelConfig {
                name: "dsp".to_string(),
                simulated_latency_ms: 0,
                max_output_samples: 1_440_000,
                tone_duration_ms: 1000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__STREAMING__JOB_QUEUE_CAPACITY=8`: Override the job queue depth
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    ///
    /// A double underscore separates sections so that field names may contain `_`.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Every capacity, window, interval and timeout is greater than 0
    /// - The frame limit is not below actix's 64 KiB default
    /// - The model name is one this build can run
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let s = &self.streaming;
        let positive = [
            ("job_queue_capacity", s.job_queue_capacity as u64),
            ("model_timeout_ms", s.model_timeout_ms),
            ("outbound_capacity", s.outbound_capacity as u64),
            ("send_window", s.send_window as u64),
            ("flush_interval_ms", s.flush_interval_ms),
            ("heartbeat_interval_secs", s.heartbeat_interval_secs),
            ("client_timeout_secs", s.client_timeout_secs),
            ("conversation_history", s.conversation_history as u64),
            ("max_frame_bytes", s.max_frame_bytes as u64),
            ("synthesis_chunk_ms", s.synthesis_chunk_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(anyhow::anyhow!("streaming.{} must be greater than 0", name));
            }
        }

        if s.client_timeout_secs < s.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "streaming.client_timeout_secs must not be shorter than heartbeat_interval_secs"
            ));
        }

        if s.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(anyhow::anyhow!(
                "streaming.max_frame_bytes must be at least {} bytes",
                MIN_FRAME_BYTES
            ));
        }

        if self.model.max_output_samples == 0 || self.model.tone_duration_ms == 0 {
            return Err(anyhow::anyhow!(
                "model.max_output_samples and model.tone_duration_ms must be greater than 0"
            ));
        }

        if self.model.name != "dsp" {
            return Err(anyhow::anyhow!("Unknown model '{}'", self.model.name));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.streaming.job_queue_capacity, 4);
        assert!(config.streaming.max_frame_bytes >= 150_000);
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.model_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.client_timeout_secs = 10;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.max_frame_bytes = 1024;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.max_output_samples = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.name = "whisper".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml_source() {
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(config::File::from_str(
                "[streaming]\njob_queue_capacity = 8\nmodel_timeout_ms = 250\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.streaming.job_queue_capacity, 8);
        assert_eq!(config.streaming.model_timeout(), Duration::from_millis(250));
        assert_eq!(config.streaming.outbound_capacity, 32);
    }
}
