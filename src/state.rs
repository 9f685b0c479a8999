//! # Application State Management
//!
//! State shared by every connection actor and the health endpoint.
//!
//! ## Sharing Rules:
//! - **Sessions are never shared**: each connection actor owns its session and job
//! - **Configuration and model**: read-only after startup, shared through `Arc`
//! - **Metrics**: cross-session counters are plain atomics; every connection only
//!   ever adds to them, so no lock is needed
//!
//! ## Rust Concepts:
//! - **Arc<T>**: shared ownership across actix worker threads
//! - **AtomicU64**: lock-free counters updated with `fetch_add`
//! - **Arc<dyn Trait>**: the model is chosen at startup and used through its trait

use crate::audio::AudioModel;
use crate::config::AppConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// State handed to every request handler via `web::Data`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (fixed after startup)
    pub config: Arc<AppConfig>,

    /// Cross-session counters
    pub metrics: Arc<StreamMetrics>,

    /// Model invoked for every audio chunk and text message
    pub model: Arc<dyn AudioModel>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, model: Arc<dyn AudioModel>) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(StreamMetrics::default()),
            model,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.as_ref().clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Append-only counters aggregated across all sessions.
///
/// Each counter only grows except `active_connections`, which is incremented when a
/// connection opens and decremented exactly once when it closes.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub connections_opened: AtomicU64,
    pub active_connections: AtomicU64,
    pub jobs_started: AtomicU64,
    pub chunks_received: AtomicU64,
    pub chunks_processed: AtomicU64,
    pub chunks_failed: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub frames_evicted: AtomicU64,
    pub envelopes_rejected: AtomicU64,
    pub syntheses_completed: AtomicU64,
    pub syntheses_failed: AtomicU64,
}

/// Point-in-time copy of [`StreamMetrics`] for JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub active_connections: u64,
    pub jobs_started: u64,
    pub chunks_received: u64,
    pub chunks_processed: u64,
    pub chunks_failed: u64,
    pub chunks_dropped: u64,
    pub frames_evicted: u64,
    pub envelopes_rejected: u64,
    pub syntheses_completed: u64,
    pub syntheses_failed: u64,
}

impl StreamMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        Self::incr(&self.connections_opened);
        Self::incr(&self.active_connections);
    }

    /// Saturates at zero so a double close can never wrap the counter.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_opened: load(&self.connections_opened),
            active_connections: load(&self.active_connections),
            jobs_started: load(&self.jobs_started),
            chunks_received: load(&self.chunks_received),
            chunks_processed: load(&self.chunks_processed),
            chunks_failed: load(&self.chunks_failed),
            chunks_dropped: load(&self.chunks_dropped),
            frames_evicted: load(&self.frames_evicted),
            envelopes_rejected: load(&self.envelopes_rejected),
            syntheses_completed: load(&self.syntheses_completed),
            syntheses_failed: load(&self.syntheses_failed),
        }
    }
}
