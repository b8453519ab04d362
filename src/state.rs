//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the current `AppConfig`, readable and updatable at runtime
//! - **metrics**: per-endpoint request counters for the control API
//! - **stream_stats**: lock-free counters the voice pipeline bumps from its
//!   own tasks and device threads
//! - **voice**: the single live-session manager
//!
//! ## Arc<RwLock<T>> Pattern
//! Multiple actix workers read the config and metrics concurrently, only one
//! writes at a time. The stream counters are plain atomics instead: they are
//! bumped from audio callbacks, where taking a lock is not acceptable.

use crate::config::AppConfig;
use crate::live::VoiceService;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime; applies to the next session)
    pub config: Arc<RwLock<AppConfig>>,

    /// Control API request metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Voice pipeline counters, shared with the session manager
    pub stream_stats: Arc<StreamStats>,

    /// Owner of the one live voice session
    pub voice: Arc<VoiceService>,

    /// When the service started
    pub start_time: Instant,
}

/// Request metrics collected by the metrics middleware.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since start
    pub request_count: u64,

    /// Total number of failed HTTP requests since start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "POST /api/v1/voice/session")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Counters for the realtime voice stream.
///
/// Every field is monotonically increasing for the lifetime of the process.
#[derive(Debug, Default)]
pub struct StreamStats {
    sessions_opened: AtomicU64,
    session_errors: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_received: AtomicU64,
    chunks_dropped: AtomicU64,
    interruptions: AtomicU64,
}

/// Point-in-time copy of `StreamStats`, ready for JSON.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStatsSnapshot {
    pub sessions_opened: u64,
    pub session_errors: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub chunks_dropped: u64,
    pub interruptions: u64,
}

impl StreamStats {
    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_error(&self) {
        self.session_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_received(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Build the state around an already constructed voice service.
    ///
    /// The service must have been created with the same `stream_stats` so
    /// that `/metrics` sees what the pipeline records.
    pub fn new(config: AppConfig, voice: Arc<VoiceService>, stream_stats: Arc<StreamStats>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            stream_stats,
            voice,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// A poisoned lock still holds a valid config (writers only ever assign a
    /// validated value), so we read through the poison.
    pub fn get_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        match self.config.write() {
            Ok(mut guard) => *guard = new_config,
            Err(poisoned) => *poisoned.into_inner() = new_config,
        }
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|metrics| metrics.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|metrics| metrics.error_count += 1);
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|metrics| {
            let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    /// Clone the request metrics so the lock isn't held while serialising.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = match self.metrics.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn with_metrics(&self, update: impl FnOnce(&mut AppMetrics)) {
        match self.metrics.write() {
            Ok(mut guard) => update(&mut guard),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
