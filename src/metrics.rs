//! Metrics and observability for soma_encoder

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const OP_PROBE: &str = "media.probe";
pub const OP_KEYFRAMES: &str = "media.keyframes";
pub const OP_AUDIO_IMAGE: &str = "image.audio";
pub const OP_VIDEO_IMAGE: &str = "image.video";
pub const OP_INTERVAL_IMAGES: &str = "image.interval";

/// Global metrics collector
#[derive(Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub cancelled_requests: AtomicU64,
    pub total_latency_ms: AtomicU64,

    // Per-operation counters
    pub probe_count: AtomicU64,
    pub keyframes_count: AtomicU64,
    pub audio_image_count: AtomicU64,
    pub video_image_count: AtomicU64,
    pub interval_images_count: AtomicU64,
}

/// How a finished request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, op: &str, outcome: Outcome, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Outcome::Success => self.successful_requests.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => self.failed_requests.fetch_add(1, Ordering::Relaxed),
            Outcome::Cancelled => self.cancelled_requests.fetch_add(1, Ordering::Relaxed),
        };

        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        match op {
            OP_PROBE => self.probe_count.fetch_add(1, Ordering::Relaxed),
            OP_KEYFRAMES => self.keyframes_count.fetch_add(1, Ordering::Relaxed),
            OP_AUDIO_IMAGE => self.audio_image_count.fetch_add(1, Ordering::Relaxed),
            OP_VIDEO_IMAGE => self.video_image_count.fetch_add(1, Ordering::Relaxed),
            OP_INTERVAL_IMAGES => self.interval_images_count.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let cancelled = self.cancelled_requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            cancelled_requests: cancelled,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            operations: OperationMetrics {
                probe: self.probe_count.load(Ordering::Relaxed),
                keyframes: self.keyframes_count.load(Ordering::Relaxed),
                audio_image: self.audio_image_count.load(Ordering::Relaxed),
                video_image: self.video_image_count.load(Ordering::Relaxed),
                interval_images: self.interval_images_count.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub operations: OperationMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub probe: u64,
    pub keyframes: u64,
    pub audio_image: u64,
    pub video_image: u64,
    pub interval_images: u64,
}

/// Timer for tracking operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
