//! Metrics and observability for graph builds and frames

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters shared by a graph and the jobs it submits
pub struct GraphMetrics {
    pub builds: AtomicU64,
    pub failed_builds: AtomicU64,
    pub frames: AtomicU64,
    pub failed_frames: AtomicU64,
    pub total_frame_ms: AtomicU64,

    // Per-node counters
    pub nodes_executed: AtomicU64,
    pub node_failures: AtomicU64,
    pub sources_loaded: AtomicU64,
    pub sources_rejected: AtomicU64,
    pub sink_writes: AtomicU64,
}

impl GraphMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_build(&self, success: bool) {
        self.builds.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_builds.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_frame(&self, success: bool, latency_ms: u64) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.total_frame_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_node(&self, success: bool) {
        if success {
            self.nodes_executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.node_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_source(&self, accepted: bool) {
        if accepted {
            self.sources_loaded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sources_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sink(&self) {
        self.sink_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let frames = self.frames.load(Ordering::Relaxed);
        let failed_frames = self.failed_frames.load(Ordering::Relaxed);
        let total_ms = self.total_frame_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            builds: self.builds.load(Ordering::Relaxed),
            failed_builds: self.failed_builds.load(Ordering::Relaxed),
            frames,
            failed_frames,
            error_rate: if frames > 0 { failed_frames as f64 / frames as f64 } else { 0.0 },
            avg_frame_ms: if frames > 0 { total_ms / frames } else { 0 },
            nodes: NodeMetrics {
                executed: self.nodes_executed.load(Ordering::Relaxed),
                failed: self.node_failures.load(Ordering::Relaxed),
                sources_loaded: self.sources_loaded.load(Ordering::Relaxed),
                sources_rejected: self.sources_rejected.load(Ordering::Relaxed),
                sink_writes: self.sink_writes.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for GraphMetrics {
    fn default() -> Self {
        Self {
            builds: AtomicU64::new(0),
            failed_builds: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            failed_frames: AtomicU64::new(0),
            total_frame_ms: AtomicU64::new(0),
            nodes_executed: AtomicU64::new(0),
            node_failures: AtomicU64::new(0),
            sources_loaded: AtomicU64::new(0),
            sources_rejected: AtomicU64::new(0),
            sink_writes: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub builds: u64,
    pub failed_builds: u64,
    pub frames: u64,
    pub failed_frames: u64,
    pub error_rate: f64,
    pub avg_frame_ms: u64,
    pub nodes: NodeMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub executed: u64,
    pub failed: u64,
    pub sources_loaded: u64,
    pub sources_rejected: u64,
    pub sink_writes: u64,
}

/// Timer for tracking build and frame latency
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
