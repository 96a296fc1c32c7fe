//! Global statistics and the aggregated read-only snapshot.
//!
//! Counters are atomics; the smoothed latency sits behind its own lock.
//! Everything here is mutated only by admission, dispatch, and the
//! execution workers — snapshot readers never block writers for long.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::processor::{ProcessorMetricsSnapshot, ProcessorStatus, ResourceKind};
use crate::queue::PriorityClass;

/// Process-lifetime accumulating counters.
pub struct GlobalStats {
    frames_processed: AtomicU64,
    total_processing_us: AtomicU64,
    overflows: AtomicU64,
    retry_exceeded: AtomicU64,
    errors: AtomicU64,
    avg_latency_ms: Mutex<f64>,
    started_at: Instant,
}

impl GlobalStats {
    /// Fresh zeroed counters; throughput derives from this instant.
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            total_processing_us: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            retry_exceeded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            avg_latency_ms: Mutex::new(0.0),
            started_at: Instant::now(),
        }
    }

    /// Count one frame rejected by a full queue.
    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one task dropped after exhausting its dispatch retries.
    pub fn record_retry_exceeded(&self) {
        self.retry_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one completed task into the global counters.
    pub fn record_completion(&self, duration: Duration, errors: u64, ema_alpha: f64) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if errors > 0 {
            self.errors.fetch_add(errors, Ordering::Relaxed);
        }
        let mut avg = self.avg_latency_ms.lock();
        let sample = duration.as_secs_f64() * 1000.0;
        *avg = if *avg == 0.0 {
            sample
        } else {
            *avg * (1.0 - ema_alpha) + sample * ema_alpha
        };
    }

    /// Current overflow count.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Current retry-exceeded count.
    pub fn retry_exceeded(&self) -> u64 {
        self.retry_exceeded.load(Ordering::Relaxed)
    }

    /// Frames fully processed so far.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot with derived throughput.
    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        GlobalStatsSnapshot {
            frames_processed: frames,
            total_processing_ms: self.total_processing_us.load(Ordering::Relaxed) / 1000,
            queue_overflows: self.overflows(),
            retry_exceeded: self.retry_exceeded(),
            errors: self.errors.load(Ordering::Relaxed),
            avg_latency_ms: *self.avg_latency_ms.lock(),
            throughput_fps: if elapsed > 0.0 {
                frames as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only snapshot of the global counters.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatsSnapshot {
    /// Total frames fully processed.
    pub frames_processed: u64,
    /// Cumulative task processing time (ms).
    pub total_processing_ms: u64,
    /// Frames rejected by a full queue.
    pub queue_overflows: u64,
    /// Tasks dropped after exhausting dispatch retries. Distinct from
    /// `queue_overflows`: these were admitted but never found a
    /// processor.
    pub retry_exceeded: u64,
    /// Per-algorithm execution errors across all streams.
    pub errors: u64,
    /// Smoothed end-to-end task latency (ms).
    pub avg_latency_ms: f64,
    /// Frames per second since scheduler construction; recomputed on
    /// every snapshot, never accumulated.
    pub throughput_fps: f64,
}

/// Pool-wide processor aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorAggregate {
    /// Unit count per hardware kind.
    pub by_kind: HashMap<ResourceKind, usize>,
    /// Unit count per status.
    pub by_status: HashMap<ProcessorStatus, usize>,
    /// Mean load fraction across the pool.
    pub avg_load: f64,
    /// Per-unit snapshots, in configuration order.
    pub units: Vec<ProcessorMetricsSnapshot>,
}

impl ProcessorAggregate {
    /// Aggregate a set of per-unit snapshots.
    pub fn from_units(units: Vec<ProcessorMetricsSnapshot>) -> Self {
        let mut by_kind: HashMap<ResourceKind, usize> = HashMap::new();
        let mut by_status: HashMap<ProcessorStatus, usize> = HashMap::new();
        let mut load_sum = 0.0;
        for unit in &units {
            *by_kind.entry(unit.kind).or_insert(0) += 1;
            *by_status.entry(unit.status).or_insert(0) += 1;
            load_sum += unit.load;
        }
        let avg_load = if units.is_empty() {
            0.0
        } else {
            load_sum / units.len() as f64
        };
        Self {
            by_kind,
            by_status,
            avg_load,
            units,
        }
    }
}

/// Per-priority-class stream aggregation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamClassAggregate {
    /// Registered streams in this class.
    pub streams: usize,
    /// Summed instantaneous fps across those streams.
    pub fps_sum: f64,
}

/// The full read-only view exposed by `FrameScheduler::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Global counters.
    pub global: GlobalStatsSnapshot,
    /// Processor-pool aggregation.
    pub processors: ProcessorAggregate,
    /// Stream counts and fps per priority class.
    pub streams: HashMap<PriorityClass, StreamClassAggregate>,
    /// Depth of each priority queue, in rank order
    /// (Critical, High, Normal, Low).
    pub queue_depths: [usize; 4],
}
