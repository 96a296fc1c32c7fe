//! Stream registry: admission control and per-stream metrics.
//!
//! The registry is the unit of admission control — `submit_frame` only
//! accepts frames for streams registered here, and the registered count
//! is capped. Each stream carries its own metrics record behind its own
//! lock; completions for different streams never contend.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::queue::PriorityClass;
use crate::{SchedulerError, StreamId};

/// Registration record for one camera stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Unique stream id.
    pub stream_id: StreamId,
    /// Opaque source locator (RTSP URL, device path, …). The scheduler
    /// never interprets it.
    pub source: String,
    /// Priority class applied to future submissions.
    pub priority: PriorityClass,
    /// Target frame rate the producer aims for.
    pub target_fps: u32,
    /// Target resolution `(width, height)`.
    pub target_resolution: (u32, u32),
    /// Algorithm names to run on each frame.
    pub algorithms: Vec<String>,
    /// Human-readable region label (e.g. `"ward-3-corridor"`).
    pub region: String,
}

/// Mutable per-stream metrics state.
#[derive(Debug, Default)]
struct MetricsState {
    frames_processed: u64,
    errors: u64,
    avg_latency_ms: f64,
    fps: f64,
    last_completion: Option<Instant>,
    last_frame_at: Option<SystemTime>,
}

/// Read-only snapshot of one stream's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMetricsSnapshot {
    /// Frames fully processed for this stream.
    pub frames_processed: u64,
    /// Per-algorithm processing errors attributed to this stream.
    pub errors: u64,
    /// Smoothed average end-of-processing latency (ms).
    pub avg_latency_ms: f64,
    /// Instantaneous throughput estimate from inter-completion intervals.
    pub fps: f64,
    /// Wall-clock time of the most recent completed frame.
    pub last_frame_at: Option<SystemTime>,
}

struct StreamEntry {
    config: RwLock<StreamConfig>,
    metrics: Mutex<MetricsState>,
}

/// What `submit_frame` needs to stamp onto a task at admission time.
pub struct AdmissionSnapshot {
    /// Stream's current priority class.
    pub priority: PriorityClass,
    /// Stream's current algorithm set.
    pub algorithms: Vec<String>,
}

/// Concurrent stream registry with a configured maximum.
pub struct StreamRegistry {
    streams: DashMap<StreamId, StreamEntry>,
    max_streams: usize,
    // Serializes add/remove so the max_streams check and the insert are
    // one step; metric updates never take this lock.
    admission: Mutex<()>,
}

impl StreamRegistry {
    /// Create an empty registry bounded to `max_streams` entries.
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: DashMap::new(),
            max_streams,
            admission: Mutex::new(()),
        }
    }

    /// Register a stream and a zeroed metrics record.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::CapacityExceeded`] when the registry is full,
    /// [`SchedulerError::DuplicateStream`] when the id is taken. Neither
    /// failure mutates any state.
    pub fn add(&self, config: StreamConfig) -> Result<(), SchedulerError> {
        let _guard = self.admission.lock();
        if self.streams.len() >= self.max_streams {
            return Err(SchedulerError::CapacityExceeded(self.streams.len()));
        }
        if self.streams.contains_key(&config.stream_id) {
            return Err(SchedulerError::DuplicateStream(config.stream_id));
        }
        let id = config.stream_id.clone();
        info!(
            stream_id = %id,
            priority = config.priority.as_str(),
            region = %config.region,
            "stream registered"
        );
        self.streams.insert(
            id,
            StreamEntry {
                config: RwLock::new(config),
                metrics: Mutex::new(MetricsState::default()),
            },
        );
        Ok(())
    }

    /// Delete a stream and its metrics.
    ///
    /// Already-queued tasks for the stream are not purged; they complete
    /// or drop normally. Callers must stop upstream frame production
    /// first.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn remove(&self, stream_id: &StreamId) -> Result<(), SchedulerError> {
        let _guard = self.admission.lock();
        match self.streams.remove(stream_id) {
            Some(_) => {
                info!(stream_id = %stream_id, "stream removed");
                Ok(())
            }
            None => Err(SchedulerError::NotFound(format!("stream {stream_id}"))),
        }
    }

    /// Change a stream's priority class for future submissions only.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn adjust_priority(
        &self,
        stream_id: &StreamId,
        priority: PriorityClass,
    ) -> Result<(), SchedulerError> {
        match self.streams.get(stream_id) {
            Some(entry) => {
                let previous = {
                    let mut config = entry.config.write();
                    std::mem::replace(&mut config.priority, priority)
                };
                info!(
                    stream_id = %stream_id,
                    from = previous.as_str(),
                    to = priority.as_str(),
                    "stream priority adjusted"
                );
                Ok(())
            }
            None => Err(SchedulerError::NotFound(format!("stream {stream_id}"))),
        }
    }

    /// Capture the admission-time view of a stream.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownStream`] when the id is absent.
    pub fn admission_snapshot(
        &self,
        stream_id: &StreamId,
    ) -> Result<AdmissionSnapshot, SchedulerError> {
        match self.streams.get(stream_id) {
            Some(entry) => {
                let config = entry.config.read();
                Ok(AdmissionSnapshot {
                    priority: config.priority,
                    algorithms: config.algorithms.clone(),
                })
            }
            None => Err(SchedulerError::UnknownStream(stream_id.clone())),
        }
    }

    /// Fold one completed task into the stream's metrics.
    ///
    /// Tolerates a missing stream (removed while its task was queued or
    /// in flight): the update is skipped.
    pub fn record_completion(
        &self,
        stream_id: &StreamId,
        latency: Duration,
        errors: u64,
        ema_alpha: f64,
    ) {
        let Some(entry) = self.streams.get(stream_id) else {
            debug!(stream_id = %stream_id, "completion for removed stream, metrics skipped");
            return;
        };
        let now = Instant::now();
        let mut m = entry.metrics.lock();
        m.frames_processed += 1;
        m.errors += errors;

        let latency_ms = latency.as_secs_f64() * 1000.0;
        m.avg_latency_ms = if m.avg_latency_ms == 0.0 {
            latency_ms
        } else {
            m.avg_latency_ms * (1.0 - ema_alpha) + latency_ms * ema_alpha
        };

        if let Some(last) = m.last_completion {
            let interval = now.duration_since(last).as_secs_f64();
            if interval > 0.0 {
                let instantaneous = 1.0 / interval;
                m.fps = if m.fps == 0.0 {
                    instantaneous
                } else {
                    m.fps * (1.0 - ema_alpha) + instantaneous * ema_alpha
                };
            }
        }
        m.last_completion = Some(now);
        m.last_frame_at = Some(SystemTime::now());
    }

    /// Snapshot one stream's metrics.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn metrics(&self, stream_id: &StreamId) -> Result<StreamMetricsSnapshot, SchedulerError> {
        match self.streams.get(stream_id) {
            Some(entry) => {
                let m = entry.metrics.lock();
                Ok(StreamMetricsSnapshot {
                    frames_processed: m.frames_processed,
                    errors: m.errors,
                    avg_latency_ms: m.avg_latency_ms,
                    fps: m.fps,
                    last_frame_at: m.last_frame_at,
                })
            }
            None => Err(SchedulerError::NotFound(format!("stream {stream_id}"))),
        }
    }

    /// Registered-stream count.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when no streams are registered.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Per-class stream count and summed fps, for the stats snapshot.
    pub fn class_summary(&self) -> HashMap<PriorityClass, (usize, f64)> {
        let mut summary: HashMap<PriorityClass, (usize, f64)> = HashMap::new();
        for entry in self.streams.iter() {
            let class = entry.config.read().priority;
            let fps = entry.metrics.lock().fps;
            let slot = summary.entry(class).or_insert((0, 0.0));
            slot.0 += 1;
            slot.1 += fps;
        }
        summary
    }
}
