//! The scheduler facade: construction, lifecycle, and every public
//! operation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::algorithm::AlgorithmRegistry;
use crate::config::SchedulerConfig;
use crate::dispatch::run_dispatch_loop;
use crate::metrics;
use crate::monitor::run_monitor;
use crate::processor::{ProcessorMetricsSnapshot, ProcessorPool};
use crate::queue::{PriorityClass, ProcessingTask, QueueBank};
use crate::stats::{GlobalStats, ProcessorAggregate, StatsSnapshot, StreamClassAggregate};
use crate::stream::{StreamConfig, StreamMetricsSnapshot, StreamRegistry};
use crate::{AnalysisOutput, SchedulerError, StreamId};

/// State shared between the facade, the dispatch loop, the monitor, and
/// every execution worker.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) streams: StreamRegistry,
    pub(crate) queues: QueueBank,
    pub(crate) pool: ProcessorPool,
    pub(crate) algorithms: AlgorithmRegistry,
    pub(crate) stats: GlobalStats,
    pub(crate) queue_signal: Notify,
    pub(crate) result_tx: mpsc::Sender<AnalysisOutput>,
}

struct LoopHandles {
    dispatch: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

/// The multi-stream batch scheduler.
///
/// Owns the stream registry, the four priority queues, the fixed
/// processor pool, and all statistics. `submit_frame` may be called from
/// any number of producer tasks/threads concurrently; a single internal
/// dispatch loop preserves strict priority ordering.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use frame_scheduler::{
///     AlgorithmRegistry, FrameScheduler, SchedulerConfig, StubDetector,
/// };
///
/// # async fn example() -> Result<(), frame_scheduler::SchedulerError> {
/// let registry = AlgorithmRegistry::new();
/// registry.register_for_all("fall", Arc::new(StubDetector::new("fall")));
///
/// let (result_tx, _result_rx) = tokio::sync::mpsc::channel(256);
/// let scheduler = FrameScheduler::new(SchedulerConfig::default(), registry, result_tx)?;
/// scheduler.start();
/// // … register streams, submit frames …
/// scheduler.stop().await;
/// # Ok(()) }
/// ```
pub struct FrameScheduler {
    inner: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Option<LoopHandles>>,
}

impl FrameScheduler {
    /// Build a scheduler from validated configuration, a populated
    /// algorithm registry, and a result sink.
    ///
    /// All state is in-memory and rebuilt from `config`; nothing is
    /// persisted across instances.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if `config` fails validation.
    pub fn new(
        config: SchedulerConfig,
        algorithms: AlgorithmRegistry,
        result_tx: mpsc::Sender<AnalysisOutput>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Shared {
            streams: StreamRegistry::new(config.max_streams),
            queues: QueueBank::new(config.queue_capacity),
            pool: ProcessorPool::new(&config.processors),
            algorithms,
            stats: GlobalStats::new(),
            queue_signal: Notify::new(),
            result_tx,
            config,
        });
        Ok(Self {
            inner,
            shutdown,
            handles: Mutex::new(None),
        })
    }

    /// Spawn the dispatch loop and the health monitor.
    ///
    /// Idempotent: calling `start` on a running scheduler is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if handles.is_some() {
            return;
        }
        let _ = self.shutdown.send(false);
        let dispatch = tokio::spawn(run_dispatch_loop(
            Arc::clone(&self.inner),
            self.shutdown.subscribe(),
        ));
        let monitor = tokio::spawn(run_monitor(
            Arc::clone(&self.inner),
            self.shutdown.subscribe(),
        ));
        *handles = Some(LoopHandles { dispatch, monitor });
        info!(
            processors = self.inner.pool.units().len(),
            capacity = self.inner.pool.total_capacity(),
            "scheduler started"
        );
    }

    /// Stop the scheduler, letting in-flight tasks drain within the
    /// configured bound.
    ///
    /// The dispatch loop and monitor exit first; execution workers then
    /// get up to `drain_timeout_ms` to finish. Stragglers are abandoned
    /// with a warning — they still run to completion on the runtime, but
    /// the scheduler no longer waits for them. Queued-but-undispatched
    /// tasks are discarded with the queues.
    pub async fn stop(&self) {
        let handles = self.handles.lock().take();
        let Some(h) = handles else {
            return;
        };
        let _ = self.shutdown.send(true);
        self.inner.queue_signal.notify_waiters();
        let _ = h.dispatch.await;
        let _ = h.monitor.await;

        let deadline =
            Instant::now() + Duration::from_millis(self.inner.config.timeouts.drain_timeout_ms);
        while self.inner.pool.total_in_flight() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.inner.pool.total_in_flight(),
                    "drain timeout, abandoning in-flight tasks"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("scheduler stopped");
    }

    /// Register a stream.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::CapacityExceeded`] or
    /// [`SchedulerError::DuplicateStream`]; no side effects on failure.
    pub fn add_stream(&self, config: StreamConfig) -> Result<(), SchedulerError> {
        self.inner.streams.add(config)
    }

    /// Remove a stream and its metrics. Already-queued frames for the
    /// stream complete or drop normally; stop the upstream producer
    /// first.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn remove_stream(&self, stream_id: &StreamId) -> Result<(), SchedulerError> {
        self.inner.streams.remove(stream_id)
    }

    /// Change a stream's priority class for future submissions only;
    /// already-queued tasks keep the class they were admitted with.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn adjust_stream_priority(
        &self,
        stream_id: &StreamId,
        priority: PriorityClass,
    ) -> Result<(), SchedulerError> {
        self.inner.streams.adjust_priority(stream_id, priority)
    }

    /// Submit one decoded frame for analysis.
    ///
    /// Non-blocking. Returns `Ok(true)` when the frame was admitted and
    /// `Ok(false)` when its class queue was full — the frame is dropped,
    /// the overflow counter incremented, and the caller must not retry
    /// synchronously (that is the backpressure contract).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownStream`] when the stream is not
    /// registered.
    pub fn submit_frame(
        &self,
        stream_id: &StreamId,
        frame: Bytes,
        timestamp: f64,
        sequence: u64,
    ) -> Result<bool, SchedulerError> {
        let admission = self.inner.streams.admission_snapshot(stream_id)?;
        let class = admission.priority;
        let task = ProcessingTask {
            stream_id: stream_id.clone(),
            frame,
            timestamp,
            sequence,
            priority: class,
            algorithms: admission.algorithms,
            retries: 0,
        };

        match self.inner.queues.try_push(task) {
            Ok(()) => {
                metrics::inc_submitted(class.as_str());
                self.inner.queue_signal.notify_one();
                Ok(true)
            }
            Err(_) => {
                self.inner.stats.record_overflow();
                metrics::inc_dropped("queue_full");
                warn!(
                    stream_id = %stream_id,
                    class = class.as_str(),
                    sequence,
                    "queue full, frame dropped"
                );
                Ok(false)
            }
        }
    }

    /// Read-only snapshot of global, processor, stream, and queue state.
    pub fn stats(&self) -> StatsSnapshot {
        let units: Vec<_> = self
            .inner
            .pool
            .units()
            .iter()
            .map(|u| u.snapshot())
            .collect();
        let streams = self
            .inner
            .streams
            .class_summary()
            .into_iter()
            .map(|(class, (count, fps_sum))| {
                (
                    class,
                    StreamClassAggregate {
                        streams: count,
                        fps_sum,
                    },
                )
            })
            .collect();
        StatsSnapshot {
            global: self.inner.stats.snapshot(),
            processors: ProcessorAggregate::from_units(units),
            streams,
            queue_depths: self.inner.queues.depths(),
        }
    }

    /// Metrics for one stream.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn stream_metrics(
        &self,
        stream_id: &StreamId,
    ) -> Result<StreamMetricsSnapshot, SchedulerError> {
        self.inner.streams.metrics(stream_id)
    }

    /// Metrics for one processor.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn processor_metrics(&self, id: &str) -> Result<ProcessorMetricsSnapshot, SchedulerError> {
        self.inner
            .pool
            .get(id)
            .map(|u| u.snapshot())
            .ok_or_else(|| SchedulerError::NotFound(format!("processor {id}")))
    }

    /// Externally fault a processor: it takes no further dispatches
    /// until cleared. In-flight tasks on it run to completion.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn mark_processor_error(&self, id: &str) -> Result<(), SchedulerError> {
        match self.inner.pool.get(id) {
            Some(unit) => {
                unit.mark_error();
                warn!(processor = %id, "processor marked faulted");
                Ok(())
            }
            None => Err(SchedulerError::NotFound(format!("processor {id}"))),
        }
    }

    /// Clear an external fault; the unit rejoins dispatch immediately.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the id is absent.
    pub fn clear_processor_error(&self, id: &str) -> Result<(), SchedulerError> {
        match self.inner.pool.get(id) {
            Some(unit) => {
                unit.clear_error();
                info!(processor = %id, "processor fault cleared");
                self.inner.queue_signal.notify_one();
                Ok(())
            }
            None => Err(SchedulerError::NotFound(format!("processor {id}"))),
        }
    }
}
