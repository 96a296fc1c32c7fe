//! Scheduler integration tests — dispatch behaviour over the public API.
//!
//! These exercise the properties that only emerge with the dispatch loop
//! and execution workers running: strict priority ordering, processor
//! scoring, the concurrency ceiling, the retry ceiling, and timeout
//! cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use frame_scheduler::config::ProcessorConfig;
use frame_scheduler::{
    AlgorithmError, AlgorithmExecutor, AlgorithmRegistry, AnalysisOutput, DetectionResult,
    FrameScheduler, PriorityClass, ResourceKind, SchedulerConfig, StreamConfig, StubDetector,
};
use frame_scheduler::StreamId;

// ── Helpers ──────────────────────────────────────────────────────────

fn cpu_pool(units: &[(&str, u32)]) -> Vec<ProcessorConfig> {
    units
        .iter()
        .map(|(id, max)| ProcessorConfig {
            id: (*id).to_string(),
            kind: ResourceKind::Cpu,
            max_concurrent: *max,
        })
        .collect()
}

fn make_stream(id: &str, priority: PriorityClass, algorithms: &[&str]) -> StreamConfig {
    StreamConfig {
        stream_id: StreamId::new(id),
        source: format!("rtsp://test/{id}"),
        priority,
        target_fps: 15,
        target_resolution: (640, 480),
        algorithms: algorithms.iter().map(|a| (*a).to_string()).collect(),
        region: "test".to_string(),
    }
}

fn frame() -> Bytes {
    Bytes::from_static(b"synthetic-frame")
}

async fn recv_output(rx: &mut mpsc::Receiver<AnalysisOutput>) -> AnalysisOutput {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for analysis output")
        .expect("result channel closed unexpectedly")
}

/// Executor that tracks peak concurrent executions.
struct GaugeDetector {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl AlgorithmExecutor for GaugeDetector {
    async fn execute(
        &self,
        _frame: &Bytes,
        _timestamp: f64,
        sequence: u64,
    ) -> Result<Option<DetectionResult>, AlgorithmError> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::AcqRel);
        Ok(Some(DetectionResult {
            algorithm: "gauge".to_string(),
            label: format!("seq-{sequence}"),
            confidence: 1.0,
            bbox: None,
        }))
    }
}

// ── Strict priority ──────────────────────────────────────────────────

#[tokio::test]
async fn test_critical_dispatches_before_normal_on_single_slot() {
    let mut config = SchedulerConfig::default();
    config.processors = cpu_pool(&[("cpu-0", 1)]);

    let registry = AlgorithmRegistry::new();
    registry.register_for_all("tag", Arc::new(StubDetector::with_delay("tag", 20)));

    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("normal-cam", PriorityClass::Normal, &["tag"]))
        .expect("add");
    scheduler
        .add_stream(make_stream("critical-cam", PriorityClass::Critical, &["tag"]))
        .expect("add");

    // Enqueue the Normal frame first so only priority, not arrival
    // order, can explain the result.
    let accepted = scheduler
        .submit_frame(&StreamId::new("normal-cam"), frame(), 1.0, 1)
        .expect("submit");
    assert!(accepted);
    let accepted = scheduler
        .submit_frame(&StreamId::new("critical-cam"), frame(), 1.0, 1)
        .expect("submit");
    assert!(accepted);

    scheduler.start();

    let first = recv_output(&mut rx).await;
    let second = recv_output(&mut rx).await;
    assert_eq!(first.stream_id, StreamId::new("critical-cam"));
    assert_eq!(second.stream_id, StreamId::new("normal-cam"));

    scheduler.stop().await;
}

// ── Scoring preference ───────────────────────────────────────────────

#[tokio::test]
async fn test_idle_accelerator_selected_over_idle_cpu() {
    let mut config = SchedulerConfig::default();
    config.processors = vec![
        ProcessorConfig {
            id: "cpu-0".to_string(),
            kind: ResourceKind::Cpu,
            max_concurrent: 4,
        },
        ProcessorConfig {
            id: "npu-0".to_string(),
            kind: ResourceKind::Npu,
            max_concurrent: 4,
        },
    ];

    let registry = AlgorithmRegistry::new();
    registry.register_for_all("tag", Arc::new(StubDetector::new("tag")));

    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("cam", PriorityClass::Normal, &["tag"]))
        .expect("add");
    scheduler.start();

    scheduler
        .submit_frame(&StreamId::new("cam"), frame(), 1.0, 1)
        .expect("submit");
    let _ = recv_output(&mut rx).await;

    let npu = scheduler.processor_metrics("npu-0").expect("npu metrics");
    let cpu = scheduler.processor_metrics("cpu-0").expect("cpu metrics");
    assert_eq!(npu.processed, 1, "accelerator must win the idle tie");
    assert_eq!(cpu.processed, 0);

    scheduler.stop().await;
}

// ── Concurrency ceiling & end-to-end ─────────────────────────────────

#[tokio::test]
async fn test_five_frames_on_four_slots_defer_the_fifth() {
    let mut config = SchedulerConfig::default();
    config.processors = cpu_pool(&[("cpu-0", 2), ("cpu-1", 2)]);

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let registry = AlgorithmRegistry::new();
    registry.register_for_all(
        "gauge",
        Arc::new(GaugeDetector {
            active: Arc::clone(&active),
            peak: Arc::clone(&peak),
            delay: Duration::from_millis(150),
        }),
    );

    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("cam", PriorityClass::Normal, &["gauge"]))
        .expect("add");
    scheduler.start();

    for seq in 1..=5u64 {
        let accepted = scheduler
            .submit_frame(&StreamId::new("cam"), frame(), seq as f64, seq)
            .expect("submit");
        assert!(accepted, "frame {seq} must be admitted");
    }

    for _ in 0..5 {
        let _ = recv_output(&mut rx).await;
    }

    assert_eq!(
        peak.load(Ordering::Acquire),
        4,
        "exactly four frames may run concurrently on total capacity 4"
    );
    let stats = scheduler.stats();
    assert_eq!(stats.global.frames_processed, 5);
    assert_eq!(stats.global.queue_overflows, 0);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_processor_never_exceeds_its_own_ceiling() {
    let mut config = SchedulerConfig::default();
    config.processors = cpu_pool(&[("cpu-0", 2)]);

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let registry = AlgorithmRegistry::new();
    registry.register_for_all(
        "gauge",
        Arc::new(GaugeDetector {
            active: Arc::clone(&active),
            peak: Arc::clone(&peak),
            delay: Duration::from_millis(30),
        }),
    );

    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("cam", PriorityClass::Normal, &["gauge"]))
        .expect("add");
    scheduler.start();

    for seq in 1..=10u64 {
        scheduler
            .submit_frame(&StreamId::new("cam"), frame(), seq as f64, seq)
            .expect("submit");
    }
    for _ in 0..10 {
        let _ = recv_output(&mut rx).await;
    }

    assert!(
        peak.load(Ordering::Acquire) <= 2,
        "ceiling 2 was exceeded: {}",
        peak.load(Ordering::Acquire)
    );

    scheduler.stop().await;
}

// ── Retry ceiling ────────────────────────────────────────────────────

#[tokio::test]
async fn test_task_dropped_after_three_failed_dispatch_attempts() {
    let mut config = SchedulerConfig::default();
    config.processors = cpu_pool(&[("cpu-0", 1)]);

    let registry = AlgorithmRegistry::new();
    registry.register_for_all("tag", Arc::new(StubDetector::new("tag")));

    let (tx, _rx) = mpsc::channel(16);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("cam", PriorityClass::Normal, &["tag"]))
        .expect("add");

    // Fault the only processor so no dispatch attempt can succeed.
    scheduler.mark_processor_error("cpu-0").expect("mark");
    scheduler
        .submit_frame(&StreamId::new("cam"), frame(), 1.0, 1)
        .expect("submit");
    scheduler.start();

    // Three attempts: two fire back-to-back off the admission signal,
    // the third after the no-capacity backoff.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let stats = scheduler.stats();
    assert_eq!(stats.global.retry_exceeded, 1, "task must be dropped once");
    assert_eq!(stats.global.frames_processed, 0);
    assert_eq!(
        stats.global.queue_overflows, 0,
        "retry-exceeded must not count as overflow"
    );
    assert_eq!(stats.queue_depths, [0, 0, 0, 0], "no infinite requeue");

    scheduler.stop().await;
}

#[tokio::test]
async fn test_cleared_fault_resumes_dispatch() {
    let mut config = SchedulerConfig::default();
    config.processors = cpu_pool(&[("cpu-0", 1)]);

    let registry = AlgorithmRegistry::new();
    registry.register_for_all("tag", Arc::new(StubDetector::new("tag")));

    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("cam", PriorityClass::Normal, &["tag"]))
        .expect("add");
    scheduler.mark_processor_error("cpu-0").expect("mark");
    scheduler.start();
    scheduler.clear_processor_error("cpu-0").expect("clear");

    scheduler
        .submit_frame(&StreamId::new("cam"), frame(), 1.0, 1)
        .expect("submit");
    let output = recv_output(&mut rx).await;
    assert_eq!(output.sequence, 1);

    scheduler.stop().await;
}

// ── Timeout cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn test_stuck_algorithm_is_cancelled_and_counted() {
    let mut config = SchedulerConfig::default();
    config.processors = cpu_pool(&[("cpu-0", 1)]);
    config.timeouts.processing_timeout_ms = 50;

    let registry = AlgorithmRegistry::new();
    registry.register_for_all("stuck", Arc::new(StubDetector::with_delay("stuck", 5000)));

    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("cam", PriorityClass::Normal, &["stuck"]))
        .expect("add");
    scheduler.start();

    scheduler
        .submit_frame(&StreamId::new("cam"), frame(), 1.0, 1)
        .expect("submit");

    // The timeout fires at 50ms; the task completes with an error and
    // produces no output.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = scheduler.stats();
    assert_eq!(stats.global.frames_processed, 1);
    assert_eq!(stats.global.errors, 1);
    let m = scheduler
        .stream_metrics(&StreamId::new("cam"))
        .expect("metrics");
    assert_eq!(m.errors, 1);
    assert!(
        rx.try_recv().is_err(),
        "a fully timed-out task must forward nothing"
    );

    // The slot was freed well before the stub's 5s sleep.
    let cpu = scheduler.processor_metrics("cpu-0").expect("metrics");
    assert_eq!(cpu.current_tasks, 0);

    scheduler.stop().await;
}

// ── Shutdown ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_drains_in_flight_tasks() {
    let mut config = SchedulerConfig::default();
    config.processors = cpu_pool(&[("cpu-0", 2)]);

    let registry = AlgorithmRegistry::new();
    registry.register_for_all("tag", Arc::new(StubDetector::with_delay("tag", 100)));

    let (tx, _rx) = mpsc::channel(16);
    let scheduler = FrameScheduler::new(config, registry, tx).expect("scheduler");
    scheduler
        .add_stream(make_stream("cam", PriorityClass::Normal, &["tag"]))
        .expect("add");
    scheduler.start();

    scheduler
        .submit_frame(&StreamId::new("cam"), frame(), 1.0, 1)
        .expect("submit");
    scheduler
        .submit_frame(&StreamId::new("cam"), frame(), 2.0, 2)
        .expect("submit");

    // Give the dispatch loop a moment to hand both tasks to workers.
    tokio::time::sleep(Duration::from_millis(30)).await;
    scheduler.stop().await;

    let cpu = scheduler.processor_metrics("cpu-0").expect("metrics");
    assert_eq!(cpu.current_tasks, 0, "stop must wait for in-flight tasks");
    assert_eq!(scheduler.stats().global.frames_processed, 2);
}
