//! Demo binary for frame-scheduler.
//!
//! Builds a scheduler from an optional TOML config path (first CLI
//! argument), registers stub detectors and a few streams, pushes
//! synthetic frames at them, and prints the final statistics.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use frame_scheduler::{
    init_tracing, metrics, AlgorithmRegistry, FrameScheduler, PriorityClass, SchedulerConfig,
    StreamConfig, StubDetector,
};
use frame_scheduler::StreamId;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match std::env::args().nth(1) {
        Some(path) => SchedulerConfig::from_toml_path(std::path::Path::new(&path))?,
        None => SchedulerConfig::default(),
    };

    info!(
        processors = config.processors.len(),
        capacity = config.total_capacity(),
        "starting frame-scheduler demo"
    );

    // Stub detectors standing in for the real analyzers.
    let registry = AlgorithmRegistry::new();
    registry.register_for_all("fall", Arc::new(StubDetector::with_delay("fall", 15)));
    registry.register_for_all("fire", Arc::new(StubDetector::with_delay("fire", 10)));
    registry.register_for_all("smoke", Arc::new(StubDetector::with_delay("smoke", 10)));

    let (result_tx, mut result_rx) = tokio::sync::mpsc::channel(256);
    let scheduler = Arc::new(FrameScheduler::new(config, registry, result_tx)?);
    scheduler.start();

    // A small fleet of demo streams across the priority classes.
    let demo_streams = [
        ("icu-corridor", PriorityClass::Critical, vec!["fall", "fire"]),
        ("ward-3", PriorityClass::High, vec!["fall"]),
        ("lobby", PriorityClass::Normal, vec!["fire", "smoke"]),
        ("parking", PriorityClass::Low, vec!["smoke"]),
    ];
    for (name, priority, algorithms) in &demo_streams {
        scheduler.add_stream(StreamConfig {
            stream_id: StreamId::new(*name),
            source: format!("rtsp://demo/{name}"),
            priority: *priority,
            target_fps: 15,
            target_resolution: (1280, 720),
            algorithms: algorithms.iter().map(|a| (*a).to_string()).collect(),
            region: (*name).to_string(),
        })?;
    }

    // Drain the result sink concurrently.
    let consumer = tokio::spawn(async move {
        let mut received = 0usize;
        while let Some(output) = result_rx.recv().await {
            received += 1;
            tracing::debug!(
                stream_id = %output.stream_id,
                sequence = output.sequence,
                detections = output.results.len(),
                "analysis output"
            );
        }
        received
    });

    // Synthetic producers: ~2 seconds of frames per stream.
    let started = Instant::now();
    let mut producers = Vec::new();
    for (name, _, _) in &demo_streams {
        let scheduler = Arc::clone(&scheduler);
        let id = StreamId::new(*name);
        producers.push(tokio::spawn(async move {
            let mut dropped = 0u64;
            for seq in 0..30u64 {
                let timestamp = started.elapsed().as_secs_f64();
                let frame = Bytes::from(vec![0u8; 1024]);
                match scheduler.submit_frame(&id, frame, timestamp, seq) {
                    Ok(true) => {}
                    Ok(false) => dropped += 1,
                    Err(e) => {
                        tracing::error!(error = %e, "submit failed");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(66)).await;
            }
            dropped
        }));
    }

    let mut total_dropped = 0u64;
    for producer in producers {
        total_dropped += producer.await.unwrap_or(0);
    }
    info!(dropped = total_dropped, "all producers finished");

    // Let in-flight work settle, then shut down.
    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.stop().await;

    let stats = scheduler.stats();
    info!(
        frames_processed = stats.global.frames_processed,
        overflows = stats.global.queue_overflows,
        retry_exceeded = stats.global.retry_exceeded,
        throughput_fps = format!("{:.1}", stats.global.throughput_fps),
        avg_latency_ms = format!("{:.1}", stats.global.avg_latency_ms),
        "final statistics"
    );

    // Dropping the last scheduler handle closes the result sink, which
    // ends the consumer.
    drop(scheduler);
    let received = consumer.await.unwrap_or(0);

    info!(results = received, "demo complete");
    println!("{}", metrics::gather_metrics());

    Ok(())
}
