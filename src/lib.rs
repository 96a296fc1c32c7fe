//! # frame-scheduler
//!
//! A priority-aware batch scheduler that ingests decoded video frames from
//! many concurrent camera streams and dispatches each frame to one of a
//! fixed pool of heterogeneous compute resources (CPU, GPU, and two
//! accelerator classes) for AI analysis.
//!
//! ## Architecture
//!
//! Producers submit frames into four bounded priority queues; a single
//! dispatch loop scans the queues in strict rank order and hands each task
//! to the lowest-scoring available processor:
//!
//! ```text
//! submit_frame → [Critical|High|Normal|Low] → dispatch loop → processor pool
//!                                                            → execution workers
//!                                                            → result sink
//! ```
//!
//! Admission is non-blocking: a full queue rejects the new frame rather
//! than evicting queued work. A periodic health monitor flips processors
//! in and out of `Overloaded` with hysteresis so status never flaps.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod algorithm;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod stream;

// Re-exports for convenience
pub use algorithm::{AlgorithmError, AlgorithmExecutor, AlgorithmRegistry, StubDetector};
pub use config::SchedulerConfig;
pub use processor::{ProcessorStatus, ResourceKind};
pub use queue::PriorityClass;
pub use scheduler::FrameScheduler;
pub use stream::StreamConfig;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), SchedulerError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| SchedulerError::Config(format!("tracing init failed: {e}")))
}

/// Errors surfaced by the scheduler's public operations.
///
/// All variants are synchronous and recoverable by the caller; nothing in
/// this taxonomy terminates the scheduler. Backpressure (a dropped frame)
/// is not an error — `submit_frame` reports it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// `add_stream` was called with an id that is already registered.
    #[error("stream already registered: {0}")]
    DuplicateStream(StreamId),

    /// The registry already holds the configured maximum number of streams.
    #[error("stream capacity exceeded: {0} streams registered")]
    CapacityExceeded(usize),

    /// `submit_frame` named a stream that is not registered.
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    /// A lookup (stream, processor) found no matching entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so misconfiguration surfaces before
    /// the first frame is ever submitted.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Unique camera-stream identifier.
///
/// Stream ids are caller-assigned opaque strings (typically the camera's
/// deployment name) and must be unique across the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(
    /// The raw string id.
    pub String,
);

impl StreamId {
    /// Create a new [`StreamId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the stream id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One detection produced by an algorithm executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Name of the algorithm that produced the detection.
    pub algorithm: String,
    /// Detected class label (e.g. `"fall"`, `"smoke"`).
    pub label: String,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    /// Optional normalized bounding box `[x, y, w, h]`.
    pub bbox: Option<[f32; 4]>,
}

/// Completed analysis for one frame, forwarded to the result sink.
///
/// Only emitted when at least one requested algorithm produced a
/// detection; frames whose algorithms all return nothing are absorbed
/// silently.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutput {
    /// Stream the frame belongs to.
    pub stream_id: StreamId,
    /// Capture timestamp of the analysed frame (seconds).
    pub timestamp: f64,
    /// Frame sequence number within the stream.
    pub sequence: u64,
    /// Non-empty set of detections.
    pub results: Vec<DetectionResult>,
}
