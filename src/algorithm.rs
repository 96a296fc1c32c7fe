//! Algorithm executor abstraction and registry.
//!
//! Detection algorithms are external collaborators: the scheduler only
//! knows the `(resource kind, algorithm name) → executor` capability
//! table and the one-method execution contract. Executors must be cheap
//! to share (`Arc`) and safe to call concurrently.
//!
//! The stub implementations at the bottom exist for tests and the demo
//! binary; production registries are populated by the embedding process
//! at startup.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::processor::ResourceKind;
use crate::DetectionResult;

/// Failure inside an algorithm executor.
///
/// Executors must never panic; any internal failure is reported here,
/// caught by the execution worker, and degrades that one algorithm's
/// contribution to the task — the task itself carries on.
#[derive(Error, Debug)]
pub enum AlgorithmError {
    /// The analysis could not be completed.
    #[error("analysis failed: {0}")]
    Failed(String),
}

/// One pluggable detection algorithm.
///
/// Implementations must be thread-safe (`Send + Sync`) and object-safe so
/// the registry can hold `Arc<dyn AlgorithmExecutor>`.
#[async_trait]
pub trait AlgorithmExecutor: Send + Sync {
    /// Analyse one frame.
    ///
    /// Returns `Ok(None)` when the algorithm ran but found nothing worth
    /// reporting. The frame buffer is borrowed and must not be mutated.
    ///
    /// # Errors
    ///
    /// Returns [`AlgorithmError`] for any internal failure; the caller
    /// treats it as "no result" for this algorithm.
    async fn execute(
        &self,
        frame: &Bytes,
        timestamp: f64,
        sequence: u64,
    ) -> Result<Option<DetectionResult>, AlgorithmError>;
}

/// Capability table: executors keyed by resource kind and algorithm name.
///
/// A given algorithm name may map to different executors per kind (e.g. a
/// quantized model on the NPU, a reference model on the CPU).
#[derive(Default)]
pub struct AlgorithmRegistry {
    table: DashMap<(ResourceKind, String), Arc<dyn AlgorithmExecutor>>,
}

impl AlgorithmRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for one resource kind under a name.
    /// Re-registering a key replaces the previous executor.
    pub fn register(
        &self,
        kind: ResourceKind,
        name: impl Into<String>,
        executor: Arc<dyn AlgorithmExecutor>,
    ) {
        self.table.insert((kind, name.into()), executor);
    }

    /// Register the same executor under a name for all four resource
    /// kinds. Convenience for tests and the demo binary.
    pub fn register_for_all(&self, name: &str, executor: Arc<dyn AlgorithmExecutor>) {
        for kind in [
            ResourceKind::Cpu,
            ResourceKind::Gpu,
            ResourceKind::Npu,
            ResourceKind::Vpu,
        ] {
            self.register(kind, name, Arc::clone(&executor));
        }
    }

    /// Look up the executor for `(kind, name)`.
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<Arc<dyn AlgorithmExecutor>> {
        self.table
            .get(&(kind, name.to_string()))
            .map(|e| Arc::clone(e.value()))
    }

    /// Number of registered `(kind, name)` entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

// ============================================================================
// Stub executors (tests / demo)
// ============================================================================

/// Deterministic stub detector: sleeps for a configured delay, then
/// reports a fixed label and confidence on every frame.
pub struct StubDetector {
    /// Algorithm name stamped onto each detection.
    pub algorithm: String,
    /// Label reported on every frame.
    pub label: String,
    /// Confidence reported on every frame.
    pub confidence: f32,
    /// Simulated inference latency in milliseconds.
    pub delay_ms: u64,
}

impl StubDetector {
    /// Stub that answers instantly.
    pub fn new(algorithm: impl Into<String>) -> Self {
        let algorithm = algorithm.into();
        Self {
            label: algorithm.clone(),
            algorithm,
            confidence: 0.9,
            delay_ms: 0,
        }
    }

    /// Stub with a simulated inference delay.
    pub fn with_delay(algorithm: impl Into<String>, delay_ms: u64) -> Self {
        let mut stub = Self::new(algorithm);
        stub.delay_ms = delay_ms;
        stub
    }
}

#[async_trait]
impl AlgorithmExecutor for StubDetector {
    async fn execute(
        &self,
        _frame: &Bytes,
        _timestamp: f64,
        _sequence: u64,
    ) -> Result<Option<DetectionResult>, AlgorithmError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        Ok(Some(DetectionResult {
            algorithm: self.algorithm.clone(),
            label: self.label.clone(),
            confidence: self.confidence,
            bbox: None,
        }))
    }
}

/// Stub that runs but reports nothing — models the common "no event in
/// this frame" outcome.
pub struct SilentDetector;

#[async_trait]
impl AlgorithmExecutor for SilentDetector {
    async fn execute(
        &self,
        _frame: &Bytes,
        _timestamp: f64,
        _sequence: u64,
    ) -> Result<Option<DetectionResult>, AlgorithmError> {
        Ok(None)
    }
}

/// Stub that fails on every N-th frame, for degraded-result testing.
pub struct FlakyDetector {
    /// Algorithm name stamped onto successful detections.
    pub algorithm: String,
    /// Fail whenever `sequence % fail_every == 0`.
    pub fail_every: u64,
}

#[async_trait]
impl AlgorithmExecutor for FlakyDetector {
    async fn execute(
        &self,
        _frame: &Bytes,
        _timestamp: f64,
        sequence: u64,
    ) -> Result<Option<DetectionResult>, AlgorithmError> {
        if self.fail_every > 0 && sequence % self.fail_every == 0 {
            return Err(AlgorithmError::Failed(format!(
                "{}: injected failure at sequence {sequence}",
                self.algorithm
            )));
        }
        Ok(Some(DetectionResult {
            algorithm: self.algorithm.clone(),
            label: self.algorithm.clone(),
            confidence: 0.5,
            bbox: None,
        }))
    }
}
