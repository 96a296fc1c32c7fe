//! Scheduler configuration.
//!
//! Parsed from TOML and validated before the scheduler is constructed:
//! invalid field combinations are rejected up front rather than surfacing
//! as misbehaviour under load. Every field has either a required value or
//! a documented default, so an empty file is a valid configuration.
//!
//! # Example
//!
//! ```toml
//! max_streams = 32
//! queue_capacity = 200
//!
//! [[processors]]
//! id = "gpu-0"
//! kind = "gpu"
//! max_concurrent = 8
//!
//! [weights]
//! gpu = 0.3
//! critical = 0.1
//! ```

use serde::Deserialize;

use crate::processor::ResourceKind;
use crate::queue::PriorityClass;
use crate::SchedulerError;

// ── Default value functions ──────────────────────────────────────────────

/// Default maximum number of registered streams.
fn default_max_streams() -> usize {
    64
}

/// Default per-class queue capacity.
fn default_queue_capacity() -> usize {
    100
}

/// Default dispatch retry ceiling.
fn default_retry_limit() -> u32 {
    3
}

fn default_cpu_weight() -> f64 {
    1.0
}

fn default_gpu_weight() -> f64 {
    0.3
}

fn default_accelerator_weight() -> f64 {
    0.1
}

fn default_critical_weight() -> f64 {
    0.1
}

fn default_high_weight() -> f64 {
    0.3
}

fn default_normal_weight() -> f64 {
    0.7
}

fn default_low_weight() -> f64 {
    1.0
}

/// Default latency normalizing constant: 100ms.
fn default_latency_norm_ms() -> f64 {
    100.0
}

/// Default exponential-moving-average weight for new samples.
fn default_ema_alpha() -> f64 {
    0.1
}

/// Default load threshold that flips a processor into Overloaded.
fn default_overload_enter() -> f64 {
    0.9
}

/// Default load threshold below which an Overloaded processor recovers.
fn default_overload_exit() -> f64 {
    0.7
}

/// Default health-monitor interval: 1000ms.
fn default_monitor_interval_ms() -> u64 {
    1000
}

/// Default Critical-queue depth that triggers a backlog warning.
fn default_critical_backlog() -> usize {
    50
}

/// Default High-queue depth that triggers a backlog warning.
fn default_high_backlog() -> usize {
    100
}

/// Default per-algorithm execution timeout: 5000ms.
fn default_processing_timeout_ms() -> u64 {
    5000
}

/// Default bound on how long `stop()` waits for in-flight tasks.
fn default_drain_timeout_ms() -> u64 {
    5000
}

/// Default fixed pool: 4 CPU units, 2 GPU units, one of each accelerator.
fn default_processors() -> Vec<ProcessorConfig> {
    let mut pool = Vec::new();
    for i in 0..4 {
        pool.push(ProcessorConfig {
            id: format!("cpu-{i}"),
            kind: ResourceKind::Cpu,
            max_concurrent: 4,
        });
    }
    for i in 0..2 {
        pool.push(ProcessorConfig {
            id: format!("gpu-{i}"),
            kind: ResourceKind::Gpu,
            max_concurrent: 8,
        });
    }
    pool.push(ProcessorConfig {
        id: "npu-0".to_string(),
        kind: ResourceKind::Npu,
        max_concurrent: 16,
    });
    pool.push(ProcessorConfig {
        id: "vpu-0".to_string(),
        kind: ResourceKind::Vpu,
        max_concurrent: 16,
    });
    pool
}

// ── Sections ─────────────────────────────────────────────────────────────

/// One unit in the fixed compute pool.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProcessorConfig {
    /// Unique processor id (e.g. `"gpu-0"`).
    pub id: String,
    /// Hardware class of this unit.
    pub kind: ResourceKind,
    /// Concurrency ceiling — the unit never runs more tasks than this.
    pub max_concurrent: u32,
}

/// Scoring weight tables.
///
/// Hardware weights order the pool by preference (lower = more preferred);
/// priority weights steer urgent classes toward strong resources. Both
/// multiply into the dispatch score, so the minimum-score candidate wins.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WeightConfig {
    /// Hardware weight for general CPU units.
    #[serde(default = "default_cpu_weight")]
    pub cpu: f64,
    /// Hardware weight for GPU units.
    #[serde(default = "default_gpu_weight")]
    pub gpu: f64,
    /// Hardware weight for NPU-class accelerator units.
    #[serde(default = "default_accelerator_weight")]
    pub npu: f64,
    /// Hardware weight for VPU-class accelerator units.
    #[serde(default = "default_accelerator_weight")]
    pub vpu: f64,
    /// Priority weight for Critical-class tasks.
    #[serde(default = "default_critical_weight")]
    pub critical: f64,
    /// Priority weight for High-class tasks.
    #[serde(default = "default_high_weight")]
    pub high: f64,
    /// Priority weight for Normal-class tasks.
    #[serde(default = "default_normal_weight")]
    pub normal: f64,
    /// Priority weight for Low-class tasks.
    #[serde(default = "default_low_weight")]
    pub low: f64,
    /// Normalizing constant for the latency component of the score (ms).
    #[serde(default = "default_latency_norm_ms")]
    pub latency_norm_ms: f64,
    /// Weight given to new samples in smoothed-duration/latency averages.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu_weight(),
            gpu: default_gpu_weight(),
            npu: default_accelerator_weight(),
            vpu: default_accelerator_weight(),
            critical: default_critical_weight(),
            high: default_high_weight(),
            normal: default_normal_weight(),
            low: default_low_weight(),
            latency_norm_ms: default_latency_norm_ms(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

impl WeightConfig {
    /// Hardware weight for a resource kind.
    pub fn hardware(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Gpu => self.gpu,
            ResourceKind::Npu => self.npu,
            ResourceKind::Vpu => self.vpu,
        }
    }

    /// Priority weight for a task class.
    pub fn priority(&self, class: PriorityClass) -> f64 {
        match class {
            PriorityClass::Critical => self.critical,
            PriorityClass::High => self.high,
            PriorityClass::Normal => self.normal,
            PriorityClass::Low => self.low,
        }
    }
}

/// Health-monitor settings: hysteresis thresholds and backlog warnings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Load above which a processor transitions into Overloaded.
    #[serde(default = "default_overload_enter")]
    pub overload_enter: f64,
    /// Load below which an Overloaded processor recovers.
    ///
    /// Loads between `overload_exit` and `overload_enter` are a dead band:
    /// no transition fires in either direction.
    #[serde(default = "default_overload_exit")]
    pub overload_exit: f64,
    /// Interval between monitor sweeps (ms).
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Critical-queue depth that triggers a backlog warning.
    #[serde(default = "default_critical_backlog")]
    pub critical_backlog: usize,
    /// High-queue depth that triggers a backlog warning.
    #[serde(default = "default_high_backlog")]
    pub high_backlog: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            overload_enter: default_overload_enter(),
            overload_exit: default_overload_exit(),
            monitor_interval_ms: default_monitor_interval_ms(),
            critical_backlog: default_critical_backlog(),
            high_backlog: default_high_backlog(),
        }
    }
}

/// Execution and shutdown timeouts.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    /// Per-algorithm execution timeout (ms). An executor that exceeds it
    /// is cancelled and counted as a stream error.
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    /// How long `stop()` waits for in-flight tasks to drain (ms).
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            processing_timeout_ms: default_processing_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a scheduler instance.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Fixed compute-pool composition. Never changes after `start()`.
    #[serde(default = "default_processors")]
    pub processors: Vec<ProcessorConfig>,
    /// Maximum number of registered streams.
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    /// Capacity of each of the four priority queues.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Dispatch attempts before a task is dropped as retry-exceeded.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Scoring weight tables.
    #[serde(default)]
    pub weights: WeightConfig,
    /// Health-monitor settings.
    #[serde(default)]
    pub health: HealthConfig,
    /// Execution and shutdown timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processors: default_processors(),
            max_streams: default_max_streams(),
            queue_capacity: default_queue_capacity(),
            retry_limit: default_retry_limit(),
            weights: WeightConfig::default(),
            health: HealthConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load and validate a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if the file cannot be read,
    /// fails to parse, or fails semantic validation.
    pub fn from_toml_path(path: &std::path::Path) -> Result<Self, SchedulerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| SchedulerError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] naming the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.processors.is_empty() {
            return Err(SchedulerError::Config(
                "processor pool must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.processors {
            if p.max_concurrent == 0 {
                return Err(SchedulerError::Config(format!(
                    "processor {}: max_concurrent must be > 0",
                    p.id
                )));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(SchedulerError::Config(format!(
                    "duplicate processor id: {}",
                    p.id
                )));
            }
        }
        if self.max_streams == 0 {
            return Err(SchedulerError::Config(
                "max_streams must be > 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(SchedulerError::Config(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.retry_limit == 0 {
            return Err(SchedulerError::Config("retry_limit must be > 0".to_string()));
        }
        let w = &self.weights;
        for (name, value) in [
            ("cpu", w.cpu),
            ("gpu", w.gpu),
            ("npu", w.npu),
            ("vpu", w.vpu),
            ("critical", w.critical),
            ("high", w.high),
            ("normal", w.normal),
            ("low", w.low),
            ("latency_norm_ms", w.latency_norm_ms),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(SchedulerError::Config(format!(
                    "weight {name} must be positive and finite"
                )));
            }
        }
        if w.ema_alpha <= 0.0 || w.ema_alpha > 1.0 {
            return Err(SchedulerError::Config(
                "ema_alpha must be in (0, 1]".to_string(),
            ));
        }
        if self.health.overload_exit >= self.health.overload_enter {
            return Err(SchedulerError::Config(
                "overload_exit must be below overload_enter".to_string(),
            ));
        }
        if self.timeouts.processing_timeout_ms == 0 {
            return Err(SchedulerError::Config(
                "processing_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Total execution capacity: sum of all processors' ceilings.
    pub fn total_capacity(&self) -> u32 {
        self.processors.iter().map(|p| p.max_concurrent).sum()
    }
}
