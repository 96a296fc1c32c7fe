//! The heterogeneous processor pool: per-unit state, score-based
//! selection, and health transitions.
//!
//! Every unit keeps its own atomic counters and a per-entity lock for its
//! smoothed duration, so completions on different processors never
//! contend. The pool itself is immutable after construction — selection
//! walks a fixed slice.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{ProcessorConfig, WeightConfig};
use crate::queue::PriorityClass;

/// Hardware class of a pool unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// General-purpose CPU worker.
    Cpu,
    /// GPU worker.
    Gpu,
    /// Accelerator variant A (NPU-class inference unit).
    Npu,
    /// Accelerator variant B (VPU-class vision unit).
    Vpu,
}

impl ResourceKind {
    /// Lowercase label, used for log fields and metric label values.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Gpu => "gpu",
            ResourceKind::Npu => "npu",
            ResourceKind::Vpu => "vpu",
        }
    }
}

/// Live status of a pool unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProcessorStatus {
    /// No tasks in flight.
    Idle,
    /// At least one task in flight.
    Processing,
    /// Load exceeded the overload threshold; the scoring function steers
    /// work away until the monitor observes recovery.
    Overloaded,
    /// Externally faulted — excluded from dispatch until cleared.
    Error,
}

const STATUS_IDLE: u8 = 0;
const STATUS_PROCESSING: u8 = 1;
const STATUS_OVERLOADED: u8 = 2;
const STATUS_ERROR: u8 = 3;

impl ProcessorStatus {
    fn to_u8(self) -> u8 {
        match self {
            ProcessorStatus::Idle => STATUS_IDLE,
            ProcessorStatus::Processing => STATUS_PROCESSING,
            ProcessorStatus::Overloaded => STATUS_OVERLOADED,
            ProcessorStatus::Error => STATUS_ERROR,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATUS_IDLE => ProcessorStatus::Idle,
            STATUS_PROCESSING => ProcessorStatus::Processing,
            STATUS_OVERLOADED => ProcessorStatus::Overloaded,
            _ => ProcessorStatus::Error,
        }
    }

    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessorStatus::Idle => "idle",
            ProcessorStatus::Processing => "processing",
            ProcessorStatus::Overloaded => "overloaded",
            ProcessorStatus::Error => "error",
        }
    }
}

/// Health transition observed by the monitor sweep.
#[derive(Debug, PartialEq, Eq)]
pub enum HealthTransition {
    /// Load crossed the enter threshold; unit is now Overloaded.
    Overloaded,
    /// Load dropped below the exit threshold; unit recovered to the
    /// carried status.
    Recovered(ProcessorStatus),
}

/// One unit in the fixed compute pool.
///
/// Counters are atomics mutated by whichever worker completes a task; the
/// smoothed duration sits behind its own small lock. There is no lock
/// shared across units.
pub struct ProcessorResource {
    /// Unique processor id from the pool configuration.
    pub id: String,
    /// Hardware class.
    pub kind: ResourceKind,
    /// Concurrency ceiling.
    pub max_concurrent: u32,
    status: AtomicU8,
    current: AtomicU32,
    processed: AtomicU64,
    avg_duration_ms: Mutex<f64>,
}

impl ProcessorResource {
    fn new(config: &ProcessorConfig) -> Self {
        Self {
            id: config.id.clone(),
            kind: config.kind,
            max_concurrent: config.max_concurrent,
            status: AtomicU8::new(STATUS_IDLE),
            current: AtomicU32::new(0),
            processed: AtomicU64::new(0),
            avg_duration_ms: Mutex::new(0.0),
        }
    }

    /// Current status.
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Tasks currently in flight.
    pub fn current_tasks(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Cumulative completed-task count.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Exponentially-smoothed average task duration in milliseconds.
    pub fn avg_duration_ms(&self) -> f64 {
        *self.avg_duration_ms.lock()
    }

    /// In-flight count as a fraction of the ceiling, in `[0.0, 1.0]`.
    pub fn load(&self) -> f64 {
        f64::from(self.current_tasks()) / f64::from(self.max_concurrent)
    }

    /// Attempt to reserve one execution slot.
    ///
    /// The increment is a CAS loop gated on the ceiling, so the invariant
    /// `current_tasks <= max_concurrent` holds even against concurrent
    /// completions. Returns `false` for a faulted or saturated unit.
    pub fn try_reserve(&self) -> bool {
        if self.status() == ProcessorStatus::Error {
            return false;
        }
        let reserved = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < self.max_concurrent).then_some(c + 1)
            })
            .is_ok();
        if reserved {
            // Idle → Processing on first dispatch. Overloaded and Error
            // are owned by the monitor / fault operations respectively.
            let _ = self.status.compare_exchange(
                STATUS_IDLE,
                STATUS_PROCESSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        reserved
    }

    /// Release one slot after task completion (floor 0) and fold the
    /// observed duration into the smoothed average.
    pub fn release(&self, duration: Duration, ema_alpha: f64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        {
            let mut avg = self.avg_duration_ms.lock();
            let sample = duration.as_secs_f64() * 1000.0;
            *avg = if *avg == 0.0 {
                sample
            } else {
                *avg * (1.0 - ema_alpha) + sample * ema_alpha
            };
        }
        let drained = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .map(|prev| prev == 1)
            .unwrap_or(false);
        if drained {
            // Processing → Idle only; an Overloaded unit stays put until
            // the monitor observes it below the exit threshold.
            let _ = self.status.compare_exchange(
                STATUS_PROCESSING,
                STATUS_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Dispatch score for a task of the given class. Lower wins.
    ///
    /// `(load + latency/latency_norm) × hardware_weight × priority_weight`
    pub fn score(&self, class: PriorityClass, weights: &WeightConfig) -> f64 {
        let load_component = self.load();
        let latency_component = self.avg_duration_ms() / weights.latency_norm_ms;
        (load_component + latency_component) * weights.hardware(self.kind) * weights.priority(class)
    }

    /// Apply one monitor sweep with hysteresis.
    ///
    /// Enter: `load > enter` from Idle/Processing only. Exit: `load < exit`
    /// from Overloaded only. Loads inside `[exit, enter]` are a dead band
    /// and never transition in either direction.
    pub fn supervise(&self, enter: f64, exit: f64) -> Option<HealthTransition> {
        let load = self.load();
        match self.status() {
            ProcessorStatus::Idle | ProcessorStatus::Processing if load > enter => {
                self.status.store(STATUS_OVERLOADED, Ordering::Release);
                Some(HealthTransition::Overloaded)
            }
            ProcessorStatus::Overloaded if load < exit => {
                let next = if self.current_tasks() > 0 {
                    ProcessorStatus::Processing
                } else {
                    ProcessorStatus::Idle
                };
                self.status.store(next.to_u8(), Ordering::Release);
                Some(HealthTransition::Recovered(next))
            }
            _ => None,
        }
    }

    /// Externally fault this unit: excluded from dispatch until cleared.
    pub fn mark_error(&self) {
        self.status.store(STATUS_ERROR, Ordering::Release);
    }

    /// Clear an external fault, restoring Idle or Processing by in-flight
    /// count. No-op if the unit is not in Error.
    pub fn clear_error(&self) {
        let next = if self.current_tasks() > 0 {
            STATUS_PROCESSING
        } else {
            STATUS_IDLE
        };
        let _ = self
            .status
            .compare_exchange(STATUS_ERROR, next, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Point-in-time metrics for this unit.
    pub fn snapshot(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status(),
            current_tasks: self.current_tasks(),
            max_concurrent: self.max_concurrent,
            processed: self.processed(),
            avg_duration_ms: self.avg_duration_ms(),
            load: self.load(),
        }
    }
}

/// Read-only snapshot of one processor's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorMetricsSnapshot {
    /// Processor id.
    pub id: String,
    /// Hardware class.
    pub kind: ResourceKind,
    /// Status at snapshot time.
    pub status: ProcessorStatus,
    /// Tasks in flight at snapshot time.
    pub current_tasks: u32,
    /// Concurrency ceiling.
    pub max_concurrent: u32,
    /// Cumulative completed tasks.
    pub processed: u64,
    /// Smoothed average task duration (ms).
    pub avg_duration_ms: f64,
    /// Load fraction at snapshot time.
    pub load: f64,
}

/// The fixed pool, built once at scheduler construction.
pub struct ProcessorPool {
    units: Vec<Arc<ProcessorResource>>,
}

impl ProcessorPool {
    /// Build the pool from validated configuration.
    pub fn new(configs: &[ProcessorConfig]) -> Self {
        Self {
            units: configs
                .iter()
                .map(|c| Arc::new(ProcessorResource::new(c)))
                .collect(),
        }
    }

    /// All units, in configuration order.
    pub fn units(&self) -> &[Arc<ProcessorResource>] {
        &self.units
    }

    /// Look up one unit by id.
    pub fn get(&self, id: &str) -> Option<&Arc<ProcessorResource>> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Sum of in-flight counts across the pool.
    pub fn total_in_flight(&self) -> u32 {
        self.units.iter().map(|u| u.current_tasks()).sum()
    }

    /// Sum of all concurrency ceilings.
    pub fn total_capacity(&self) -> u32 {
        self.units.iter().map(|u| u.max_concurrent).sum()
    }

    /// Select the minimum-score candidate for a task and reserve a slot
    /// on it.
    ///
    /// Candidates are units with status ≠ Error and spare capacity. Ties
    /// on score break toward the lower hardware weight, then config
    /// order, so an idle accelerator beats an idle CPU even when both
    /// score 0. Returns `None` when no unit can take the task right now —
    /// the caller owns the retry policy.
    pub fn select_and_reserve(
        &self,
        class: PriorityClass,
        weights: &WeightConfig,
    ) -> Option<Arc<ProcessorResource>> {
        let mut candidates: Vec<(f64, f64, usize)> = self
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| {
                u.status() != ProcessorStatus::Error && u.current_tasks() < u.max_concurrent
            })
            .map(|(i, u)| (u.score(class, weights), weights.hardware(u.kind), i))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

        for (_, _, i) in candidates {
            // The reservation CAS can lose to a concurrent completion or
            // fault; fall through to the next-best candidate.
            if self.units[i].try_reserve() {
                return Some(Arc::clone(&self.units[i]));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    fn unit(id: &str, kind: ResourceKind, max: u32) -> ProcessorResource {
        ProcessorResource::new(&ProcessorConfig {
            id: id.to_string(),
            kind,
            max_concurrent: max,
        })
    }

    fn pool(configs: &[(&str, ResourceKind, u32)]) -> ProcessorPool {
        let configs: Vec<_> = configs
            .iter()
            .map(|(id, kind, max)| ProcessorConfig {
                id: (*id).to_string(),
                kind: *kind,
                max_concurrent: *max,
            })
            .collect();
        ProcessorPool::new(&configs)
    }

    #[test]
    fn test_reserve_respects_ceiling() {
        let u = unit("cpu-0", ResourceKind::Cpu, 2);
        assert!(u.try_reserve());
        assert!(u.try_reserve());
        assert!(!u.try_reserve(), "third reserve must fail at ceiling 2");
        assert_eq!(u.current_tasks(), 2);
    }

    #[test]
    fn test_reserve_flips_idle_to_processing() {
        let u = unit("cpu-0", ResourceKind::Cpu, 2);
        assert_eq!(u.status(), ProcessorStatus::Idle);
        u.try_reserve();
        assert_eq!(u.status(), ProcessorStatus::Processing);
    }

    #[test]
    fn test_release_drains_back_to_idle() {
        let u = unit("cpu-0", ResourceKind::Cpu, 2);
        u.try_reserve();
        u.try_reserve();
        u.release(Duration::from_millis(10), 0.1);
        assert_eq!(u.status(), ProcessorStatus::Processing);
        u.release(Duration::from_millis(10), 0.1);
        assert_eq!(u.status(), ProcessorStatus::Idle);
        assert_eq!(u.current_tasks(), 0);
        assert_eq!(u.processed(), 2);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let u = unit("cpu-0", ResourceKind::Cpu, 2);
        u.release(Duration::from_millis(1), 0.1);
        assert_eq!(u.current_tasks(), 0);
    }

    #[test]
    fn test_ema_first_sample_seeds_average() {
        let u = unit("cpu-0", ResourceKind::Cpu, 1);
        u.try_reserve();
        u.release(Duration::from_millis(100), 0.1);
        assert!((u.avg_duration_ms() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_smooths_subsequent_samples() {
        let u = unit("cpu-0", ResourceKind::Cpu, 1);
        u.try_reserve();
        u.release(Duration::from_millis(100), 0.1);
        u.try_reserve();
        u.release(Duration::from_millis(200), 0.1);
        // 100 * 0.9 + 200 * 0.1 = 110
        assert!((u.avg_duration_ms() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_unit_refuses_reservation() {
        let u = unit("gpu-0", ResourceKind::Gpu, 4);
        u.mark_error();
        assert!(!u.try_reserve());
        assert_eq!(u.status(), ProcessorStatus::Error);
    }

    #[test]
    fn test_clear_error_restores_by_in_flight() {
        let u = unit("gpu-0", ResourceKind::Gpu, 4);
        u.try_reserve();
        u.mark_error();
        u.clear_error();
        assert_eq!(u.status(), ProcessorStatus::Processing);

        let idle = unit("gpu-1", ResourceKind::Gpu, 4);
        idle.mark_error();
        idle.clear_error();
        assert_eq!(idle.status(), ProcessorStatus::Idle);
    }

    #[test]
    fn test_supervise_enters_overloaded_above_threshold() {
        let u = unit("cpu-0", ResourceKind::Cpu, 20);
        for _ in 0..19 {
            u.try_reserve();
        }
        // load 0.95
        assert_eq!(u.supervise(0.9, 0.7), Some(HealthTransition::Overloaded));
        assert_eq!(u.status(), ProcessorStatus::Overloaded);
    }

    #[test]
    fn test_supervise_dead_band_holds_overloaded() {
        let u = unit("cpu-0", ResourceKind::Cpu, 20);
        for _ in 0..19 {
            u.try_reserve();
        }
        u.supervise(0.9, 0.7);
        for _ in 0..3 {
            u.release(Duration::from_millis(1), 0.1);
        }
        // load 0.80 — inside the dead band, still Overloaded
        assert_eq!(u.supervise(0.9, 0.7), None);
        assert_eq!(u.status(), ProcessorStatus::Overloaded);
    }

    #[test]
    fn test_supervise_recovers_below_exit() {
        let u = unit("cpu-0", ResourceKind::Cpu, 20);
        for _ in 0..19 {
            u.try_reserve();
        }
        u.supervise(0.9, 0.7);
        for _ in 0..6 {
            u.release(Duration::from_millis(1), 0.1);
        }
        // load 0.65 < 0.7, 13 tasks still in flight
        assert_eq!(
            u.supervise(0.9, 0.7),
            Some(HealthTransition::Recovered(ProcessorStatus::Processing))
        );
        assert_eq!(u.status(), ProcessorStatus::Processing);
    }

    #[test]
    fn test_supervise_never_enters_from_dead_band() {
        let u = unit("cpu-0", ResourceKind::Cpu, 10);
        for _ in 0..8 {
            u.try_reserve();
        }
        // load 0.80 from Processing — below enter, no transition ever
        assert_eq!(u.supervise(0.9, 0.7), None);
        assert_eq!(u.status(), ProcessorStatus::Processing);
    }

    #[test]
    fn test_supervise_leaves_error_alone() {
        let u = unit("cpu-0", ResourceKind::Cpu, 1);
        u.mark_error();
        assert_eq!(u.supervise(0.9, 0.7), None);
        assert_eq!(u.status(), ProcessorStatus::Error);
    }

    #[test]
    fn test_score_prefers_low_load() {
        let weights = WeightConfig::default();
        let busy = unit("cpu-0", ResourceKind::Cpu, 4);
        busy.try_reserve();
        busy.try_reserve();
        let idle = unit("cpu-1", ResourceKind::Cpu, 4);
        assert!(
            idle.score(PriorityClass::Normal, &weights)
                < busy.score(PriorityClass::Normal, &weights)
        );
    }

    #[test]
    fn test_idle_accelerator_beats_idle_cpu() {
        let weights = WeightConfig::default();
        let p = pool(&[
            ("cpu-0", ResourceKind::Cpu, 4),
            ("npu-0", ResourceKind::Npu, 4),
        ]);
        let selected = p
            .select_and_reserve(PriorityClass::Normal, &weights)
            .expect("a unit must be available");
        assert_eq!(selected.id, "npu-0");
    }

    #[test]
    fn test_selection_skips_error_units() {
        let weights = WeightConfig::default();
        let p = pool(&[
            ("npu-0", ResourceKind::Npu, 4),
            ("cpu-0", ResourceKind::Cpu, 4),
        ]);
        p.get("npu-0").expect("unit").mark_error();
        let selected = p
            .select_and_reserve(PriorityClass::Normal, &weights)
            .expect("cpu must be available");
        assert_eq!(selected.id, "cpu-0");
    }

    #[test]
    fn test_selection_none_when_pool_saturated() {
        let weights = WeightConfig::default();
        let p = pool(&[("cpu-0", ResourceKind::Cpu, 1)]);
        assert!(p.select_and_reserve(PriorityClass::Low, &weights).is_some());
        assert!(p.select_and_reserve(PriorityClass::Low, &weights).is_none());
    }

    #[test]
    fn test_loaded_accelerator_loses_to_idle_cpu_eventually() {
        // hardware weight only discounts, it does not override load: a
        // saturated-but-for-one-slot accelerator with history can score
        // worse than a fresh CPU.
        let weights = WeightConfig::default();
        let npu = unit("npu-0", ResourceKind::Npu, 2);
        npu.try_reserve();
        // seed a large smoothed duration
        npu.release(Duration::from_secs(60), 1.0);
        npu.try_reserve();
        let cpu = unit("cpu-0", ResourceKind::Cpu, 2);
        let npu_score = npu.score(PriorityClass::Normal, &weights);
        let cpu_score = cpu.score(PriorityClass::Normal, &weights);
        assert!(
            cpu_score < npu_score,
            "cpu {cpu_score} must beat loaded npu {npu_score}"
        );
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_ceiling() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let u = Arc::new(unit("cpu-0", ResourceKind::Cpu, 2));
        let peak = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let u = Arc::clone(&u);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if u.try_reserve() {
                        let seen = u.current_tasks();
                        peak.fetch_max(seen, Ordering::AcqRel);
                        assert!(seen <= 2, "ceiling violated: {seen}");
                        u.release(Duration::from_micros(10), 0.1);
                    }
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
        assert!(peak.load(Ordering::Acquire) <= 2);
    }

    #[test]
    fn test_pool_capacity_and_lookup() {
        let config = SchedulerConfig::default();
        let p = ProcessorPool::new(&config.processors);
        assert_eq!(p.total_capacity(), config.total_capacity());
        assert_eq!(p.total_in_flight(), 0);
        assert!(p.get("cpu-0").is_some());
        assert!(p.get("tpu-9").is_none());
    }
}
