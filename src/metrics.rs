//! Prometheus metrics for the scheduler.
//!
//! Call [`init_metrics`] once at process startup, before `start()`. Every
//! helper is a no-op if `init_metrics` was never called, so the scheduler
//! always runs — observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `scheduler_frames_submitted_total` | Counter | `class` |
//! | `scheduler_frames_dropped_total` | Counter | `reason` |
//! | `scheduler_dispatch_total` | Counter | `kind` |
//! | `scheduler_task_duration_seconds` | Histogram | `kind` |
//! | `scheduler_queue_depth` | Gauge | `class` |
//! | `scheduler_processor_load` | Gauge | `processor` |

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

use crate::SchedulerError;

/// All Prometheus metrics for the scheduler, bundled so they can live in
/// a single [`OnceLock`] and initialise atomically.
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Frames accepted by `submit_frame`, per priority class.
    pub frames_submitted: CounterVec,
    /// Frames dropped, by reason (`queue_full`, `retry_exceeded`).
    pub frames_dropped: CounterVec,
    /// Dispatches, per processor kind.
    pub dispatches: CounterVec,
    /// Task execution duration, per processor kind.
    pub task_duration: HistogramVec,
    /// Current priority-queue depth, per class.
    pub queue_depth: IntGaugeVec,
    /// Current processor load fraction, per unit.
    pub processor_load: GaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialise all metric families against a private registry.
///
/// Idempotent: a second call is a no-op returning `Ok(())`.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] if metric construction or registry
/// registration fails (e.g. duplicate descriptor names).
pub fn init_metrics() -> Result<(), SchedulerError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let frames_submitted = CounterVec::new(
        Opts::new("scheduler_frames_submitted_total", "Frames admitted"),
        &["class"],
    )
    .map_err(|e| SchedulerError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(frames_submitted.clone()))
        .map_err(|e| SchedulerError::Config(format!("metrics registration failed: {e}")))?;

    let frames_dropped = CounterVec::new(
        Opts::new("scheduler_frames_dropped_total", "Frames dropped by reason"),
        &["reason"],
    )
    .map_err(|e| SchedulerError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(frames_dropped.clone()))
        .map_err(|e| SchedulerError::Config(format!("metrics registration failed: {e}")))?;

    let dispatches = CounterVec::new(
        Opts::new("scheduler_dispatch_total", "Dispatches per processor kind"),
        &["kind"],
    )
    .map_err(|e| SchedulerError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(dispatches.clone()))
        .map_err(|e| SchedulerError::Config(format!("metrics registration failed: {e}")))?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "scheduler_task_duration_seconds",
            "Task execution duration per processor kind",
        ),
        &["kind"],
    )
    .map_err(|e| SchedulerError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(task_duration.clone()))
        .map_err(|e| SchedulerError::Config(format!("metrics registration failed: {e}")))?;

    let queue_depth = IntGaugeVec::new(
        Opts::new("scheduler_queue_depth", "Priority queue depth per class"),
        &["class"],
    )
    .map_err(|e| SchedulerError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(queue_depth.clone()))
        .map_err(|e| SchedulerError::Config(format!("metrics registration failed: {e}")))?;

    let processor_load = GaugeVec::new(
        Opts::new("scheduler_processor_load", "Processor load fraction"),
        &["processor"],
    )
    .map_err(|e| SchedulerError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(processor_load.clone()))
        .map_err(|e| SchedulerError::Config(format!("metrics registration failed: {e}")))?;

    // If another thread raced us, the first one wins — both
    // initializations produce identical descriptors.
    let _ = METRICS.set(Metrics {
        registry,
        frames_submitted,
        frames_dropped,
        dispatches,
        task_duration,
        queue_depth,
        processor_load,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Count one admitted frame for a priority class.
pub fn inc_submitted(class: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.frames_submitted.get_metric_with_label_values(&[class]) {
            c.inc();
        }
    }
}

/// Count one dropped frame; `reason` is `"queue_full"` or
/// `"retry_exceeded"`.
pub fn inc_dropped(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.frames_dropped.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Count one dispatch to a processor kind.
pub fn inc_dispatch(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.dispatches.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Record one task's execution duration for a processor kind.
pub fn observe_task_duration(kind: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.task_duration.get_metric_with_label_values(&[kind]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Set the depth gauge for a priority class.
pub fn set_queue_depth(class: &str, depth: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.queue_depth.get_metric_with_label_values(&[class]) {
            g.set(depth);
        }
    }
}

/// Set the load gauge for one processor.
pub fn set_processor_load(processor: &str, load: f64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.processor_load.get_metric_with_label_values(&[processor]) {
            g.set(load);
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition
/// format. Returns an empty string before [`init_metrics`] or on
/// encoding failure — observability degrades rather than panicking.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok(), "second call must be a no-op");
    }

    #[test]
    fn test_helpers_before_init_do_not_panic() {
        // OnceLock may already be set by another test; either way these
        // must be safe to call.
        inc_submitted("normal");
        inc_dropped("queue_full");
        inc_dispatch("gpu");
        observe_task_duration("cpu", Duration::from_millis(3));
        set_queue_depth("critical", 1);
        set_processor_load("cpu-0", 0.5);
    }

    #[test]
    fn test_gather_metrics_is_valid_utf8() {
        let _ = init_metrics();
        inc_submitted("high");
        let output = gather_metrics();
        assert!(std::str::from_utf8(output.as_bytes()).is_ok());
    }

    #[test]
    fn test_gather_contains_observed_family() {
        let _ = init_metrics();
        inc_dropped("retry_exceeded");
        let output = gather_metrics();
        assert!(
            output.contains("scheduler_frames_dropped_total"),
            "dropped counter must appear after an observation"
        );
    }
}
