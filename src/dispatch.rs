//! The dispatch loop and execution workers.
//!
//! One dedicated task scans the four queues in strict rank order and
//! hands each popped task to the minimum-score processor; execution runs
//! on spawned workers so the loop never blocks on an algorithm. A task
//! that finds no available processor is re-enqueued up to the retry
//! ceiling, then dropped and counted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument, Span};

use crate::metrics;
use crate::processor::ProcessorResource;
use crate::queue::ProcessingTask;
use crate::scheduler::Shared;
use crate::AnalysisOutput;

/// Fallback wait when all queues are empty; the `Notify` wakeup is the
/// fast path.
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Fallback wait after a failed dispatch attempt. Completions signal the
/// loop the moment a slot frees, so this only bounds how often a pool
/// with nothing completing (e.g. fully faulted) is re-probed.
const NO_CAPACITY_WAIT: Duration = Duration::from_millis(500);

enum DispatchOutcome {
    Dispatched,
    Requeued,
    Dropped,
}

/// Run the dispatch loop until shutdown is signalled.
pub(crate) async fn run_dispatch_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    info!(target: "scheduler::dispatch", "dispatch loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(task) = shared.queues.pop_highest() else {
            tokio::select! {
                _ = shared.queue_signal.notified() => {}
                res = shutdown.changed() => { if res.is_err() { break; } }
                _ = tokio::time::sleep(IDLE_WAIT) => {}
            }
            continue;
        };

        if let DispatchOutcome::Requeued = dispatch_one(&shared, task) {
            // Nothing frees a slot faster than a completion; wait for one
            // (or a new submission) instead of re-scoring a full pool in
            // a hot loop.
            tokio::select! {
                _ = shared.queue_signal.notified() => {}
                res = shutdown.changed() => { if res.is_err() { break; } }
                _ = tokio::time::sleep(NO_CAPACITY_WAIT) => {}
            }
        }
    }

    info!(target: "scheduler::dispatch", "dispatch loop shutting down");
}

/// Select a processor for one task, or recycle it through the retry
/// policy.
fn dispatch_one(shared: &Arc<Shared>, mut task: ProcessingTask) -> DispatchOutcome {
    match shared
        .pool
        .select_and_reserve(task.priority, &shared.config.weights)
    {
        Some(unit) => {
            metrics::inc_dispatch(unit.kind.as_str());
            debug!(
                target: "scheduler::dispatch",
                stream_id = %task.stream_id,
                sequence = task.sequence,
                class = task.priority.as_str(),
                processor = %unit.id,
                "task dispatched"
            );
            let span = tracing::info_span!(
                "scheduler.execute",
                stream_id = %task.stream_id,
                sequence = task.sequence,
                processor = %unit.id,
                duration_ms = tracing::field::Empty,
                detections = tracing::field::Empty,
            );
            tokio::spawn(execute_task(Arc::clone(shared), unit, task).instrument(span));
            DispatchOutcome::Dispatched
        }
        None => {
            task.retries += 1;
            if task.retries < shared.config.retry_limit {
                debug!(
                    target: "scheduler::dispatch",
                    stream_id = %task.stream_id,
                    sequence = task.sequence,
                    retries = task.retries,
                    "no processor available, re-enqueued"
                );
                shared.queues.requeue(task);
                DispatchOutcome::Requeued
            } else {
                warn!(
                    target: "scheduler::dispatch",
                    stream_id = %task.stream_id,
                    sequence = task.sequence,
                    retries = task.retries,
                    "retry exceeded, dropping task"
                );
                shared.stats.record_retry_exceeded();
                metrics::inc_dropped("retry_exceeded");
                DispatchOutcome::Dropped
            }
        }
    }
}

/// Run every requested algorithm for one dispatched task, then fold the
/// outcome into processor, stream, and global state.
async fn execute_task(shared: Arc<Shared>, unit: Arc<ProcessorResource>, task: ProcessingTask) {
    let start = Instant::now();
    let timeout = Duration::from_millis(shared.config.timeouts.processing_timeout_ms);
    let ema_alpha = shared.config.weights.ema_alpha;
    let mut results = Vec::new();
    let mut errors = 0u64;

    for name in &task.algorithms {
        let Some(executor) = shared.algorithms.get(unit.kind, name) else {
            warn!(
                target: "scheduler::execute",
                algorithm = %name,
                kind = unit.kind.as_str(),
                "no executor registered for this kind, skipping"
            );
            continue;
        };

        match tokio::time::timeout(
            timeout,
            executor.execute(&task.frame, task.timestamp, task.sequence),
        )
        .await
        {
            Ok(Ok(Some(detection))) => results.push(detection),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                // One failing algorithm degrades the result set but never
                // aborts the task's remaining algorithms.
                warn!(
                    target: "scheduler::execute",
                    algorithm = %name,
                    error = %e,
                    "algorithm failed"
                );
                errors += 1;
            }
            Err(_) => {
                warn!(
                    target: "scheduler::execute",
                    algorithm = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "algorithm timed out, cancelled"
                );
                errors += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    unit.release(elapsed, ema_alpha);
    shared
        .streams
        .record_completion(&task.stream_id, elapsed, errors, ema_alpha);
    shared.stats.record_completion(elapsed, errors, ema_alpha);
    metrics::observe_task_duration(unit.kind.as_str(), elapsed);

    Span::current().record("duration_ms", elapsed.as_millis() as u64);
    Span::current().record("detections", results.len() as u64);

    if !results.is_empty() {
        let output = AnalysisOutput {
            stream_id: task.stream_id,
            timestamp: task.timestamp,
            sequence: task.sequence,
            results,
        };
        // Best-effort forward: a slow or absent consumer must never
        // block an execution worker.
        if shared.result_tx.try_send(output).is_err() {
            warn!(
                target: "scheduler::execute",
                "result sink full or closed, discarding analysis output"
            );
        }
    }

    // A slot just freed up; a waiting re-enqueued task may be
    // dispatchable now.
    shared.queue_signal.notify_one();
}
