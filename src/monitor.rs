//! Load balancer / health monitor.
//!
//! A periodic sweep, independent of the dispatch loop, that applies the
//! overload hysteresis to every processor and warns on queue backlog. It
//! is strictly observational: it flips status and logs, but never
//! reassigns resources or spawns workers — capacity decisions belong to
//! operators reading the stats and metrics it publishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::metrics;
use crate::processor::HealthTransition;
use crate::queue::PriorityClass;
use crate::scheduler::Shared;

/// Run the monitor until shutdown is signalled.
pub(crate) async fn run_monitor(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(
        shared.config.health.monitor_interval_ms,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(target: "scheduler::monitor", "health monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            res = shutdown.changed() => { if res.is_err() { break; } }
        }
        if *shutdown.borrow() {
            break;
        }
        sweep(&shared);
    }

    info!(target: "scheduler::monitor", "health monitor shutting down");
}

/// One monitor pass over processors and queues.
fn sweep(shared: &Shared) {
    let enter = shared.config.health.overload_enter;
    let exit = shared.config.health.overload_exit;

    for unit in shared.pool.units() {
        let load = unit.load();
        match unit.supervise(enter, exit) {
            Some(HealthTransition::Overloaded) => {
                warn!(
                    target: "scheduler::monitor",
                    processor = %unit.id,
                    load,
                    "processor overloaded"
                );
            }
            Some(HealthTransition::Recovered(status)) => {
                info!(
                    target: "scheduler::monitor",
                    processor = %unit.id,
                    load,
                    status = status.as_str(),
                    "processor recovered"
                );
            }
            None => {}
        }
        metrics::set_processor_load(&unit.id, load);
    }

    let depths = shared.queues.depths();
    if depths[0] > shared.config.health.critical_backlog {
        warn!(
            target: "scheduler::monitor",
            depth = depths[0],
            threshold = shared.config.health.critical_backlog,
            "critical queue backlog"
        );
    }
    if depths[1] > shared.config.health.high_backlog {
        warn!(
            target: "scheduler::monitor",
            depth = depths[1],
            threshold = shared.config.health.high_backlog,
            "high queue backlog"
        );
    }
    for (class, depth) in PriorityClass::ALL.iter().zip(depths) {
        metrics::set_queue_depth(class.as_str(), depth as i64);
    }
}
