//! Prometheus metrics for the monitoring core.
//!
//! The embedding process scrapes or exposes [`Metrics::registry`]; the core
//! only records.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Monitoring core metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    /// Monitors currently running a worker
    pub monitors_running: IntGauge,
    /// Ticks executed across all monitors
    pub ticks_total: IntCounter,
    /// Probe outcomes by result
    pub probes_total: IntCounterVec,
    /// Observed server state changes by event name
    pub state_changes_total: IntCounterVec,
    /// Script executions by outcome
    pub scripts_total: IntCounterVec,
    /// Journal files written
    pub journal_writes_total: IntCounter,
    /// Journal write failures
    pub journal_write_errors_total: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let monitors_running = IntGauge::new(
            "argus_monitors_running",
            "Number of monitors with a live worker",
        )
        .unwrap();

        let ticks_total =
            IntCounter::new("argus_ticks_total", "Monitor ticks executed").unwrap();

        let probes_total = IntCounterVec::new(
            Opts::new("argus_probes_total", "Backend probe outcomes"),
            &["result"], // existing_ok, newconn_ok, timeout, refused
        )
        .unwrap();

        let state_changes_total = IntCounterVec::new(
            Opts::new(
                "argus_state_changes_total",
                "Server state changes by derived event",
            ),
            &["event"],
        )
        .unwrap();

        let scripts_total = IntCounterVec::new(
            Opts::new("argus_scripts_total", "Monitor script executions"),
            &["outcome"], // ok, failed, launch_error
        )
        .unwrap();

        let journal_writes_total = IntCounter::new(
            "argus_journal_writes_total",
            "Journal files written to disk",
        )
        .unwrap();

        let journal_write_errors_total = IntCounter::new(
            "argus_journal_write_errors_total",
            "Journal writes that failed",
        )
        .unwrap();

        registry.register(Box::new(monitors_running.clone())).unwrap();
        registry.register(Box::new(ticks_total.clone())).unwrap();
        registry.register(Box::new(probes_total.clone())).unwrap();
        registry.register(Box::new(state_changes_total.clone())).unwrap();
        registry.register(Box::new(scripts_total.clone())).unwrap();
        registry.register(Box::new(journal_writes_total.clone())).unwrap();
        registry
            .register(Box::new(journal_write_errors_total.clone()))
            .unwrap();

        Self {
            registry,
            monitors_running,
            ticks_total,
            probes_total,
            state_changes_total,
            scripts_total,
            journal_writes_total,
            journal_write_errors_total,
        }
    }
}
