//! The monitor worker: one task per running monitor.
//!
//! The loop wakes every 100 ms at most and runs a tick when the interval has
//! elapsed, an admin requested a status change, or the module asks for an
//! immediate tick. At most one tick is ever in flight per monitor.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MonitorSettings;
use crate::disk;
use crate::event::{classify, MonitorEvent};
use crate::journal;
use crate::metrics::metrics;
use crate::probe;
use crate::script;
use crate::server::{MonitoredServer, StatusRequest};
use crate::status::{status_changed, ServerStatus};

use super::Monitor;

/// Minimum sleep between wakeups and maximum delay until an early-wakeup
/// check.
const BASE_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) async fn run(
    monitor: Arc<Monitor>,
    token: CancellationToken,
    started: oneshot::Sender<()>,
) {
    load_journal(&monitor);

    // The caller observes actual startup, not just a spawned task.
    let _ = started.send(());
    debug!(monitor = %monitor.name(), "Monitor worker running");

    // No tick has happened yet: the first one fires immediately.
    let mut last_tick: Option<Instant> = None;

    loop {
        let settings = monitor.settings();
        let interval = settings.interval();

        let elapsed = last_tick.map(|t| t.elapsed()).unwrap_or(interval);
        let due = elapsed >= interval
            || monitor.check_status_flag.load(Ordering::Acquire)
            || monitor.module.lock().await.immediate_tick_required();

        if due {
            last_tick = Some(Instant::now());
            run_one_tick(&monitor, &settings).await;
        }

        let since_tick = last_tick.map(|t| t.elapsed()).unwrap_or_default();
        let remaining = interval.saturating_sub(since_tick);
        let delay = if remaining.is_zero() || remaining >= BASE_INTERVAL {
            BASE_INTERVAL
        } else {
            remaining
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(monitor = %monitor.name(), "Monitor worker exiting");
}

/// One full pass over the monitor's servers.
pub(crate) async fn run_one_tick(monitor: &Arc<Monitor>, settings: &MonitorSettings) {
    drain_admin_requests(monitor);

    let servers = monitor.servers();

    monitor.module.lock().await.pre_tick(&servers).await;

    for ms in &servers {
        if ms.server.status().is_in_maint() {
            continue;
        }

        ms.stash_status();

        let result = probe::ping_or_connect(
            &*monitor.deps.connector,
            ms,
            &settings.conn,
            &monitor.deps.secrets,
        )
        .await;
        metrics()
            .probes_total
            .with_label_values(&[result.outcome.label()])
            .inc();

        if result.is_ok() {
            ms.clear_pending(ServerStatus::AUTH_ERROR);
            ms.set_pending(ServerStatus::RUNNING);

            if let Some(mut conn) = ms.take_conn() {
                if disk::should_check_disk_space(ms, settings) {
                    disk::update_disk_space_status(
                        &mut *conn,
                        monitor.name(),
                        ms,
                        &settings.disk_space_limits,
                    )
                    .await;
                }

                let module = monitor.module.lock().await;
                module.update_server_status(&mut *conn, ms).await;
                drop(module);

                ms.put_conn(conn);
            }

            ms.reset_err_count();
        } else {
            // Everything except the sticky master hint is gone.
            ms.clear_pending(!ServerStatus::WAS_MASTER);

            if result.is_access_denied() {
                ms.set_pending(ServerStatus::AUTH_ERROR);
            } else {
                ms.clear_pending(ServerStatus::AUTH_ERROR);
            }

            if ms.err_count() == 0 {
                probe::log_connect_error(monitor.name(), ms, &result);
            }
            ms.bump_err_count();
        }
    }

    {
        let module = monitor.module.lock().await;
        module.post_tick(&servers).await;
        *monitor.master.lock() = module.select_master(&servers);
    }

    monitor.ticks.fetch_add(1, Ordering::AcqRel);
    metrics().ticks_total.inc();

    // Publish pending to effective.
    for ms in &servers {
        if !ms.server.status().is_in_maint() {
            ms.server.assign_status(ms.pending_status().bits());
        }
    }

    process_state_changes(monitor, settings, &servers).await;
    hangup_failed_servers(monitor, &servers);
    store_journal(monitor, &servers);
}

/// Apply admin maintenance/draining requests published since the last tick.
fn drain_admin_requests(monitor: &Monitor) {
    if !monitor.check_status_flag.swap(false, Ordering::AcqRel) {
        return;
    }

    for ms in monitor.servers() {
        match ms.take_status_request() {
            StatusRequest::NoChange => {}
            StatusRequest::MaintOn => ms.server.set_status(ServerStatus::MAINT),
            StatusRequest::MaintOff => ms.server.clear_status(ServerStatus::MAINT),
            StatusRequest::DrainOn => ms.server.set_status(ServerStatus::BEING_DRAINED),
            StatusRequest::DrainOff => ms.server.clear_status(ServerStatus::BEING_DRAINED),
        }
    }
}

/// Classify observable transitions, log them, run subscribed scripts.
async fn process_state_changes(
    monitor: &Arc<Monitor>,
    settings: &MonitorSettings,
    servers: &[Arc<MonitoredServer>],
) {
    let mut master_down = false;
    let mut master_up = false;

    for ms in servers {
        let prev = ms.prev_status();
        let curr = ms.server.status().bits();
        if !status_changed(prev, curr) {
            continue;
        }

        let Some(event) = classify(prev, curr) else {
            continue;
        };

        ms.server.record_event(event);
        metrics()
            .state_changes_total
            .with_label_values(&[event.name()])
            .inc();
        info!(
            monitor = %monitor.name(),
            server = %ms.server.name(),
            endpoint = %ms.server.endpoint(),
            event = %event.name(),
            previous = %ServerStatus(prev),
            current = %ServerStatus(curr),
            "Server changed state"
        );

        match event {
            MonitorEvent::MasterDown => master_down = true,
            MonitorEvent::MasterUp | MonitorEvent::NewMaster => master_up = true,
            _ => {}
        }

        if !settings.script.is_empty() && settings.events.contains(event) {
            let code = script::launch_script(
                monitor.name(),
                &settings.script,
                settings.script_timeout(),
                ms,
                event,
                servers,
                &settings.conn,
            )
            .await;

            let outcome = match code {
                0 => "ok",
                script::LAUNCH_FAILED => "launch_error",
                _ => "failed",
            };
            metrics().scripts_total.with_label_values(&[outcome]).inc();
        }
    }

    if master_down && master_up {
        info!(
            monitor = %monitor.name(),
            "Master switch detected: lost a master and gained a new one"
        );
    }
}

/// Tear down client connections to servers that just became unusable or left
/// the cluster.
fn hangup_failed_servers(monitor: &Arc<Monitor>, servers: &[Arc<MonitoredServer>]) {
    for ms in servers {
        let curr = ms.server.status();
        if status_changed(ms.prev_status(), curr.bits())
            && (!curr.is_usable() || !curr.is_in_cluster())
        {
            monitor.deps.services.hangup_connections(&ms.server);
        }
    }
}

/// Persist the effective view; identical payloads are not rewritten.
fn store_journal(monitor: &Arc<Monitor>, servers: &[Arc<MonitoredServer>]) {
    let master = monitor.master.lock().clone();
    let entries: Vec<(&str, u64)> = servers
        .iter()
        .map(|ms| (ms.server.name(), ms.server.status().bits()))
        .collect();

    let payload = journal::encode(&entries, master.as_deref());
    let hash = journal::digest(&payload);

    let mut stored_hash = monitor.journal_hash.lock();
    if *stored_hash == hash {
        return;
    }

    match journal::write_journal(&monitor.datadir, monitor.name(), &payload) {
        Ok(()) => {
            *stored_hash = hash;
            metrics().journal_writes_total.inc();
        }
        Err(e) => {
            error!(
                monitor = %monitor.name(),
                error = %e,
                "Failed to write journal data to disk"
            );
            metrics().journal_write_errors_total.inc();
        }
    }
}

/// Restore the last persisted view on worker startup.
fn load_journal(monitor: &Arc<Monitor>) {
    let Some(snapshot) = journal::load_journal(&monitor.datadir, monitor.name()) else {
        return;
    };

    let servers = monitor.servers();
    for (name, status) in &snapshot.servers {
        if let Some(ms) = servers.iter().find(|ms| ms.server.name() == name) {
            ms.restore(*status);
        }
    }

    if let Some(master) = snapshot.master {
        if servers.iter().any(|ms| ms.server.name() == master) {
            *monitor.master.lock() = Some(master);
        }
    }

    info!(
        monitor = %monitor.name(),
        path = %journal::journal_path(&monitor.datadir, monitor.name()).display(),
        "Loaded server states from journal file"
    );
}
