//! Disk space polling over the monitor connection.
//!
//! Backends expose per-mount sizes through `information_schema.DISKS`. A
//! backend without that table gets disk checking disabled permanently.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, warn};

use crate::client::{ClientError, Connection};
use crate::config::{DiskSpaceLimits, MonitorSettings};
use crate::server::{time_ms, MonitoredServer};
use crate::status::ServerStatus;

const DISKS_QUERY: &str =
    "SELECT Disk, Path, Total, Used, Available FROM information_schema.DISKS";

/// Sizes of one mounted filesystem, in KiB as the backend reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSizes {
    pub total: u64,
    pub available: u64,
}

impl DiskSizes {
    pub fn used_percentage(self) -> i32 {
        if self.total == 0 {
            return 0;
        }
        (((self.total - self.available) as f64 / self.total as f64) * 100.0) as i32
    }
}

/// Whether this server is due for a disk space check this tick.
pub fn should_check_disk_space(ms: &MonitoredServer, settings: &MonitorSettings) -> bool {
    if settings.disk_space_check_interval == 0 || ms.disk_space_check_disabled() {
        return false;
    }

    if settings.disk_space_limits.is_empty() && ms.server.disk_space_limits().is_empty() {
        return false;
    }

    time_ms() - ms.disk_space_checked_at() > settings.disk_space_check_interval as i64
}

/// Poll the backend and latch DISK_SPACE_EXHAUSTED in the pending status.
pub async fn update_disk_space_status(
    conn: &mut dyn Connection,
    monitor: &str,
    ms: &MonitoredServer,
    monitor_limits: &DiskSpaceLimits,
) {
    let info = match query_disk_info(conn).await {
        Ok(info) => info,
        Err(e) if e.is_unknown_table() => {
            ms.disable_disk_space_check();
            error!(
                monitor = %monitor,
                server = %ms.server.name(),
                endpoint = %ms.server.endpoint(),
                "Disk space cannot be checked, because either the backend version is too old \
                 or the DISKS information schema plugin has not been installed. \
                 Disk space checking has been disabled"
            );
            return;
        }
        Err(e) => {
            error!(
                monitor = %monitor,
                server = %ms.server.name(),
                error = %e,
                "Checking the disk space failed"
            );
            return;
        }
    };

    // Server-specific limits take precedence.
    let limits = if ms.server.disk_space_limits().is_empty() {
        monitor_limits
    } else {
        ms.server.disk_space_limits()
    };

    let mut exhausted = false;
    let mut checked_paths = BTreeSet::new();

    for (path, max_percentage) in limits.iter() {
        if path == "*" {
            continue;
        }

        match info.get(path) {
            Some(sizes) => {
                exhausted |= path_exhausted(monitor, ms, path, *sizes, max_percentage);
                checked_paths.insert(path.to_string());
            }
            None => warn!(
                monitor = %monitor,
                server = %ms.server.name(),
                path = %path,
                "Disk space threshold specified for a path the server does not have"
            ),
        }
    }

    if let Some(star_max) = limits.wildcard() {
        for (path, sizes) in &info {
            if !checked_paths.contains(path) {
                exhausted |= path_exhausted(monitor, ms, path, *sizes, star_max);
            }
        }
    }

    if exhausted {
        ms.set_pending(ServerStatus::DISK_SPACE_EXHAUSTED);
    } else {
        ms.clear_pending(ServerStatus::DISK_SPACE_EXHAUSTED);
    }

    ms.mark_disk_space_checked();
}

fn path_exhausted(
    monitor: &str,
    ms: &MonitoredServer,
    path: &str,
    sizes: DiskSizes,
    max_percentage: i32,
) -> bool {
    let used = sizes.used_percentage();
    if used >= max_percentage {
        error!(
            monitor = %monitor,
            server = %ms.server.name(),
            endpoint = %ms.server.endpoint(),
            path = %path,
            used_percentage = used,
            limit_percentage = max_percentage,
            "Disk space is exhausted"
        );
        true
    } else {
        false
    }
}

async fn query_disk_info(
    conn: &mut dyn Connection,
) -> Result<BTreeMap<String, DiskSizes>, ClientError> {
    let result = conn.query(DISKS_QUERY).await?;

    let mut info = BTreeMap::new();
    for row in 0..result.rows.len() {
        let path = result.value(row, "Path");
        let total = result.value(row, "Total").and_then(|v| v.parse().ok());
        let available = result.value(row, "Available").and_then(|v| v.parse().ok());

        if let (Some(path), Some(total), Some(available)) = (path, total, available) {
            info.insert(path.to_string(), DiskSizes { total, available });
        }
    }
    Ok(info)
}
