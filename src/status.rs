//! Server status word and transition predicates.
//!
//! Every backend carries a 64-bit status word. The monitor worker mutates a
//! pending copy during a tick and publishes it at the end; everything outside
//! the worker only ever reads the published word.

use std::fmt;

/// Canonical status word of a monitored backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStatus(pub u64);

impl ServerStatus {
    /// The last probe succeeded.
    pub const RUNNING: u64 = 1 << 0;
    /// Admin-set maintenance; suppresses probing side effects.
    pub const MAINT: u64 = 1 << 1;
    /// Admin-set quiescence flag.
    pub const BEING_DRAINED: u64 = 1 << 2;
    /// Replication primary.
    pub const MASTER: u64 = 1 << 3;
    /// Replication replica.
    pub const SLAVE: u64 = 1 << 4;
    /// Synced member of a Galera cluster.
    pub const JOINED: u64 = 1 << 5;
    /// NDB cluster data node.
    pub const NDB: u64 = 1 << 6;
    /// Most recent connect failed with access-denied.
    pub const AUTH_ERROR: u64 = 1 << 7;
    /// Latched by the disk space checker.
    pub const DISK_SPACE_EXHAUSTED: u64 = 1 << 8;
    /// Sticky hint preserved across role loss.
    pub const WAS_MASTER: u64 = 1 << 9;

    /// Role bits a module may assign.
    pub const ROLE_BITS: u64 = Self::MASTER | Self::SLAVE | Self::JOINED | Self::NDB;

    /// Bits considered when deciding whether a transition is observable.
    pub const RELEVANT_BITS: u64 =
        Self::RUNNING | Self::MAINT | Self::MASTER | Self::SLAVE | Self::JOINED | Self::NDB;

    /// Bits an admin may toggle while the monitor runs.
    pub const ADMIN_BITS: u64 = Self::MAINT | Self::BEING_DRAINED;

    /// Sentinel for "previous status never recorded".
    pub const UNSET: u64 = u64::MAX;

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, bits: u64) -> bool {
        self.0 & bits != 0
    }

    pub fn with(self, bits: u64) -> Self {
        Self(self.0 | bits)
    }

    pub fn without(self, bits: u64) -> Self {
        Self(self.0 & !bits)
    }

    pub fn is_running(self) -> bool {
        self.contains(Self::RUNNING)
    }

    pub fn is_down(self) -> bool {
        !self.is_running()
    }

    pub fn is_in_maint(self) -> bool {
        self.contains(Self::MAINT)
    }

    pub fn is_being_drained(self) -> bool {
        self.contains(Self::BEING_DRAINED)
    }

    pub fn is_master(self) -> bool {
        self.contains(Self::MASTER)
    }

    pub fn is_slave(self) -> bool {
        self.contains(Self::SLAVE)
    }

    pub fn is_joined(self) -> bool {
        self.contains(Self::JOINED)
    }

    /// Whether the server holds any cluster role.
    pub fn is_in_cluster(self) -> bool {
        self.contains(Self::ROLE_BITS)
    }

    /// Running and not in maintenance.
    pub fn is_usable(self) -> bool {
        self.is_running() && !self.is_in_maint()
    }
}

impl From<u64> for ServerStatus {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

/// Whether the change from `prev` to `curr` is observable.
///
/// A transition counts only when the relevant bits differ, neither side is in
/// maintenance and the server was running on at least one side. A `prev` of
/// [`ServerStatus::UNSET`] means the server has never been probed and produces
/// no events.
pub fn status_changed(prev: u64, curr: u64) -> bool {
    if prev == ServerStatus::UNSET {
        return false;
    }

    let old = prev & ServerStatus::RELEVANT_BITS;
    let new = curr & ServerStatus::RELEVANT_BITS;

    old != new
        && (old | new) & ServerStatus::MAINT == 0
        && (old | new) & ServerStatus::RUNNING == ServerStatus::RUNNING
}

impl fmt::Display for ServerStatus {
    /// Deterministic rendering used in operator logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(u64, &str)] = &[
            (ServerStatus::MAINT, "Maintenance"),
            (ServerStatus::BEING_DRAINED, "Being Drained"),
            (ServerStatus::MASTER, "Master"),
            (ServerStatus::WAS_MASTER, "Was Master"),
            (ServerStatus::SLAVE, "Slave"),
            (ServerStatus::JOINED, "Synced"),
            (ServerStatus::NDB, "NDB"),
            (ServerStatus::AUTH_ERROR, "Auth Error"),
            (ServerStatus::DISK_SPACE_EXHAUSTED, "Low Disk Space"),
        ];

        let mut sep = "";
        for &(bit, name) in NAMES {
            if self.contains(bit) {
                write!(f, "{sep}{name}")?;
                sep = ", ";
            }
        }

        if self.is_running() {
            write!(f, "{sep}Running")?;
        } else {
            write!(f, "{sep}Down")?;
        }

        Ok(())
    }
}
