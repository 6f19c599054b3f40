//! Backend server identity and per-monitor probing state.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use crate::client::Connection;
use crate::config::{DiskSpaceLimits, ServerConfig};
use crate::event::MonitorEvent;
use crate::status::ServerStatus;

/// Milliseconds on a process-local monotonic clock.
pub(crate) fn time_ms() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// A backend server as the rest of the proxy sees it.
///
/// The status word is published with release semantics and read with acquire
/// semantics; readers outside the owning monitor worker must tolerate values
/// that are stale by one tick.
#[derive(Debug)]
pub struct Server {
    name: String,
    pub address: String,
    pub port: u16,
    monitor_user: String,
    monitor_password: String,
    disk_space_limits: DiskSpaceLimits,
    status: AtomicU64,
    /// Backend-reported server id; 0 when unknown.
    node_id: AtomicI64,
    /// Backend-reported id of this server's replication master; 0 when none.
    master_id: AtomicI64,
    last_event: AtomicU32,
    triggered_at: AtomicI64,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            name: config.name,
            address: config.address,
            port: config.port,
            monitor_user: config.monitor_user,
            monitor_password: config.monitor_password,
            disk_space_limits: config.disk_space_threshold,
            status: AtomicU64::new(0),
            node_id: AtomicI64::new(0),
            master_id: AtomicI64::new(0),
            last_event: AtomicU32::new(0),
            triggered_at: AtomicI64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `[address]:port` rendering used in logs and script expansions.
    pub fn endpoint(&self) -> String {
        format!("[{}]:{}", self.address, self.port)
    }

    /// Per-server monitor credentials; empty user means the monitor default.
    pub fn monitor_user(&self) -> &str {
        &self.monitor_user
    }

    pub fn monitor_password(&self) -> &str {
        &self.monitor_password
    }

    pub fn disk_space_limits(&self) -> &DiskSpaceLimits {
        &self.disk_space_limits
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus(self.status.load(Ordering::Acquire))
    }

    /// Replace the whole status word.
    pub fn assign_status(&self, status: u64) {
        self.status.store(status, Ordering::Release);
    }

    pub fn set_status(&self, bits: u64) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: u64) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn node_id(&self) -> i64 {
        self.node_id.load(Ordering::Relaxed)
    }

    pub fn set_node_id(&self, id: i64) {
        self.node_id.store(id, Ordering::Relaxed);
    }

    pub fn master_id(&self) -> i64 {
        self.master_id.load(Ordering::Relaxed)
    }

    pub fn set_master_id(&self, id: i64) {
        self.master_id.store(id, Ordering::Relaxed);
    }

    /// Most recent classified event, kept for failover decisions made by a
    /// passive peer taking over.
    pub fn last_event(&self) -> Option<MonitorEvent> {
        MonitorEvent::from_bits(self.last_event.load(Ordering::Relaxed))
    }

    pub fn record_event(&self, event: MonitorEvent) {
        self.last_event.store(event as u32, Ordering::Relaxed);
        self.triggered_at.store(time_ms(), Ordering::Relaxed);
    }

    pub fn triggered_at(&self) -> i64 {
        self.triggered_at.load(Ordering::Relaxed)
    }
}

/// Admin request values carried in a [`MonitoredServer`] mailbox slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusRequest {
    NoChange = 0,
    MaintOn = 1,
    MaintOff = 2,
    DrainOn = 3,
    DrainOff = 4,
}

impl StatusRequest {
    fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::MaintOn,
            2 => Self::MaintOff,
            3 => Self::DrainOn,
            4 => Self::DrainOff,
            _ => Self::NoChange,
        }
    }
}

/// A server as owned by exactly one monitor.
///
/// `prev_status` and `pending_status` are written only by the owning worker;
/// `status_request` is exchanged atomically between the admin side and the
/// worker.
pub struct MonitoredServer {
    pub server: Arc<Server>,
    conn: Mutex<Option<Box<dyn Connection>>>,
    prev_status: AtomicU64,
    pending_status: AtomicU64,
    err_count: AtomicU32,
    /// Monotonic ms of the last disk space check; -1 disables checking.
    disk_space_checked_at: AtomicI64,
    status_request: AtomicI32,
}

impl MonitoredServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            conn: Mutex::new(None),
            prev_status: AtomicU64::new(ServerStatus::UNSET),
            pending_status: AtomicU64::new(0),
            err_count: AtomicU32::new(0),
            // Pretend disk space was just checked so the first poll waits a
            // full interval.
            disk_space_checked_at: AtomicI64::new(time_ms()),
            status_request: AtomicI32::new(StatusRequest::NoChange as i32),
        }
    }

    /// Snapshot the effective status into prev and pending at tick start.
    pub fn stash_status(&self) {
        let status = self.server.status().bits();
        self.prev_status.store(status, Ordering::Relaxed);
        self.pending_status.store(status, Ordering::Relaxed);
    }

    pub fn prev_status(&self) -> u64 {
        self.prev_status.load(Ordering::Relaxed)
    }

    pub fn pending_status(&self) -> ServerStatus {
        ServerStatus(self.pending_status.load(Ordering::Relaxed))
    }

    pub fn set_pending(&self, bits: u64) {
        self.pending_status.fetch_or(bits, Ordering::Relaxed);
    }

    pub fn clear_pending(&self, bits: u64) {
        self.pending_status.fetch_and(!bits, Ordering::Relaxed);
    }

    pub fn assign_pending(&self, status: u64) {
        self.pending_status.store(status, Ordering::Relaxed);
    }

    /// Restore worker state from a journal record.
    pub(crate) fn restore(&self, status: u64) {
        self.prev_status.store(status, Ordering::Relaxed);
        self.pending_status.store(status, Ordering::Relaxed);
        self.server.assign_status(status);
    }

    pub fn take_conn(&self) -> Option<Box<dyn Connection>> {
        self.conn.lock().take()
    }

    pub fn put_conn(&self, conn: Box<dyn Connection>) {
        *self.conn.lock() = Some(conn);
    }

    pub fn close_conn(&self) {
        *self.conn.lock() = None;
    }

    pub fn err_count(&self) -> u32 {
        self.err_count.load(Ordering::Relaxed)
    }

    pub fn bump_err_count(&self) {
        self.err_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_err_count(&self) {
        self.err_count.store(0, Ordering::Relaxed);
    }

    pub fn disk_space_checked_at(&self) -> i64 {
        self.disk_space_checked_at.load(Ordering::Relaxed)
    }

    pub fn mark_disk_space_checked(&self) {
        self.disk_space_checked_at.store(time_ms(), Ordering::Relaxed);
    }

    /// Permanently stop disk space checks for this server.
    pub fn disable_disk_space_check(&self) {
        self.disk_space_checked_at.store(-1, Ordering::Relaxed);
    }

    pub fn disk_space_check_disabled(&self) -> bool {
        self.disk_space_checked_at() == -1
    }

    /// Admin side: publish a request, returning the one it displaced.
    pub fn push_status_request(&self, request: StatusRequest) -> StatusRequest {
        StatusRequest::from_i32(self.status_request.swap(request as i32, Ordering::AcqRel))
    }

    /// Worker side: drain the slot.
    pub fn take_status_request(&self) -> StatusRequest {
        StatusRequest::from_i32(
            self.status_request
                .swap(StatusRequest::NoChange as i32, Ordering::AcqRel),
        )
    }
}
