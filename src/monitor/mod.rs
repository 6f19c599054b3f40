//! Monitor object and lifecycle.
//!
//! A monitor owns an ordered set of backend servers, a module that
//! understands their clustering flavor and, while running, one worker task
//! that probes them. Admins talk to a running monitor only through the
//! mailbox handshake; everything else requires the monitor to be stopped.

pub(crate) mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::mysql::MySqlConnector;
use crate::client::Connector;
use crate::config::MonitorSettings;
use crate::journal;
use crate::metrics::metrics;
use crate::module::{create_module, ModuleError, MonitorModule};
use crate::probe;
use crate::secrets::Secrets;
use crate::server::{MonitoredServer, Server, StatusRequest};
use crate::service::{NoopServiceSink, ServiceSink};
use crate::status::ServerStatus;

pub(crate) const ERR_CANNOT_MODIFY: &str =
    "The server is monitored, so only the maintenance status can be \
     set/cleared manually. Status was not modified.";
pub(crate) const WRN_REQUEST_OVERWRITTEN: &str =
    "Previous maintenance request was not yet read by the monitor and was overwritten.";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Unknown monitor module '{0}'")]
    UnknownModule(String),

    #[error("Failed to start monitor '{0}'. See earlier errors for more information.")]
    StartFailed(String),

    #[error("{ERR_CANNOT_MODIFY}")]
    CannotModifyStatus,

    #[error("Server '{0}' is already monitored.")]
    DuplicateServer(String),

    #[error("Monitor '{monitor}' does not monitor server '{server}'")]
    UnknownServer { monitor: String, server: String },

    #[error("Monitor '{0}' was not found")]
    UnknownMonitor(String),

    #[error("Monitor '{0}' already exists")]
    DuplicateMonitor(String),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Running,
}

impl MonitorState {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorState::Running => "Running",
            MonitorState::Stopped => "Stopped",
        }
    }
}

/// Shared collaborators handed to every monitor.
#[derive(Clone)]
pub struct MonitorDeps {
    pub connector: Arc<dyn Connector>,
    pub services: Arc<dyn ServiceSink>,
    pub secrets: Arc<Secrets>,
}

impl MonitorDeps {
    pub fn new(
        connector: Arc<dyn Connector>,
        services: Arc<dyn ServiceSink>,
        secrets: Arc<Secrets>,
    ) -> Self {
        Self {
            connector,
            services,
            secrets,
        }
    }

    /// MySQL backends, no routing layer, plaintext passwords.
    pub fn production() -> Self {
        Self {
            connector: Arc::new(MySqlConnector),
            services: Arc::new(NoopServiceSink),
            secrets: Arc::new(Secrets::plaintext()),
        }
    }
}

struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// One monitor instance.
pub struct Monitor {
    name: String,
    module_name: String,
    pub(crate) module: AsyncMutex<Box<dyn MonitorModule>>,
    settings: RwLock<MonitorSettings>,
    servers: Mutex<Vec<Arc<MonitoredServer>>>,
    /// Serializes start/stop; holds the live worker while running.
    lifecycle: AsyncMutex<Option<WorkerHandle>>,
    running: AtomicBool,
    active: AtomicBool,
    pub(crate) ticks: AtomicU64,
    /// Wake hint set by admins; the worker swaps it back at tick start.
    pub(crate) check_status_flag: AtomicBool,
    /// One-shot permission probe already passed.
    checked: AtomicBool,
    /// SHA-1 of the last successfully persisted journal image.
    pub(crate) journal_hash: Mutex<[u8; 20]>,
    /// Name of the module-elected root master.
    pub(crate) master: Mutex<Option<String>>,
    pub(crate) datadir: PathBuf,
    pub(crate) deps: MonitorDeps,
}

impl Monitor {
    pub fn new(
        name: impl Into<String>,
        module_name: impl Into<String>,
        settings: MonitorSettings,
        datadir: impl Into<PathBuf>,
        deps: MonitorDeps,
    ) -> Result<Arc<Self>, MonitorError> {
        let name = name.into();
        let module_name = module_name.into();
        let module = create_module(&module_name)
            .ok_or_else(|| MonitorError::UnknownModule(module_name.clone()))?;

        Ok(Arc::new(Self {
            name,
            module_name,
            module: AsyncMutex::new(module),
            settings: RwLock::new(settings),
            servers: Mutex::new(Vec::new()),
            lifecycle: AsyncMutex::new(None),
            running: AtomicBool::new(false),
            active: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
            check_status_flag: AtomicBool::new(false),
            checked: AtomicBool::new(false),
            journal_hash: Mutex::new([0u8; 20]),
            master: Mutex::new(None),
            datadir: datadir.into(),
            deps,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn state(&self) -> MonitorState {
        if self.running.load(Ordering::Acquire) {
            MonitorState::Running
        } else {
            MonitorState::Stopped
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn reactivate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Ticks executed since creation.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings.read().clone()
    }

    /// Replace the configuration snapshot. Takes effect on the next start.
    pub fn reconfigure(&self, settings: MonitorSettings) {
        debug_assert_eq!(self.state(), MonitorState::Stopped);
        *self.settings.write() = settings;
    }

    pub fn servers(&self) -> Vec<Arc<MonitoredServer>> {
        self.servers.lock().clone()
    }

    pub fn monitored_server(&self, server_name: &str) -> Option<Arc<MonitoredServer>> {
        self.servers
            .lock()
            .iter()
            .find(|ms| ms.server.name() == server_name)
            .cloned()
    }

    pub fn monitors_server(&self, server_name: &str) -> bool {
        self.monitored_server(server_name).is_some()
    }

    /// Name of the currently elected root master, if any.
    pub fn root_master(&self) -> Option<String> {
        self.master.lock().clone()
    }

    /// Add a server to a stopped monitor.
    pub(crate) fn add_server(&self, server: Arc<Server>) {
        debug_assert_eq!(self.state(), MonitorState::Stopped);
        self.servers
            .lock()
            .push(Arc::new(MonitoredServer::new(server.clone())));
        self.deps.services.server_added(&self.name, &server);
    }

    /// Remove a server from a stopped monitor.
    pub(crate) fn remove_server(&self, server_name: &str) -> bool {
        debug_assert_eq!(self.state(), MonitorState::Stopped);
        let removed = {
            let mut servers = self.servers.lock();
            match servers.iter().position(|ms| ms.server.name() == server_name) {
                Some(idx) => Some(servers.remove(idx)),
                None => None,
            }
        };

        match removed {
            Some(ms) => {
                ms.close_conn();
                self.deps.services.server_removed(&self.name, &ms.server);
                true
            }
            None => false,
        }
    }

    /// Admin request to set a status bit on a monitored server.
    pub fn set_server_status(&self, server_name: &str, bit: u64) -> Result<(), MonitorError> {
        self.request_status_change(server_name, bit, true)
    }

    /// Admin request to clear a status bit on a monitored server.
    pub fn clear_server_status(&self, server_name: &str, bit: u64) -> Result<(), MonitorError> {
        self.request_status_change(server_name, bit, false)
    }

    fn request_status_change(
        &self,
        server_name: &str,
        bit: u64,
        set: bool,
    ) -> Result<(), MonitorError> {
        let ms = self
            .monitored_server(server_name)
            .ok_or_else(|| MonitorError::UnknownServer {
                monitor: self.name.clone(),
                server: server_name.to_string(),
            })?;

        if self.state() == MonitorState::Running {
            // A running monitor owns every other status bit.
            if bit != ServerStatus::MAINT && bit != ServerStatus::BEING_DRAINED {
                error!(monitor = %self.name, server = %server_name, "{ERR_CANNOT_MODIFY}");
                return Err(MonitorError::CannotModifyStatus);
            }

            let request = match (bit, set) {
                (ServerStatus::MAINT, true) => StatusRequest::MaintOn,
                (ServerStatus::MAINT, false) => StatusRequest::MaintOff,
                (_, true) => StatusRequest::DrainOn,
                (_, false) => StatusRequest::DrainOff,
            };

            let previous = ms.push_status_request(request);
            if previous != StatusRequest::NoChange {
                warn!(monitor = %self.name, server = %server_name, "{WRN_REQUEST_OVERWRITTEN}");
            }
            // Wake the worker early so the request is applied promptly.
            self.check_status_flag.swap(true, Ordering::AcqRel);
        } else if set {
            ms.server.set_status(bit);
        } else {
            ms.server.clear_status(bit);
        }

        Ok(())
    }

    /// Start the worker. A no-op when already running.
    pub async fn start(self: &Arc<Self>) -> Result<(), MonitorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(());
        }

        let settings = self.settings();

        if journal::is_stale(&self.datadir, &self.name, settings.journal_max_age) {
            warn!(monitor = %self.name, "Removing stale journal file");
            journal::remove_journal(&self.datadir, &self.name);
        }

        if !self.checked.load(Ordering::Acquire) {
            if self.has_sufficient_permissions(&settings).await {
                self.checked.store(true, Ordering::Release);
            } else {
                error!(
                    monitor = %self.name,
                    "Failed to start monitor. See earlier errors for more information."
                );
                return Err(MonitorError::StartFailed(self.name.clone()));
            }
        }

        self.module.lock().await.configure(&settings)?;
        *self.master.lock() = None;

        let token = CancellationToken::new();
        let (started_tx, started_rx) = oneshot::channel();
        let join = tokio::spawn(worker::run(self.clone(), token.clone(), started_tx));

        // Wait until the worker has loaded the journal and is actually live.
        if started_rx.await.is_err() {
            let _ = join.await;
            error!(monitor = %self.name, "Monitor worker exited during startup");
            return Err(MonitorError::StartFailed(self.name.clone()));
        }

        self.running.store(true, Ordering::Release);
        metrics().monitors_running.inc();
        *lifecycle = Some(WorkerHandle { token, join });
        info!(monitor = %self.name, module = %self.module_name, "Monitor started");
        Ok(())
    }

    /// Stop the worker and close every probe connection. A no-op when
    /// already stopped.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.take() else {
            return;
        };

        handle.token.cancel();
        if handle.join.await.is_err() {
            error!(monitor = %self.name, "Monitor worker panicked");
        }
        self.running.store(false, Ordering::Release);
        metrics().monitors_running.dec();

        for ms in self.servers() {
            ms.close_conn();
        }

        info!(monitor = %self.name, "Monitor stopped");
    }

    /// One-shot startup probe: connect to every backend and run the module's
    /// test query. Connect-level access denial is fatal; query-level
    /// permission problems are logged and tolerated.
    async fn has_sufficient_permissions(&self, settings: &MonitorSettings) -> bool {
        let servers = self.servers();
        if servers.is_empty() {
            return true;
        }

        let query = self.module.lock().await.permission_query().to_string();
        let mut ok = true;

        for ms in &servers {
            let result = probe::ping_or_connect(
                &*self.deps.connector,
                ms,
                &settings.conn,
                &self.deps.secrets,
            )
            .await;

            if !result.is_ok() {
                error!(
                    monitor = %self.name,
                    server = %ms.server.name(),
                    endpoint = %ms.server.endpoint(),
                    error = %result.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "Failed to connect to server when checking monitor user credentials and permissions"
                );
                if result.is_access_denied() {
                    ok = false;
                }
                continue;
            }

            let Some(mut conn) = ms.take_conn() else {
                continue;
            };

            match conn.query(&query).await {
                Ok(_) => ms.put_conn(conn),
                Err(e) => {
                    error!(
                        monitor = %self.name,
                        server = %ms.server.name(),
                        query = %query,
                        user = %settings.conn.user,
                        error = %e,
                        "Failed to execute query while checking monitor permissions"
                    );
                    if !matches!(e, crate::client::ClientError::Disconnected) {
                        ms.put_conn(conn);
                    }
                }
            }
        }

        ok
    }

    /// Operator-facing snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        let servers: Vec<serde_json::Value> = self
            .servers()
            .iter()
            .map(|ms| {
                serde_json::json!({
                    "name": ms.server.name(),
                    "address": ms.server.address,
                    "port": ms.server.port,
                    "status": ms.server.status().to_string(),
                })
            })
            .collect();

        let mut attributes = serde_json::json!({
            "module": self.module_name,
            "state": self.state().as_str(),
            "ticks": self.ticks(),
            "master": self.root_master(),
        });

        // Skip the diagnostics fragment when the worker holds the module.
        if let Ok(module) = self.module.try_lock() {
            attributes["monitor_diagnostics"] = module.diagnostics();
        }

        serde_json::json!({
            "id": self.name,
            "type": "monitors",
            "attributes": attributes,
            "relationships": { "servers": servers },
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn test_monitor() -> Arc<Monitor> {
        let monitor = Monitor::new(
            "mon1",
            "replication",
            MonitorSettings::default(),
            std::env::temp_dir(),
            MonitorDeps::production(),
        )
        .unwrap();
        monitor.add_server(Server::new(ServerConfig {
            name: "db1".into(),
            address: "10.0.0.1".into(),
            port: 3306,
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_threshold: Default::default(),
        }));
        monitor
    }

    #[test]
    fn test_unknown_module_is_rejected() {
        assert!(matches!(
            Monitor::new(
                "m",
                "nope",
                MonitorSettings::default(),
                "/tmp",
                MonitorDeps::production()
            ),
            Err(MonitorError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_stopped_monitor_sets_status_directly() {
        let monitor = test_monitor();
        assert_eq!(monitor.state(), MonitorState::Stopped);

        monitor
            .set_server_status("db1", ServerStatus::MAINT)
            .unwrap();
        let ms = monitor.monitored_server("db1").unwrap();
        assert!(ms.server.status().is_in_maint());

        monitor
            .clear_server_status("db1", ServerStatus::MAINT)
            .unwrap();
        assert!(!ms.server.status().is_in_maint());

        // Any bit goes while stopped.
        monitor
            .set_server_status("db1", ServerStatus::MASTER)
            .unwrap();
        assert!(ms.server.status().is_master());
    }

    #[test]
    fn test_unknown_server_is_rejected() {
        let monitor = test_monitor();
        assert!(matches!(
            monitor.set_server_status("ghost", ServerStatus::MAINT),
            Err(MonitorError::UnknownServer { .. })
        ));
    }

    #[test]
    fn test_add_remove_server() {
        let monitor = test_monitor();
        assert!(monitor.monitors_server("db1"));
        assert!(monitor.remove_server("db1"));
        assert!(!monitor.monitors_server("db1"));
        assert!(!monitor.remove_server("db1"));
    }

    #[test]
    fn test_to_json_shape() {
        let monitor = test_monitor();
        let json = monitor.to_json();
        assert_eq!(json["id"], "mon1");
        assert_eq!(json["attributes"]["module"], "replication");
        assert_eq!(json["attributes"]["state"], "Stopped");
        assert_eq!(json["relationships"]["servers"][0]["name"], "db1");
    }
}
