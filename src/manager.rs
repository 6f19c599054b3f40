//! Process-wide monitor registry.
//!
//! A single mutex protects the ordered monitor list; iteration happens under
//! the lock through a callback that may short-circuit. Structural changes to
//! a running monitor (adding or removing a server) stop it, mutate the list
//! and start it again.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::config::{Config, MonitorSettings};
use crate::monitor::{Monitor, MonitorDeps, MonitorError, MonitorState};
use crate::secrets::Secrets;
use crate::server::Server;

static GLOBAL: OnceLock<MonitorManager> = OnceLock::new();

pub struct MonitorManager {
    /// Global list of monitors, newest first.
    monitors: Mutex<Vec<Arc<Monitor>>>,
    datadir: PathBuf,
    persistdir: PathBuf,
    deps: MonitorDeps,
}

impl MonitorManager {
    pub fn new(
        datadir: impl Into<PathBuf>,
        persistdir: impl Into<PathBuf>,
        deps: MonitorDeps,
    ) -> Self {
        Self {
            monitors: Mutex::new(Vec::new()),
            datadir: datadir.into(),
            persistdir: persistdir.into(),
            deps,
        }
    }

    /// The process-wide registry, created with production defaults on first
    /// use. [`install_global`](Self::install_global) replaces the defaults
    /// when called before anything touches the registry.
    pub fn global() -> &'static MonitorManager {
        GLOBAL.get_or_init(|| {
            MonitorManager::new(
                "/var/lib/argus",
                "/var/lib/argus/conf.d",
                MonitorDeps::production(),
            )
        })
    }

    /// Install a custom-configured registry as the process-wide one.
    /// Returns false when the registry is already initialized.
    pub fn install_global(manager: MonitorManager) -> bool {
        GLOBAL.set(manager).is_ok()
    }

    /// Build a registry and its monitors from a loaded configuration.
    ///
    /// Server definitions are shared: each monitor's `servers` list names
    /// entries of the top-level server table.
    pub fn from_config(config: &Config) -> Result<Self, MonitorError> {
        let secrets = match &config.key_file {
            Some(path) => match Secrets::from_key_file(path) {
                Ok(secrets) => Arc::new(secrets),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to load encryption key file, treating passwords as plaintext");
                    Arc::new(Secrets::plaintext())
                }
            },
            None => Arc::new(Secrets::plaintext()),
        };

        let mut deps = MonitorDeps::production();
        deps.secrets = secrets;
        let manager = Self::new(config.datadir.clone(), config.persistdir.clone(), deps);

        let servers: std::collections::HashMap<&str, Arc<Server>> = config
            .servers
            .iter()
            .map(|sc| (sc.name.as_str(), Server::new(sc.clone())))
            .collect();

        for mon_cfg in &config.monitors {
            let mut members = Vec::new();
            for name in &mon_cfg.settings.servers {
                let server = servers.get(name.as_str()).cloned().ok_or_else(|| {
                    MonitorError::UnknownServer {
                        monitor: mon_cfg.name.clone(),
                        server: name.clone(),
                    }
                })?;
                members.push(server);
            }
            manager.create_monitor(
                &mon_cfg.name,
                &mon_cfg.module,
                mon_cfg.settings.clone(),
                members,
            )?;
        }

        Ok(manager)
    }

    /// Call `apply` on every monitor until it returns false.
    pub fn foreach<F: FnMut(&Arc<Monitor>) -> bool>(&self, mut apply: F) {
        let monitors = self.monitors.lock();
        for monitor in monitors.iter() {
            if !apply(monitor) {
                break;
            }
        }
    }

    /// Create a monitor and insert it at the front of the registry.
    ///
    /// A deactivated monitor with the same name and module is repurposed
    /// instead of building a new instance.
    pub fn create_monitor(
        &self,
        name: &str,
        module: &str,
        settings: MonitorSettings,
        servers: Vec<Arc<Server>>,
    ) -> Result<Arc<Monitor>, MonitorError> {
        if self.find(name).is_some() {
            return Err(MonitorError::DuplicateMonitor(name.to_string()));
        }

        for server in &servers {
            if let Some(owner) = self.server_in_use(server.name()) {
                error!(
                    server = %server.name(),
                    monitor = %owner.name(),
                    "Server is already monitored"
                );
                return Err(MonitorError::DuplicateServer(server.name().to_string()));
            }
        }

        if let Some(existing) = self.find_deactivated(name, module) {
            debug_assert_eq!(existing.state(), MonitorState::Stopped);
            existing.reconfigure(settings);
            let old_names: Vec<String> = existing
                .servers()
                .iter()
                .map(|ms| ms.server.name().to_string())
                .collect();
            for old in old_names {
                existing.remove_server(&old);
            }
            for server in servers {
                existing.add_server(server);
            }
            existing.reactivate();
            info!(monitor = %name, module = %module, "Repurposed deactivated monitor");
            return Ok(existing);
        }

        let monitor = Monitor::new(name, module, settings, self.datadir.clone(), self.deps.clone())?;
        for server in servers {
            if monitor.monitors_server(server.name()) {
                return Err(MonitorError::DuplicateServer(server.name().to_string()));
            }
            monitor.add_server(server);
        }

        self.monitors.lock().insert(0, monitor.clone());
        info!(monitor = %name, module = %module, "Created monitor");
        Ok(monitor)
    }

    /// Find an active monitor by name.
    pub fn find(&self, name: &str) -> Option<Arc<Monitor>> {
        let mut found = None;
        self.foreach(|monitor| {
            if monitor.name() == name && monitor.is_active() {
                found = Some(monitor.clone());
            }
            found.is_none()
        });
        found
    }

    fn find_deactivated(&self, name: &str, module: &str) -> Option<Arc<Monitor>> {
        let mut found = None;
        self.foreach(|monitor| {
            if monitor.name() == name && monitor.module_name() == module && !monitor.is_active() {
                found = Some(monitor.clone());
            }
            found.is_none()
        });
        found
    }

    /// The active monitor owning this server, if any.
    pub fn server_in_use(&self, server_name: &str) -> Option<Arc<Monitor>> {
        let mut found = None;
        self.foreach(|monitor| {
            if monitor.is_active() && monitor.monitors_server(server_name) {
                found = Some(monitor.clone());
            }
            found.is_none()
        });
        found
    }

    pub async fn start_monitor(&self, name: &str) -> Result<(), MonitorError> {
        let monitor = self
            .find(name)
            .ok_or_else(|| MonitorError::UnknownMonitor(name.to_string()))?;
        monitor.start().await
    }

    pub async fn stop_monitor(&self, name: &str) -> Result<(), MonitorError> {
        let monitor = self
            .find(name)
            .ok_or_else(|| MonitorError::UnknownMonitor(name.to_string()))?;
        monitor.stop().await;
        Ok(())
    }

    /// Start every active monitor; failures are logged, not propagated.
    pub async fn start_all(&self) {
        for monitor in self.active_monitors() {
            if let Err(e) = monitor.start().await {
                error!(monitor = %monitor.name(), error = %e, "Failed to start monitor");
            }
        }
    }

    pub async fn stop_all(&self) {
        for monitor in self.active_monitors() {
            monitor.stop().await;
        }
    }

    /// Logical removal; the instance is retained so a later create with the
    /// same name and module can repurpose it. The monitor must be stopped.
    pub fn deactivate(&self, name: &str) -> Result<(), MonitorError> {
        let monitor = self
            .find(name)
            .ok_or_else(|| MonitorError::UnknownMonitor(name.to_string()))?;
        debug_assert_eq!(monitor.state(), MonitorState::Stopped);
        monitor.deactivate();
        info!(monitor = %name, "Deactivated monitor");
        Ok(())
    }

    /// Shutdown teardown: drain every monitor and release the registry.
    pub async fn destroy_all(&self) {
        self.stop_all().await;

        let monitors = std::mem::take(&mut *self.monitors.lock());
        for monitor in &monitors {
            debug_assert_eq!(monitor.state(), MonitorState::Stopped);
        }
    }

    /// Add a server to a monitor, restarting it when it was running.
    pub async fn add_server(
        &self,
        monitor_name: &str,
        server: Arc<Server>,
    ) -> Result<(), MonitorError> {
        if let Some(owner) = self.server_in_use(server.name()) {
            error!(
                server = %server.name(),
                monitor = %owner.name(),
                "Server is already monitored"
            );
            return Err(MonitorError::DuplicateServer(server.name().to_string()));
        }

        let monitor = self
            .find(monitor_name)
            .ok_or_else(|| MonitorError::UnknownMonitor(monitor_name.to_string()))?;

        let was_running = monitor.state() == MonitorState::Running;
        if was_running {
            monitor.stop().await;
        }

        monitor.add_server(server);

        if was_running {
            monitor.start().await?;
        }
        Ok(())
    }

    /// Remove a server from a monitor, restarting it when it was running.
    pub async fn remove_server(
        &self,
        monitor_name: &str,
        server_name: &str,
    ) -> Result<(), MonitorError> {
        let monitor = self
            .find(monitor_name)
            .ok_or_else(|| MonitorError::UnknownMonitor(monitor_name.to_string()))?;

        if !monitor.monitors_server(server_name) {
            return Err(MonitorError::UnknownServer {
                monitor: monitor_name.to_string(),
                server: server_name.to_string(),
            });
        }

        let was_running = monitor.state() == MonitorState::Running;
        if was_running {
            monitor.stop().await;
        }

        monitor.remove_server(server_name);

        if was_running {
            monitor.start().await?;
        }
        Ok(())
    }

    /// Tell the routing layer about every active monitor's membership.
    pub fn populate_services(&self) {
        self.foreach(|monitor| {
            if monitor.is_active() {
                for ms in monitor.servers() {
                    self.deps.services.server_added(monitor.name(), &ms.server);
                }
            }
            true
        });
    }

    /// (name, state) rows for the CLI listing.
    pub fn list(&self) -> Vec<(String, &'static str)> {
        let mut rows = Vec::new();
        self.foreach(|monitor| {
            if monitor.is_active() {
                rows.push((monitor.name().to_string(), monitor.state().as_str()));
            }
            true
        });
        rows
    }

    /// Snapshot of every active monitor.
    pub fn to_json(&self) -> serde_json::Value {
        let mut monitors = Vec::new();
        self.foreach(|monitor| {
            if monitor.is_active() {
                monitors.push(monitor.to_json());
            }
            true
        });
        serde_json::Value::Array(monitors)
    }

    /// Persist a monitor's configuration fragment via temp file and rename.
    pub fn serialize(&self, monitor: &Monitor) -> std::io::Result<()> {
        fs::create_dir_all(&self.persistdir)?;

        let tmp_path = self.persistdir.join(format!("{}.cnf.tmp", monitor.name()));
        if let Err(e) = fs::remove_file(&tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e);
            }
        }

        let mut file = fs::File::create(&tmp_path)?;
        if let Err(e) = write_config_fragment(&mut file, monitor) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        file.sync_all()?;
        drop(file);

        let final_path = self.persistdir.join(format!("{}.cnf", monitor.name()));
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        Ok(())
    }

    pub fn persistdir(&self) -> &Path {
        &self.persistdir
    }

    fn active_monitors(&self) -> Vec<Arc<Monitor>> {
        let mut monitors = Vec::new();
        self.foreach(|monitor| {
            if monitor.is_active() {
                monitors.push(monitor.clone());
            }
            true
        });
        monitors
    }
}

fn write_config_fragment(file: &mut impl Write, monitor: &Monitor) -> std::io::Result<()> {
    let settings = monitor.settings();

    writeln!(file, "[{}]", monitor.name())?;
    writeln!(file, "type=monitor")?;
    writeln!(file, "module={}", monitor.module_name())?;

    let server_names: Vec<String> = monitor
        .servers()
        .iter()
        .map(|ms| ms.server.name().to_string())
        .collect();
    if !server_names.is_empty() {
        writeln!(file, "servers={}", server_names.join(","))?;
    }

    if !settings.conn.user.is_empty() {
        writeln!(file, "user={}", settings.conn.user)?;
    }
    if !settings.conn.password.is_empty() {
        writeln!(file, "password={}", settings.conn.password)?;
    }

    writeln!(file, "monitor_interval={}", settings.interval)?;
    writeln!(file, "backend_connect_timeout={}", settings.conn.connect_timeout)?;
    writeln!(file, "backend_read_timeout={}", settings.conn.read_timeout)?;
    writeln!(file, "backend_write_timeout={}", settings.conn.write_timeout)?;
    writeln!(file, "backend_connect_attempts={}", settings.conn.connect_attempts)?;
    writeln!(file, "journal_max_age={}", settings.journal_max_age)?;

    if !settings.script.is_empty() {
        writeln!(file, "script={}", settings.script)?;
        writeln!(file, "script_timeout={}", settings.script_timeout)?;
        writeln!(file, "events={}", settings.events.names().join(","))?;
    }

    if settings.disk_space_check_interval > 0 {
        writeln!(
            file,
            "disk_space_check_interval={}",
            settings.disk_space_check_interval
        )?;
    }
    if !settings.disk_space_limits.is_empty() {
        writeln!(
            file,
            "disk_space_threshold={}",
            settings.disk_space_limits.to_config_string()
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn server(name: &str) -> Arc<Server> {
        Server::new(ServerConfig {
            name: name.into(),
            address: "10.0.0.1".into(),
            port: 3306,
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_threshold: Default::default(),
        })
    }

    fn manager() -> MonitorManager {
        let dir = std::env::temp_dir().join("argus-manager-tests");
        MonitorManager::new(dir.join("data"), dir.join("persist"), MonitorDeps::production())
    }

    #[test]
    fn test_create_and_find() {
        let manager = manager();
        let monitor = manager
            .create_monitor("mon1", "replication", MonitorSettings::default(), vec![server("db1")])
            .unwrap();
        assert_eq!(monitor.name(), "mon1");
        assert!(manager.find("mon1").is_some());
        assert!(manager.find("other").is_none());
        assert_eq!(manager.list(), vec![("mon1".to_string(), "Stopped")]);
    }

    #[test]
    fn test_newest_monitor_is_first() {
        let manager = manager();
        manager
            .create_monitor("mon1", "replication", MonitorSettings::default(), vec![])
            .unwrap();
        manager
            .create_monitor("mon2", "galera", MonitorSettings::default(), vec![])
            .unwrap();

        let mut names = Vec::new();
        manager.foreach(|m| {
            names.push(m.name().to_string());
            true
        });
        assert_eq!(names, vec!["mon2", "mon1"]);
    }

    #[test]
    fn test_foreach_short_circuits() {
        let manager = manager();
        manager
            .create_monitor("mon1", "replication", MonitorSettings::default(), vec![])
            .unwrap();
        manager
            .create_monitor("mon2", "galera", MonitorSettings::default(), vec![])
            .unwrap();

        let mut seen = 0;
        manager.foreach(|_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_duplicate_server_is_rejected() {
        let manager = manager();
        manager
            .create_monitor("mon1", "replication", MonitorSettings::default(), vec![server("db1")])
            .unwrap();

        let result = manager.create_monitor(
            "mon2",
            "replication",
            MonitorSettings::default(),
            vec![server("db1")],
        );
        assert!(matches!(result, Err(MonitorError::DuplicateServer(_))));
        assert_eq!(manager.server_in_use("db1").unwrap().name(), "mon1");
    }

    #[test]
    fn test_duplicate_monitor_name_is_rejected() {
        let manager = manager();
        manager
            .create_monitor("mon1", "replication", MonitorSettings::default(), vec![])
            .unwrap();
        assert!(matches!(
            manager.create_monitor("mon1", "replication", MonitorSettings::default(), vec![]),
            Err(MonitorError::DuplicateMonitor(_))
        ));
    }

    #[test]
    fn test_deactivate_and_repurpose() {
        let manager = manager();
        manager
            .create_monitor("mon1", "replication", MonitorSettings::default(), vec![server("db1")])
            .unwrap();
        manager.deactivate("mon1").unwrap();
        assert!(manager.find("mon1").is_none());
        // The deactivated monitor no longer owns its servers.
        assert!(manager.server_in_use("db1").is_none());

        // Same name and module: the instance is repurposed with new servers.
        let repurposed = manager
            .create_monitor("mon1", "replication", MonitorSettings::default(), vec![server("db2")])
            .unwrap();
        assert!(repurposed.is_active());
        assert!(repurposed.monitors_server("db2"));
        assert!(!repurposed.monitors_server("db1"));
        assert!(manager.find("mon1").is_some());
    }

    #[test]
    fn test_unknown_module_create_fails() {
        let manager = manager();
        assert!(matches!(
            manager.create_monitor("mon1", "bogus", MonitorSettings::default(), vec![]),
            Err(MonitorError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_from_config_builds_monitors() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            datadir = "{0}/data"
            persistdir = "{0}/persist"

            [[servers]]
            name = "db1"
            address = "10.0.0.1"

            [[servers]]
            name = "db2"
            address = "10.0.0.2"
            port = 3307

            [[monitors]]
            name = "cluster-a"
            module = "replication"
            monitor_interval = 500
            servers = ["db1", "db2"]
            "#,
            dir.path().display()
        );
        let config: crate::config::Config = toml::from_str(&toml).unwrap();

        let manager = MonitorManager::from_config(&config).unwrap();
        let monitor = manager.find("cluster-a").unwrap();
        assert_eq!(monitor.settings().interval, 500);
        assert!(monitor.monitors_server("db1"));
        assert!(monitor.monitors_server("db2"));
        assert_eq!(
            monitor.monitored_server("db2").unwrap().server.port,
            3307
        );
    }

    #[test]
    fn test_from_config_unknown_server_name() {
        let config: crate::config::Config = toml::from_str(
            r#"
            datadir = "/tmp/argus/data"
            persistdir = "/tmp/argus/persist"

            [[monitors]]
            name = "cluster-a"
            module = "replication"
            servers = ["ghost"]
            "#,
        )
        .unwrap();

        assert!(matches!(
            MonitorManager::from_config(&config),
            Err(MonitorError::UnknownServer { .. })
        ));
    }

    #[test]
    fn test_serialize_writes_cnf() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MonitorManager::new(
            dir.path().join("data"),
            dir.path().join("persist"),
            MonitorDeps::production(),
        );

        let mut settings = MonitorSettings::default();
        settings.conn.user = "monitor".into();
        settings.conn.password = "pw".into();
        settings.script = "/bin/notify $EVENT".into();

        let monitor = manager
            .create_monitor("mon1", "replication", settings, vec![server("db1"), server("db2")])
            .unwrap();
        manager.serialize(&monitor).unwrap();

        let content =
            fs::read_to_string(dir.path().join("persist").join("mon1.cnf")).unwrap();
        assert!(content.starts_with("[mon1]\n"));
        assert!(content.contains("type=monitor\n"));
        assert!(content.contains("module=replication\n"));
        assert!(content.contains("servers=db1,db2\n"));
        assert!(content.contains("user=monitor\n"));
        assert!(content.contains("monitor_interval=2000\n"));
        assert!(content.contains("script=/bin/notify $EVENT\n"));
        // No temp file left behind.
        assert!(!dir.path().join("persist").join("mon1.cnf.tmp").exists());
    }
}
