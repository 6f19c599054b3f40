use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::event::EventSet;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding per-monitor journal subdirectories.
    pub datadir: PathBuf,
    /// Directory the manager serializes `<monitor>.cnf` fragments into.
    pub persistdir: PathBuf,
    /// Optional key file for decrypting `password` values.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

/// One backend server definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Per-server monitor credentials; empty means the monitor default applies.
    #[serde(default)]
    pub monitor_user: String,
    #[serde(default)]
    pub monitor_password: String,
    #[serde(default)]
    pub disk_space_threshold: DiskSpaceLimits,
}

fn default_server_port() -> u16 {
    3306
}

/// One monitor definition: a module plus its settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub name: String,
    pub module: String,
    #[serde(flatten)]
    pub settings: MonitorSettings,
}

/// Probe connection settings, shared by every server of a monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    /// Seconds allowed for one connect attempt.
    #[serde(rename = "backend_connect_timeout", default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(rename = "backend_read_timeout", default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(rename = "backend_write_timeout", default = "default_write_timeout")]
    pub write_timeout: u64,
    #[serde(rename = "backend_connect_attempts", default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Monitor username.
    #[serde(default)]
    pub user: String,
    /// Monitor password, possibly in encrypted form.
    #[serde(default)]
    pub password: String,
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_read_timeout() -> u64 {
    1
}

fn default_write_timeout() -> u64 {
    2
}

fn default_connect_attempts() -> u32 {
    1
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            connect_attempts: default_connect_attempts(),
            user: String::new(),
            password: String::new(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }
}

/// All recognized monitor configuration keys.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    #[serde(flatten)]
    pub conn: ConnectionSettings,
    /// Tick period in milliseconds.
    #[serde(rename = "monitor_interval", default = "default_interval")]
    pub interval: u64,
    /// Journal staleness threshold in seconds.
    #[serde(default = "default_journal_max_age")]
    pub journal_max_age: u64,
    /// Command line template launched on subscribed events.
    #[serde(default)]
    pub script: String,
    /// Script max runtime in seconds.
    #[serde(default = "default_script_timeout")]
    pub script_timeout: u64,
    /// Events the script subscribes to; empty list means all.
    #[serde(default)]
    pub events: EventSet,
    /// Milliseconds between disk space checks; 0 disables them.
    #[serde(default)]
    pub disk_space_check_interval: u64,
    /// Monitor-wide disk space limits; per-server limits take precedence.
    #[serde(rename = "disk_space_threshold", default)]
    pub disk_space_limits: DiskSpaceLimits,
    /// Ordered list of monitored server names.
    #[serde(default)]
    pub servers: Vec<String>,
}

fn default_interval() -> u64 {
    2000
}

fn default_journal_max_age() -> u64 {
    28800
}

fn default_script_timeout() -> u64 {
    90
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            conn: ConnectionSettings::default(),
            interval: default_interval(),
            journal_max_age: default_journal_max_age(),
            script: String::new(),
            script_timeout: default_script_timeout(),
            events: EventSet::default(),
            disk_space_check_interval: 0,
            disk_space_limits: DiskSpaceLimits::default(),
            servers: Vec::new(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout)
    }
}

/// `path:percent[,path:percent...]` limits; `*` applies to every path not
/// explicitly enumerated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct DiskSpaceLimits(BTreeMap<String, i32>);

impl DiskSpaceLimits {
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut limits = BTreeMap::new();
        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (path, percent) = entry
                .rsplit_once(':')
                .ok_or_else(|| format!("disk space threshold entry '{entry}' lacks ':'"))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(format!("disk space threshold entry '{entry}' has an empty path"));
            }
            let percent: i32 = percent
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage in disk space threshold '{entry}'"))?;
            if !(0..=100).contains(&percent) {
                return Err(format!(
                    "disk space threshold percentage {percent} is outside 0..=100"
                ));
            }
            limits.insert(path.to_string(), percent);
        }
        Ok(Self(limits))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.0.iter().map(|(path, pct)| (path.as_str(), *pct))
    }

    pub fn get(&self, path: &str) -> Option<i32> {
        self.0.get(path).copied()
    }

    /// The `*` wildcard limit, if configured.
    pub fn wildcard(&self) -> Option<i32> {
        self.get("*")
    }

    /// Render back to the configuration form.
    pub fn to_config_string(&self) -> String {
        self.0
            .iter()
            .map(|(path, pct)| format!("{path}:{pct}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl TryFrom<String> for DiskSpaceLimits {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}
