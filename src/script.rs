//! External failover/notification script execution.
//!
//! The configured command line is tokenized, `$`-tokens are expanded from the
//! live topology and the command runs under the configured timeout. Script
//! failures are logged and never suppress later events.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info};

use crate::config::ConnectionSettings;
use crate::event::MonitorEvent;
use crate::server::MonitoredServer;
use crate::status::ServerStatus;

/// Exit status used for internal launch failures.
pub const LAUNCH_FAILED: i32 = -1;

/// Split a command line into argv, honoring single and double quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }

    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Replace every case-insensitive occurrence of `token` (e.g. `$INITIATOR`).
fn substitute(arg: &str, token: &str, value: &str) -> String {
    debug_assert!(token.starts_with('$') && token.is_ascii());
    let haystack = arg.to_ascii_uppercase();
    let needle = token.to_ascii_uppercase();

    let mut out = String::with_capacity(arg.len());
    let mut pos = 0;
    while let Some(found) = haystack[pos..].find(&needle) {
        let at = pos + found;
        out.push_str(&arg[pos..at]);
        out.push_str(value);
        pos = at + needle.len();
    }
    out.push_str(&arg[pos..]);
    out
}

/// Render `[addr]:port` of every server matching `status_bits` (0 = all),
/// optionally with credentials in `user:password@` form.
fn node_names(
    servers: &[Arc<MonitoredServer>],
    status_bits: u64,
    with_credentials: bool,
    conn: &ConnectionSettings,
) -> String {
    let mut parts = Vec::new();
    for ms in servers {
        let server = &ms.server;
        if status_bits != 0 && !server.status().contains(status_bits) {
            continue;
        }

        if with_credentials {
            let (user, password) = if server.monitor_user().is_empty() {
                (conn.user.as_str(), conn.password.as_str())
            } else {
                (server.monitor_user(), server.monitor_password())
            };
            parts.push(format!("{user}:{password}@{}", server.endpoint()));
        } else {
            parts.push(server.endpoint());
        }
    }
    parts.join(",")
}

fn parent_node(servers: &[Arc<MonitoredServer>], initiator: &MonitoredServer) -> String {
    let master_id = initiator.server.master_id();
    if master_id <= 0 {
        return String::new();
    }
    servers
        .iter()
        .find(|ms| ms.server.node_id() == master_id)
        .map(|ms| ms.server.endpoint())
        .unwrap_or_default()
}

fn child_nodes(servers: &[Arc<MonitoredServer>], initiator: &MonitoredServer) -> String {
    let node_id = initiator.server.node_id();
    if node_id <= 0 {
        return String::new();
    }
    servers
        .iter()
        .filter(|ms| ms.server.master_id() == node_id)
        .map(|ms| ms.server.endpoint())
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand every recognized token in the tokenized command line.
pub fn substitute_arguments(
    argv: &[String],
    initiator: &Arc<MonitoredServer>,
    event: MonitorEvent,
    servers: &[Arc<MonitoredServer>],
    conn: &ConnectionSettings,
) -> Vec<String> {
    let contains = |token: &str| {
        let needle = token.to_ascii_uppercase();
        argv.iter().any(|a| a.to_ascii_uppercase().contains(&needle))
    };

    let mut expansions: Vec<(&str, String)> = Vec::new();
    if contains("$INITIATOR") {
        expansions.push(("$INITIATOR", initiator.server.endpoint()));
    }
    if contains("$PARENT") {
        expansions.push(("$PARENT", parent_node(servers, initiator)));
    }
    if contains("$CHILDREN") {
        expansions.push(("$CHILDREN", child_nodes(servers, initiator)));
    }
    if contains("$EVENT") {
        expansions.push(("$EVENT", event.name().to_string()));
    }
    if contains("$CREDENTIALS") {
        expansions.push(("$CREDENTIALS", node_names(servers, 0, true, conn)));
    }
    if contains("$NODELIST") {
        expansions.push((
            "$NODELIST",
            node_names(servers, ServerStatus::RUNNING, false, conn),
        ));
    }
    if contains("$MASTERLIST") {
        expansions.push((
            "$MASTERLIST",
            node_names(servers, ServerStatus::MASTER, false, conn),
        ));
    }
    if contains("$SLAVELIST") {
        expansions.push((
            "$SLAVELIST",
            node_names(servers, ServerStatus::SLAVE, false, conn),
        ));
    }
    if contains("$SYNCEDLIST") {
        expansions.push((
            "$SYNCEDLIST",
            node_names(servers, ServerStatus::JOINED, false, conn),
        ));
    }
    if contains("$LIST") {
        expansions.push(("$LIST", node_names(servers, 0, false, conn)));
    }

    argv.iter()
        .map(|arg| {
            let mut arg = arg.clone();
            for (token, value) in &expansions {
                arg = substitute(&arg, token, value);
            }
            arg
        })
        .collect()
}

/// Launch the monitor script for one event. Returns the exit code, or
/// [`LAUNCH_FAILED`] when the process could not be run to completion.
pub async fn launch_script(
    monitor: &str,
    script: &str,
    script_timeout: Duration,
    initiator: &Arc<MonitoredServer>,
    event: MonitorEvent,
    servers: &[Arc<MonitoredServer>],
    conn: &ConnectionSettings,
) -> i32 {
    let argv = tokenize(script);
    if argv.is_empty() {
        error!(monitor = %monitor, "Failed to initialize script: empty command line");
        return LAUNCH_FAILED;
    }

    let argv = substitute_arguments(&argv, initiator, event, servers, conn);

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(
                monitor = %monitor,
                script = %argv[0],
                event = %event.name(),
                error = %e,
                "Failed to execute script on server state change event"
            );
            return LAUNCH_FAILED;
        }
    };

    let status = match timeout(script_timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            error!(
                monitor = %monitor,
                script = %argv[0],
                event = %event.name(),
                error = %e,
                "Failed to wait for script"
            );
            return LAUNCH_FAILED;
        }
        Err(_) => {
            let _ = child.kill().await;
            error!(
                monitor = %monitor,
                script = %argv[0],
                event = %event.name(),
                timeout_secs = script_timeout.as_secs(),
                "Script exceeded its timeout and was killed"
            );
            return LAUNCH_FAILED;
        }
    };

    let code = status.code().unwrap_or(LAUNCH_FAILED);
    if code == 0 {
        // Reconstruct the full command for the log line, skipping arguments
        // whose expansion came out empty.
        let line = argv
            .iter()
            .filter(|a| !a.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            monitor = %monitor,
            command = %line,
            event = %event.name(),
            "Executed monitor script"
        );
    } else {
        error!(
            monitor = %monitor,
            script = %argv[0],
            event = %event.name(),
            exit_code = code,
            "Script returned a non-zero exit code"
        );
    }

    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;

    fn monitored(name: &str, address: &str, port: u16) -> Arc<MonitoredServer> {
        Arc::new(MonitoredServer::new(Server::new(ServerConfig {
            name: name.into(),
            address: address.into(),
            port,
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_threshold: Default::default(),
        })))
    }

    fn topology() -> Vec<Arc<MonitoredServer>> {
        let master = monitored("db1", "10.0.0.1", 3306);
        master.server.set_node_id(1);
        master
            .server
            .set_status(ServerStatus::RUNNING | ServerStatus::MASTER);

        let slave = monitored("db2", "10.0.0.2", 3306);
        slave.server.set_node_id(2);
        slave.server.set_master_id(1);
        slave
            .server
            .set_status(ServerStatus::RUNNING | ServerStatus::SLAVE);

        let down = monitored("db3", "10.0.0.3", 3306);
        down.server.set_node_id(3);
        down.server.set_master_id(1);

        vec![master, slave, down]
    }

    #[test]
    fn test_tokenize_with_quotes() {
        assert_eq!(
            tokenize("/bin/notify --event $EVENT"),
            vec!["/bin/notify", "--event", "$EVENT"]
        );
        assert_eq!(
            tokenize(r#"/bin/notify "two words" 'single quoted'"#),
            vec!["/bin/notify", "two words", "single quoted"]
        );
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_substitute_is_case_insensitive() {
        assert_eq!(substitute("--x=$event", "$EVENT", "master_up"), "--x=master_up");
        assert_eq!(substitute("$EVENT/$Event", "$EVENT", "e"), "e/e");
        assert_eq!(substitute("no tokens", "$EVENT", "e"), "no tokens");
    }

    #[test]
    fn test_argument_expansion() {
        let servers = topology();
        let initiator = servers[1].clone();

        let argv: Vec<String> = ["/bin/notify", "--from=$INITIATOR", "--parent=$PARENT",
            "--event=$event", "--nodes=$NODELIST", "--all=$LIST", "--masters=$MASTERLIST"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let out = substitute_arguments(
            &argv,
            &initiator,
            MonitorEvent::SlaveUp,
            &servers,
            &ConnectionSettings::default(),
        );

        assert_eq!(out[1], "--from=[10.0.0.2]:3306");
        assert_eq!(out[2], "--parent=[10.0.0.1]:3306");
        assert_eq!(out[3], "--event=slave_up");
        assert_eq!(out[4], "--nodes=[10.0.0.1]:3306,[10.0.0.2]:3306");
        assert_eq!(
            out[5],
            "--all=[10.0.0.1]:3306,[10.0.0.2]:3306,[10.0.0.3]:3306"
        );
        assert_eq!(out[6], "--masters=[10.0.0.1]:3306");
    }

    #[test]
    fn test_children_expansion() {
        let servers = topology();
        let initiator = servers[0].clone();

        let argv = vec!["x".to_string(), "$CHILDREN".to_string()];
        let out = substitute_arguments(
            &argv,
            &initiator,
            MonitorEvent::MasterDown,
            &servers,
            &ConnectionSettings::default(),
        );
        assert_eq!(out[1], "[10.0.0.2]:3306,[10.0.0.3]:3306");
    }

    #[test]
    fn test_credentials_expansion() {
        let servers = topology();
        let initiator = servers[0].clone();
        let conn = ConnectionSettings {
            user: "mon".into(),
            password: "pw".into(),
            ..Default::default()
        };

        let argv = vec!["x".to_string(), "$CREDENTIALS".to_string()];
        let out = substitute_arguments(&argv, &initiator, MonitorEvent::MasterDown, &servers, &conn);
        assert_eq!(
            out[1],
            "mon:pw@[10.0.0.1]:3306,mon:pw@[10.0.0.2]:3306,mon:pw@[10.0.0.3]:3306"
        );
    }

    #[tokio::test]
    async fn test_launch_script_success_and_failure() {
        let servers = topology();
        let initiator = servers[0].clone();
        let conn = ConnectionSettings::default();

        let code = launch_script(
            "mon",
            "/bin/true",
            Duration::from_secs(5),
            &initiator,
            MonitorEvent::MasterUp,
            &servers,
            &conn,
        )
        .await;
        assert_eq!(code, 0);

        let code = launch_script(
            "mon",
            "/bin/false",
            Duration::from_secs(5),
            &initiator,
            MonitorEvent::MasterUp,
            &servers,
            &conn,
        )
        .await;
        assert_ne!(code, 0);

        let code = launch_script(
            "mon",
            "/nonexistent/script.sh",
            Duration::from_secs(5),
            &initiator,
            MonitorEvent::MasterUp,
            &servers,
            &conn,
        )
        .await;
        assert_eq!(code, LAUNCH_FAILED);
    }

    #[tokio::test]
    async fn test_launch_script_timeout_kills() {
        let servers = topology();
        let initiator = servers[0].clone();

        let code = launch_script(
            "mon",
            "/bin/sleep 30",
            Duration::from_millis(100),
            &initiator,
            MonitorEvent::MasterUp,
            &servers,
            &ConnectionSettings::default(),
        )
        .await;
        assert_eq!(code, LAUNCH_FAILED);
    }
}
