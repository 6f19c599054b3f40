//! Ping-or-connect probing of one backend.
//!
//! A live handle that still answers a ping is reused; anything else is torn
//! down and reconnected with the configured retry budget.

use tracing::error;

use crate::client::{ClientError, Connector};
use crate::config::ConnectionSettings;
use crate::secrets::Secrets;
use crate::server::MonitoredServer;

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The existing connection answered a ping.
    ExistingOk,
    /// A fresh connect succeeded within the attempt budget.
    NewConnOk,
    /// Every attempt failed and the last one ran into the connect timeout.
    Timeout,
    /// Every attempt failed short of the timeout.
    Refused,
}

impl ConnectOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, ConnectOutcome::ExistingOk | ConnectOutcome::NewConnOk)
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectOutcome::ExistingOk => "existing_ok",
            ConnectOutcome::NewConnOk => "newconn_ok",
            ConnectOutcome::Timeout => "timeout",
            ConnectOutcome::Refused => "refused",
        }
    }
}

/// Probe result with the final error for classification and logging.
#[derive(Debug)]
pub struct ProbeResult {
    pub outcome: ConnectOutcome,
    pub error: Option<ClientError>,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Whether the probe failed because the backend denied access.
    pub fn is_access_denied(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.is_access_denied())
    }
}

/// Ping the stored connection or establish a new one.
///
/// On success the connection is back in the server's slot. Server-specific
/// monitor credentials override the monitor defaults when set; the password
/// is decrypted right before the attempt and zeroed on return.
pub async fn ping_or_connect(
    connector: &dyn Connector,
    ms: &MonitoredServer,
    settings: &ConnectionSettings,
    secrets: &Secrets,
) -> ProbeResult {
    if let Some(mut conn) = ms.take_conn() {
        match conn.ping().await {
            Ok(()) => {
                ms.put_conn(conn);
                return ProbeResult {
                    outcome: ConnectOutcome::ExistingOk,
                    error: None,
                };
            }
            Err(_) => drop(conn),
        }
    }

    let server = &ms.server;
    let (user, password) = if server.monitor_user().is_empty() {
        (settings.user.as_str(), settings.password.as_str())
    } else {
        (server.monitor_user(), server.monitor_password())
    };
    let password = secrets.decrypt(password);

    let mut last_error = None;
    for _ in 0..settings.connect_attempts.max(1) {
        match connector
            .connect(&server.address, server.port, user, &password, settings)
            .await
        {
            Ok(conn) => {
                ms.put_conn(conn);
                return ProbeResult {
                    outcome: ConnectOutcome::NewConnOk,
                    error: None,
                };
            }
            Err(e) => last_error = Some(e),
        }
    }

    let outcome = match last_error {
        Some(ClientError::Timeout) => ConnectOutcome::Timeout,
        _ => ConnectOutcome::Refused,
    };

    ProbeResult {
        outcome,
        error: last_error,
    }
}

/// Log why a backend could not be reached; called once per down-transition.
pub fn log_connect_error(monitor: &str, ms: &MonitoredServer, result: &ProbeResult) {
    debug_assert!(!result.is_ok());
    let server = &ms.server;
    let reason = result
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_default();

    if result.outcome == ConnectOutcome::Timeout {
        error!(
            monitor = %monitor,
            server = %server.name(),
            endpoint = %server.endpoint(),
            error = %reason,
            "Monitor timed out when connecting to server"
        );
    } else {
        error!(
            monitor = %monitor,
            server = %server.name(),
            endpoint = %server.endpoint(),
            error = %reason,
            "Monitor was unable to connect to server"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Connection, QueryResult};
    use crate::config::ServerConfig;
    use crate::server::Server;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeConn {
        ping_ok: bool,
    }

    #[async_trait]
    impl Connection for FakeConn {
        async fn ping(&mut self) -> Result<(), ClientError> {
            if self.ping_ok {
                Ok(())
            } else {
                Err(ClientError::Disconnected)
            }
        }

        async fn query(&mut self, _sql: &str) -> Result<QueryResult, ClientError> {
            Ok(QueryResult::default())
        }
    }

    struct FakeConnector {
        attempts: AtomicU32,
        fail_with: fn() -> Option<ClientError>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _address: &str,
            _port: u16,
            _user: &str,
            _password: &str,
            _settings: &ConnectionSettings,
        ) -> Result<Box<dyn Connection>, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match (self.fail_with)() {
                None => Ok(Box::new(FakeConn { ping_ok: true })),
                Some(e) => Err(e),
            }
        }
    }

    fn monitored(name: &str) -> MonitoredServer {
        MonitoredServer::new(Server::new(ServerConfig {
            name: name.into(),
            address: "127.0.0.1".into(),
            port: 3306,
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_threshold: Default::default(),
        }))
    }

    #[tokio::test]
    async fn test_existing_connection_is_reused() {
        let ms = monitored("db1");
        ms.put_conn(Box::new(FakeConn { ping_ok: true }));

        let connector = FakeConnector {
            attempts: AtomicU32::new(0),
            fail_with: || Some(ClientError::Disconnected),
        };
        let result = ping_or_connect(
            &connector,
            &ms,
            &ConnectionSettings::default(),
            &Secrets::plaintext(),
        )
        .await;

        assert_eq!(result.outcome, ConnectOutcome::ExistingOk);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        assert!(ms.take_conn().is_some());
    }

    #[tokio::test]
    async fn test_failed_ping_reconnects() {
        let ms = monitored("db1");
        ms.put_conn(Box::new(FakeConn { ping_ok: false }));

        let connector = FakeConnector {
            attempts: AtomicU32::new(0),
            fail_with: || None,
        };
        let result = ping_or_connect(
            &connector,
            &ms,
            &ConnectionSettings::default(),
            &Secrets::plaintext(),
        )
        .await;

        assert_eq!(result.outcome, ConnectOutcome::NewConnOk);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(ms.take_conn().is_some());
    }

    #[tokio::test]
    async fn test_all_attempts_exhausted_is_refused() {
        let ms = monitored("db1");
        let connector = FakeConnector {
            attempts: AtomicU32::new(0),
            fail_with: || Some(ClientError::Connect("refused".into())),
        };
        let settings = ConnectionSettings {
            connect_attempts: 3,
            ..Default::default()
        };

        let result = ping_or_connect(&connector, &ms, &settings, &Secrets::plaintext()).await;
        assert_eq!(result.outcome, ConnectOutcome::Refused);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(ms.take_conn().is_none());
    }

    #[tokio::test]
    async fn test_timeout_classification() {
        let ms = monitored("db1");
        let connector = FakeConnector {
            attempts: AtomicU32::new(0),
            fail_with: || Some(ClientError::Timeout),
        };

        let result = ping_or_connect(
            &connector,
            &ms,
            &ConnectionSettings::default(),
            &Secrets::plaintext(),
        )
        .await;
        assert_eq!(result.outcome, ConnectOutcome::Timeout);
        assert!(!result.is_access_denied());
    }

    #[tokio::test]
    async fn test_auth_failure_is_classified() {
        let ms = monitored("db1");
        let connector = FakeConnector {
            attempts: AtomicU32::new(0),
            fail_with: || {
                Some(ClientError::Server {
                    code: crate::client::er::ACCESS_DENIED,
                    message: "Access denied".into(),
                })
            },
        };

        let result = ping_or_connect(
            &connector,
            &ms,
            &ConnectionSettings::default(),
            &Secrets::plaintext(),
        )
        .await;
        assert_eq!(result.outcome, ConnectOutcome::Refused);
        assert!(result.is_access_denied());
    }
}
