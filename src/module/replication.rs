//! Primary/replica monitor module.
//!
//! Role detection follows the usual replication topology probes: a server
//! replicating from somewhere is a slave, a writable server that is not
//! replicating is a master. `WAS_MASTER` stays latched once a server has
//! held the master role.

use async_trait::async_trait;

use crate::client::Connection;
use crate::server::MonitoredServer;
use crate::status::ServerStatus;

use super::{clear_role_bits, report_query_error, MonitorModule};

const IDENTITY_QUERY: &str = "SELECT @@server_id AS server_id, @@read_only AS read_only";
const SLAVE_STATUS_QUERY: &str = "SHOW SLAVE STATUS";

#[derive(Debug, Default)]
pub struct ReplicationModule;

#[async_trait]
impl MonitorModule for ReplicationModule {
    fn kind(&self) -> &'static str {
        "replication"
    }

    fn permission_query(&self) -> &'static str {
        SLAVE_STATUS_QUERY
    }

    async fn update_server_status(&self, conn: &mut dyn Connection, ms: &MonitoredServer) {
        let identity = match conn.query(IDENTITY_QUERY).await {
            Ok(result) => result,
            Err(e) => {
                report_query_error(ms, IDENTITY_QUERY, &e);
                return;
            }
        };

        if let Some(id) = identity.first("server_id").and_then(|v| v.parse().ok()) {
            ms.server.set_node_id(id);
        }
        let read_only = identity.first("read_only") == Some("1");

        let slave_status = match conn.query(SLAVE_STATUS_QUERY).await {
            Ok(result) => result,
            Err(e) => {
                report_query_error(ms, SLAVE_STATUS_QUERY, &e);
                return;
            }
        };

        let io_running = slave_status
            .first("Slave_IO_Running")
            .is_some_and(|v| v.starts_with("Yes"));
        let sql_running = slave_status.first("Slave_SQL_Running") == Some("Yes");
        let is_slave = io_running && sql_running;

        if let Some(master_id) = slave_status
            .first("Master_Server_Id")
            .and_then(|v| v.parse().ok())
        {
            ms.server.set_master_id(master_id);
        } else if slave_status.is_empty() {
            ms.server.set_master_id(0);
        }

        clear_role_bits(ms);
        if is_slave {
            ms.set_pending(ServerStatus::SLAVE);
        } else if !read_only {
            ms.set_pending(ServerStatus::MASTER | ServerStatus::WAS_MASTER);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, QueryResult};
    use crate::config::ServerConfig;
    use crate::server::Server;

    struct ReplConn {
        read_only: &'static str,
        slave_rows: Vec<(&'static str, &'static str, &'static str)>,
    }

    #[async_trait]
    impl Connection for ReplConn {
        async fn ping(&mut self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn query(&mut self, sql: &str) -> Result<QueryResult, ClientError> {
            if sql.starts_with("SELECT @@server_id") {
                Ok(QueryResult {
                    columns: vec!["server_id".into(), "read_only".into()],
                    rows: vec![vec![Some("7".into()), Some(self.read_only.into())]],
                })
            } else {
                Ok(QueryResult {
                    columns: vec![
                        "Slave_IO_Running".into(),
                        "Slave_SQL_Running".into(),
                        "Master_Server_Id".into(),
                    ],
                    rows: self
                        .slave_rows
                        .iter()
                        .map(|(io, sql, id)| {
                            vec![Some(io.to_string()), Some(sql.to_string()), Some(id.to_string())]
                        })
                        .collect(),
                })
            }
        }
    }

    fn monitored() -> MonitoredServer {
        let ms = MonitoredServer::new(Server::new(ServerConfig {
            name: "db1".into(),
            address: "10.0.0.1".into(),
            port: 3306,
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_threshold: Default::default(),
        }));
        ms.stash_status();
        ms.set_pending(ServerStatus::RUNNING);
        ms
    }

    #[tokio::test]
    async fn test_writable_server_becomes_master() {
        let ms = monitored();
        let mut conn = ReplConn {
            read_only: "0",
            slave_rows: vec![],
        };

        ReplicationModule.update_server_status(&mut conn, &ms).await;
        let pending = ms.pending_status();
        assert!(pending.is_master());
        assert!(pending.contains(ServerStatus::WAS_MASTER));
        assert!(!pending.is_slave());
        assert_eq!(ms.server.node_id(), 7);
    }

    #[tokio::test]
    async fn test_replicating_server_becomes_slave() {
        let ms = monitored();
        let mut conn = ReplConn {
            read_only: "1",
            slave_rows: vec![("Yes", "Yes", "3")],
        };

        ReplicationModule.update_server_status(&mut conn, &ms).await;
        let pending = ms.pending_status();
        assert!(pending.is_slave());
        assert!(!pending.is_master());
        assert_eq!(ms.server.master_id(), 3);
    }

    #[tokio::test]
    async fn test_broken_replication_is_not_a_slave() {
        let ms = monitored();
        let mut conn = ReplConn {
            read_only: "1",
            slave_rows: vec![("Connecting", "Yes", "3")],
        };

        ReplicationModule.update_server_status(&mut conn, &ms).await;
        let pending = ms.pending_status();
        assert!(!pending.is_slave());
        assert!(!pending.is_master());
    }

    #[tokio::test]
    async fn test_was_master_survives_role_loss() {
        let ms = monitored();
        let mut conn = ReplConn {
            read_only: "0",
            slave_rows: vec![],
        };
        ReplicationModule.update_server_status(&mut conn, &ms).await;
        assert!(ms.pending_status().is_master());

        // Demoted to read-only: MASTER clears but WAS_MASTER stays.
        let mut conn = ReplConn {
            read_only: "1",
            slave_rows: vec![],
        };
        ReplicationModule.update_server_status(&mut conn, &ms).await;
        let pending = ms.pending_status();
        assert!(!pending.is_master());
        assert!(pending.contains(ServerStatus::WAS_MASTER));
    }

    #[test]
    fn test_select_master_prefers_first_pending_master() {
        let a = std::sync::Arc::new(monitored());
        let b = std::sync::Arc::new(monitored());
        b.set_pending(ServerStatus::MASTER);

        let servers = vec![a, b.clone()];
        assert_eq!(
            ReplicationModule.select_master(&servers).as_deref(),
            Some("db1")
        );
    }
}
