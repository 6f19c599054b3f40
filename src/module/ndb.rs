//! NDB cluster monitor module.

use async_trait::async_trait;

use crate::client::Connection;
use crate::server::MonitoredServer;
use crate::status::ServerStatus;

use super::{clear_role_bits, report_query_error, MonitorModule};

const READY_NODES_QUERY: &str = "SHOW STATUS LIKE 'Ndb_number_of_ready_data_nodes'";

#[derive(Debug, Default)]
pub struct NdbModule;

#[async_trait]
impl MonitorModule for NdbModule {
    fn kind(&self) -> &'static str {
        "ndbcluster"
    }

    fn permission_query(&self) -> &'static str {
        READY_NODES_QUERY
    }

    async fn update_server_status(&self, conn: &mut dyn Connection, ms: &MonitoredServer) {
        let result = match conn.query(READY_NODES_QUERY).await {
            Ok(result) => result,
            Err(e) => {
                report_query_error(ms, READY_NODES_QUERY, &e);
                return;
            }
        };

        let ready_nodes: u32 = result
            .first("Value")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        clear_role_bits(ms);
        if ready_nodes > 0 {
            ms.set_pending(ServerStatus::NDB);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, QueryResult};
    use crate::config::ServerConfig;
    use crate::server::Server;

    struct NdbConn {
        ready: &'static str,
    }

    #[async_trait]
    impl Connection for NdbConn {
        async fn ping(&mut self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn query(&mut self, _sql: &str) -> Result<QueryResult, ClientError> {
            Ok(QueryResult {
                columns: vec!["Variable_name".into(), "Value".into()],
                rows: vec![vec![
                    Some("Ndb_number_of_ready_data_nodes".into()),
                    Some(self.ready.into()),
                ]],
            })
        }
    }

    fn monitored() -> MonitoredServer {
        let ms = MonitoredServer::new(Server::new(ServerConfig {
            name: "ndb1".into(),
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
    async fn test_ready_data_nodes_set_ndb_bit() {
        let ms = monitored();
        let mut conn = NdbConn { ready: "2" };
        NdbModule.update_server_status(&mut conn, &ms).await;
        assert!(ms.pending_status().contains(ServerStatus::NDB));
    }

    #[tokio::test]
    async fn test_no_ready_nodes_clears_ndb_bit() {
        let ms = monitored();
        ms.set_pending(ServerStatus::NDB);
        let mut conn = NdbConn { ready: "0" };
        NdbModule.update_server_status(&mut conn, &ms).await;
        assert!(!ms.pending_status().contains(ServerStatus::NDB));
    }
}
