//! Galera cluster monitor module.
//!
//! A node reporting `wsrep_local_state = 4` (SYNCED) is a joined cluster
//! member.

use async_trait::async_trait;

use crate::client::Connection;
use crate::server::MonitoredServer;
use crate::status::ServerStatus;

use super::{clear_role_bits, report_query_error, MonitorModule};

const WSREP_STATE_QUERY: &str = "SHOW STATUS LIKE 'wsrep_local_state'";

/// wsrep_local_state value of a fully synced node.
const WSREP_STATE_SYNCED: &str = "4";

#[derive(Debug, Default)]
pub struct GaleraModule;

#[async_trait]
impl MonitorModule for GaleraModule {
    fn kind(&self) -> &'static str {
        "galera"
    }

    fn permission_query(&self) -> &'static str {
        WSREP_STATE_QUERY
    }

    async fn update_server_status(&self, conn: &mut dyn Connection, ms: &MonitoredServer) {
        let result = match conn.query(WSREP_STATE_QUERY).await {
            Ok(result) => result,
            Err(e) => {
                report_query_error(ms, WSREP_STATE_QUERY, &e);
                return;
            }
        };

        clear_role_bits(ms);
        if result.first("Value") == Some(WSREP_STATE_SYNCED) {
            ms.set_pending(ServerStatus::JOINED);
        }
    }
}
