//! Generic connectivity-only monitor module.
//!
//! Tracks nothing beyond reachability; useful for backends whose flavor none
//! of the cluster-aware modules understands.

use async_trait::async_trait;

use crate::client::Connection;
use crate::server::MonitoredServer;

use super::MonitorModule;

#[derive(Debug, Default)]
pub struct GenericModule;

#[async_trait]
impl MonitorModule for GenericModule {
    fn kind(&self) -> &'static str {
        "generic"
    }

    fn permission_query(&self) -> &'static str {
        "SELECT 1"
    }

    async fn update_server_status(&self, _conn: &mut dyn Connection, _ms: &MonitoredServer) {}
}
