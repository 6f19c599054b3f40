//! Monitor module dispatch.
//!
//! A module owns the backend-flavor specific half of a tick: it inspects a
//! connected server and assigns role bits to the pending status. The worker
//! drives the capability set; module selection is a tagged construction at
//! monitor creation.

mod galera;
mod generic;
mod ndb;
mod replication;

pub use galera::GaleraModule;
pub use generic::GenericModule;
pub use ndb::NdbModule;
pub use replication::ReplicationModule;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

use crate::client::{ClientError, Connection};
use crate::config::MonitorSettings;
use crate::server::MonitoredServer;
use crate::status::ServerStatus;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Invalid monitor module configuration: {0}")]
    Config(String),
}

/// Capability set implemented by every monitor flavor.
#[async_trait]
pub trait MonitorModule: Send + Sync {
    /// Module identifier used in configuration and serialization.
    fn kind(&self) -> &'static str;

    /// Query run by the one-shot startup permission probe.
    fn permission_query(&self) -> &'static str;

    /// Apply settings before the worker starts.
    fn configure(&mut self, _settings: &MonitorSettings) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Hook run at the start of a tick, before any server is probed.
    async fn pre_tick(&self, _servers: &[Arc<MonitoredServer>]) {}

    /// Inspect one connected server and update its pending status.
    async fn update_server_status(&self, conn: &mut dyn Connection, ms: &MonitoredServer);

    /// Hook run after the probe loop, before pending statuses are published.
    async fn post_tick(&self, _servers: &[Arc<MonitoredServer>]) {}

    /// Module-specific reason to tick before the interval elapses.
    fn immediate_tick_required(&self) -> bool {
        false
    }

    /// Choose the root master once all servers have been probed.
    fn select_master(&self, servers: &[Arc<MonitoredServer>]) -> Option<String> {
        servers
            .iter()
            .find(|ms| {
                let pending = ms.pending_status();
                pending.is_running() && pending.is_master()
            })
            .map(|ms| ms.server.name().to_string())
    }

    /// Operator-facing diagnostics fragment.
    fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// Construct a module by name.
pub fn create_module(name: &str) -> Option<Box<dyn MonitorModule>> {
    match name.to_ascii_lowercase().as_str() {
        "replication" => Some(Box::new(ReplicationModule::default())),
        "galera" => Some(Box::new(GaleraModule::default())),
        "ndbcluster" => Some(Box::new(NdbModule::default())),
        "generic" => Some(Box::new(GenericModule::default())),
        _ => None,
    }
}

/// Log a failed module query the same way for every module.
pub(crate) fn report_query_error(ms: &MonitoredServer, sql: &str, err: &ClientError) {
    error!(
        server = %ms.server.name(),
        endpoint = %ms.server.endpoint(),
        query = %sql,
        error = %err,
        "Failed to execute query on server"
    );
}

/// Clear the role bits a module is about to reassign.
pub(crate) fn clear_role_bits(ms: &MonitoredServer) {
    ms.clear_pending(ServerStatus::ROLE_BITS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_module_by_name() {
        assert_eq!(create_module("replication").unwrap().kind(), "replication");
        assert_eq!(create_module("GALERA").unwrap().kind(), "galera");
        assert_eq!(create_module("ndbcluster").unwrap().kind(), "ndbcluster");
        assert_eq!(create_module("generic").unwrap().kind(), "generic");
        assert!(create_module("unknown").is_none());
    }
}
