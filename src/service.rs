//! Contract between the monitoring core and the request-routing layer.
//!
//! The core never makes routing decisions; it only tells the routing layer
//! which servers a monitor covers and when lingering client connections to a
//! failed server must be torn down.

use std::sync::Arc;

use crate::server::Server;

/// Routing-layer callbacks invoked by monitors and the manager.
pub trait ServiceSink: Send + Sync {
    /// A server joined a monitor's set.
    fn server_added(&self, _monitor: &str, _server: &Arc<Server>) {}

    /// A server left a monitor's set.
    fn server_removed(&self, _monitor: &str, _server: &Arc<Server>) {}

    /// Hang up every client connection routed to this server.
    fn hangup_connections(&self, _server: &Arc<Server>) {}
}

/// Sink for deployments without a routing layer attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopServiceSink;

impl ServiceSink for NoopServiceSink {}
