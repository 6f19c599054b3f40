//! Backend client contract the probing pipeline relies on.
//!
//! The monitor core talks to backends through the [`Connection`] and
//! [`Connector`] traits so the worker, the disk checker and the modules stay
//! independent of the wire implementation. [`mysql::MySqlConnector`] is the
//! production implementation; tests substitute an in-memory one.

pub mod mysql;
pub mod protocol;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ConnectionSettings;

/// MySQL/MariaDB server error codes the core classifies on.
pub mod er {
    pub const ACCESS_DENIED: u16 = 1045;
    pub const DBACCESS_DENIED: u16 = 1044;
    pub const ACCESS_DENIED_NO_PASSWORD: u16 = 1698;
    pub const KILL_DENIED: u16 = 1095;
    pub const UNKNOWN_TABLE: u16 = 1109;
    pub const TABLEACCESS_DENIED: u16 = 1142;
    pub const COLUMNACCESS_DENIED: u16 = 1143;
    pub const SPECIFIC_ACCESS_DENIED: u16 = 1227;
    pub const PROCACCESS_DENIED: u16 = 1370;
}

/// Client errors, with the originating server error code when one exists.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection disconnected")]
    Disconnected,
}

impl ClientError {
    pub fn server_code(&self) -> Option<u16> {
        match self {
            ClientError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Connect-level authentication failure.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self.server_code(),
            Some(er::ACCESS_DENIED | er::DBACCESS_DENIED | er::ACCESS_DENIED_NO_PASSWORD)
        )
    }

    /// Query-level permission failure (table, column, procedure, kill).
    pub fn is_query_permission_denied(&self) -> bool {
        matches!(
            self.server_code(),
            Some(
                er::TABLEACCESS_DENIED
                    | er::COLUMNACCESS_DENIED
                    | er::SPECIFIC_ACCESS_DENIED
                    | er::PROCACCESS_DENIED
                    | er::KILL_DENIED
            )
        )
    }

    /// The queried table or view does not exist on the backend.
    pub fn is_unknown_table(&self) -> bool {
        self.server_code() == Some(er::UNKNOWN_TABLE)
    }
}

/// A text-protocol result set with named columns.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// Value of `column` in the first row.
    pub fn first(&self, column: &str) -> Option<&str> {
        self.value(0, column)
    }
}

/// One live backend connection.
#[async_trait]
pub trait Connection: Send {
    /// Cheap liveness check on the existing connection.
    async fn ping(&mut self) -> Result<(), ClientError>;

    /// Execute a statement and collect its result set.
    async fn query(&mut self, sql: &str) -> Result<QueryResult, ClientError>;
}

/// Factory for backend connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        port: u16,
        user: &str,
        password: &str,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Connection>, ClientError>;
}
