//! Error types for the OVSDB IDL

use thiserror::Error;

/// Errors raised by the IDL session, schema handling and transactions
#[derive(Error, Debug)]
pub enum IdlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("OVSDB protocol error: {0}")]
    Protocol(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Failed to connect to OVSDB at {remote}: {reason}")]
    Connection { remote: String, reason: String },

    #[error("OVSDB session disconnected")]
    Disconnected,

    #[error("OVSDB {method} failed: {error}")]
    Rpc { method: String, error: String },

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column {table}.{column}")]
    UnknownColumn { table: String, column: String },

    #[error("Invalid datum: {0}")]
    InvalidDatum(String),

    #[error("No row {uuid} in table {table}")]
    NoSuchRow { table: String, uuid: uuid::Uuid },
}

/// Result type alias using IdlError
pub type Result<T> = std::result::Result<T, IdlError>;

impl IdlError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        IdlError::Protocol(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        IdlError::Schema(msg.into())
    }

    /// Create an invalid datum error
    pub fn invalid_datum(msg: impl Into<String>) -> Self {
        IdlError::InvalidDatum(msg.into())
    }

    /// Create a connection error
    pub fn connection(remote: impl Into<String>, reason: impl ToString) -> Self {
        IdlError::Connection {
            remote: remote.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the session is gone and nothing more can be sent on it
    pub fn is_disconnected(&self) -> bool {
        matches!(self, IdlError::Disconnected)
    }

    /// Get a helpful suggestion for resolving this error
    pub fn suggestion(&self) -> &'static str {
        match self {
            IdlError::Connection { .. } => {
                "Check that ovsdb-server is running: systemctl status openvswitch-switch"
            }
            IdlError::Schema(_) => "Check the schema path, usually /usr/share/openvswitch/vswitch.ovsschema",
            IdlError::Disconnected => "The OVSDB session dropped; open a new connection",
            IdlError::Timeout(_) => "Increase the timeout or check ovsdb-server load",
            _ => "Check ovsdb-server logs for more details",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_suggestions() {
        let err = IdlError::connection("unix:/nope", "No such file or directory");
        assert!(err.to_string().contains("unix:/nope"));
        assert!(err.suggestion().contains("ovsdb-server"));
        assert!(!err.is_disconnected());
        assert!(IdlError::Disconnected.is_disconnected());
    }
}
