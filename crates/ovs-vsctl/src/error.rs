//! Error types for ovs-vsctl

use std::time::Duration;
use thiserror::Error;

use ovs_idl::IdlError;

#[derive(Error, Debug)]
pub enum VsctlError {
    // ========================================================================
    // Graph edit errors
    // ========================================================================
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} does not exist")]
    NotFound { kind: &'static str, name: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Port {bridge} is the local port of bridge {bridge}")]
    LocalPort { bridge: String },

    // ========================================================================
    // Attribute errors
    // ========================================================================
    #[error("Table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("Invalid value for {table}.{column}: {reason}")]
    InvalidAttribute {
        table: String,
        column: String,
        reason: String,
    },

    // ========================================================================
    // Session errors
    // ========================================================================
    #[error("Failed to open OVSDB at {remote}: {source}")]
    Connection {
        remote: String,
        #[source]
        source: IdlError,
    },

    #[error("Transaction still conflicting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Transaction deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Idl(#[from] IdlError),
}

pub type Result<T> = std::result::Result<T, VsctlError>;

impl VsctlError {
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        VsctlError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        VsctlError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_attribute(
        table: impl Into<String>,
        column: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        VsctlError::InvalidAttribute {
            table: table.into(),
            column: column.into(),
            reason: reason.to_string(),
        }
    }

    pub fn connection(remote: impl Into<String>, source: IdlError) -> Self {
        VsctlError::Connection {
            remote: remote.into(),
            source,
        }
    }

    /// Errors raised by graph edits before anything was sent
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            VsctlError::AlreadyExists { .. }
                | VsctlError::NotFound { .. }
                | VsctlError::LocalPort { .. }
                | VsctlError::UnknownColumn { .. }
                | VsctlError::InvalidAttribute { .. }
        )
    }

    /// Get a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            VsctlError::Connection { .. } => {
                Some("Check that ovsdb-server is running and the remote and schema paths are correct")
            }
            VsctlError::RetriesExhausted { .. } | VsctlError::Timeout(_) => {
                Some("The database is under heavy concurrent modification; raise OVSDB_MAX_ATTEMPTS or OVSDB_DEADLINE_MS")
            }
            VsctlError::LocalPort { .. } => Some("Delete the bridge itself with del-br"),
            VsctlError::InvariantViolation(_) => {
                Some("The Open_vSwitch table must hold exactly one row; run ovs-vsctl init")
            }
            VsctlError::Idl(e) if e.is_disconnected() => {
                Some("The OVSDB session closed; open a new handle")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let e = VsctlError::already_exists("bridge", "br0");
        assert_eq!(e.to_string(), "bridge br0 already exists");
        assert!(e.is_precondition());

        let e = VsctlError::not_found("port", "p1");
        assert_eq!(e.to_string(), "port p1 does not exist");

        let e = VsctlError::LocalPort {
            bridge: "br0".into(),
        };
        assert_eq!(e.to_string(), "Port br0 is the local port of bridge br0");
        assert!(e.is_precondition());
        assert!(e.suggestion().is_some());

        let e = VsctlError::RetriesExhausted { attempts: 3 };
        assert!(!e.is_precondition());
        assert!(e.suggestion().is_some());

        let e: VsctlError = IdlError::Disconnected.into();
        assert!(e.suggestion().is_some());
    }
}
