//! Error types for the bridge
//!
//! `BridgeError` covers the failures callers need to tell apart (startup aborts,
//! unknown handles). Everything else travels as `anyhow::Error` with context.

use std::path::PathBuf;

use thiserror::Error;

use crate::host::{CapabilityId, CapabilityKind};

/// Errors reported by a host capability
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{kind} has no property '{property}'")]
    UnknownProperty {
        kind: CapabilityKind,
        property: String,
    },

    #[error("invalid value for '{property}': {value}")]
    InvalidValue {
        property: String,
        value: serde_json::Value,
    },

    #[error("{kind} does not support action '{action}'")]
    UnsupportedAction { kind: CapabilityKind, action: String },
}

/// Errors surfaced by the bridge and its supervisor
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Fatal at startup: the configured script does not exist
    #[error("script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    /// Fatal at startup: no lookup command produced an interpreter path
    #[error("could not find a script interpreter (tried: {tried})")]
    InterpreterNotFound { tried: String },

    /// Fatal at startup: every port in the retry budget refused to bind
    #[error("could not bind RPC gateway after {attempts} attempts (last port {last_port})")]
    BindExhausted {
        attempts: u32,
        last_port: u16,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to start script process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("unknown capability {0}")]
    UnknownCapability(CapabilityId),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// True for errors that abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ScriptNotFound(_)
                | BridgeError::InterpreterNotFound { .. }
                | BridgeError::BindExhausted { .. }
                | BridgeError::Spawn(_)
                | BridgeError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::ScriptNotFound(PathBuf::from("x.py")).is_fatal());
        assert!(BridgeError::InterpreterNotFound {
            tried: "which python3".into()
        }
        .is_fatal());
        assert!(!BridgeError::UnknownCapability(CapabilityId(7)).is_fatal());
    }

    #[test]
    fn test_host_error_message() {
        let err = HostError::UnknownProperty {
            kind: CapabilityKind::Track,
            property: "tempo".into(),
        };
        assert_eq!(err.to_string(), "track has no property 'tempo'");
    }
}
