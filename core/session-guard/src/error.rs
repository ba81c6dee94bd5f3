//! Error types for session-guard operations.
//!
//! `TransportError` and `OperationError` are `Clone` because a single settled
//! result is handed to every caller that joined the same operation key.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Transport Errors (produced by the HTTP collaborator)
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by the underlying API transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// 401-class response. Never retried; routed through the session gate.
    #[error("Unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("Network failure: {0}")]
    Network(String),
}

impl TransportError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        TransportError::Unauthorized {
            status: 401,
            message: message.into(),
        }
    }

    /// Maps an HTTP status to the matching error class.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => TransportError::Unauthorized { status, message },
            500..=599 => TransportError::Server { status, message },
            _ => TransportError::Client { status, message },
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Unauthorized { .. })
    }

    /// Transient failures worth another attempt: network and 5xx.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Server { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operation Errors (returned by the lock registry)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A caller joined a key whose in-flight operation produces another type.
    #[error("Operation key {key} is in use with a different result type")]
    KeyTypeMismatch { key: String },

    #[error("Operation {key} aborted: {reason}")]
    Aborted { key: String, reason: String },
}

impl OperationError {
    pub fn is_auth(&self) -> bool {
        matches!(self, OperationError::Transport(err) if err.is_auth())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Internal Errors (configuration and storage)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using GuardError.
pub type Result<T> = std::result::Result<T, GuardError>;
