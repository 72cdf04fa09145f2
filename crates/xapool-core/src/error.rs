//! Error types for xapool

use std::time::Duration;

use thiserror::Error;

use crate::xid::XaErrorCode;

/// Which way a heuristic outcome went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicKind {
    /// Some participants committed, others did not
    Mixed,
    /// Nothing is known to have committed, but the outcome could not be confirmed
    Hazard,
}

impl std::fmt::Display for HeuristicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeuristicKind::Mixed => write!(f, "heuristic mixed"),
            HeuristicKind::Hazard => write!(f, "heuristic hazard"),
        }
    }
}

/// Core error type for xapool operations
#[derive(Error, Debug)]
pub enum XaPoolError {
    #[error("Connection pool '{factory}' exhausted: no connection available within {timeout:?}")]
    PoolExhausted { factory: String, timeout: Duration },

    #[error("Bad connection in '{factory}': {reason}")]
    BadConnection { factory: String, reason: String },

    #[error("Configuration error in '{factory}': {check}")]
    Configuration { factory: String, check: String },

    #[error("Transaction {xid} completed with a {kind} outcome (committed: {committed:?}, failed: {failed:?})")]
    Heuristic {
        xid: String,
        kind: HeuristicKind,
        committed: Vec<String>,
        failed: Vec<String>,
    },

    #[error("Transaction {xid} rolled back: {reason}")]
    RolledBack { xid: String, reason: String },

    #[error("Transaction timed out: {0}")]
    TransactionTimedOut(String),

    #[error("XA error {code:?}: {message}")]
    Xa { code: XaErrorCode, message: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Settings error: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl XaPoolError {
    /// Build an XA error with the given code
    pub fn xa(code: XaErrorCode, message: impl Into<String>) -> Self {
        XaPoolError::Xa {
            code,
            message: message.into(),
        }
    }

    /// Whether the caller may back off and retry the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, XaPoolError::PoolExhausted { .. })
    }

    /// Whether the error means the physical connection is unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            XaPoolError::ConnectionLost(_) | XaPoolError::BadConnection { .. } | XaPoolError::Io(_)
        )
    }

    /// Whether the error reports a heuristic (in-doubt) transaction outcome
    pub fn is_heuristic(&self) -> bool {
        matches!(self, XaPoolError::Heuristic { .. })
    }

    /// The XA error code carried by this error, if any
    pub fn xa_code(&self) -> Option<XaErrorCode> {
        match self {
            XaPoolError::Xa { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for xapool operations
pub type Result<T> = std::result::Result<T, XaPoolError>;
