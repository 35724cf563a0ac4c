//! Error types surfaced by the connection service
//!
//! Each layer keeps its own error enum; [`ConnectionError`] aggregates them
//! and [`ConnectionError::report`] flattens any of them into the
//! `{ category, message, evidence?, remediation? }` shape a front end renders.

use crate::io::process::ProcessError;
use crate::security::ValidationError;
use crate::service::ConnectionState;
use crate::startup::ErrorClassification;
use crate::transport::TransportError;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Protocol Errors
// ============================================================================

/// Failures after the transport believes it is connected
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Server error {code} for {method}: {message}")]
    Server {
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Invalid {method} result: {source}")]
    InvalidResult {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Channel failure during {method}: {source}")]
    Channel {
        method: String,
        #[source]
        source: TransportError,
    },
}

// ============================================================================
// Connection Errors
// ============================================================================

/// Coarse error category used for reporting and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Validation,
    ProcessSpawn,
    StartupFailure,
    Transport,
    Protocol,
    NotConnected,
    InvalidState,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::ProcessSpawn => "process-spawn",
            ErrorCategory::StartupFailure => "startup-failure",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::NotConnected => "not-connected",
            ErrorCategory::InvalidState => "invalid-state",
            ErrorCategory::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by `ConnectionService`
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Command rejected before anything was spawned
    #[error("Command rejected: {0}")]
    Validation(#[from] ValidationError),

    /// The OS could not start the server
    #[error("Failed to start server process: {0}")]
    ProcessSpawn(#[from] ProcessError),

    /// The process started but never became a valid server
    #[error("Server failed to start ({}): {}", .classification.category, .classification.evidence.as_deref().unwrap_or("no output"))]
    StartupFailure {
        classification: ErrorClassification,
        exit_code: Option<i32>,
    },

    /// Network or stream failure on a remote transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake or request failure on a connected transport
    #[error("Protocol error: {source}")]
    Protocol {
        #[source]
        source: ProtocolError,
        evidence: Option<String>,
    },

    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    /// Another connect or disconnect is in progress
    #[error("Connection attempt already in progress")]
    Busy,

    #[error("Already connected")]
    AlreadyConnected,

    /// The connect attempt was cancelled by a disconnect
    #[error("Connection attempt cancelled")]
    Cancelled,
}

impl From<ProtocolError> for ConnectionError {
    fn from(source: ProtocolError) -> Self {
        ConnectionError::Protocol {
            source,
            evidence: None,
        }
    }
}

impl ConnectionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConnectionError::Validation(_) => ErrorCategory::Validation,
            ConnectionError::ProcessSpawn(_) => ErrorCategory::ProcessSpawn,
            ConnectionError::StartupFailure { .. } => ErrorCategory::StartupFailure,
            ConnectionError::Transport(_) => ErrorCategory::Transport,
            ConnectionError::Protocol { .. } => ErrorCategory::Protocol,
            ConnectionError::NotConnected { .. } => ErrorCategory::NotConnected,
            ConnectionError::Busy | ConnectionError::AlreadyConnected => {
                ErrorCategory::InvalidState
            }
            ConnectionError::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Raw excerpt backing the error, if any
    pub fn evidence(&self) -> Option<String> {
        match self {
            ConnectionError::Validation(e) => Some(e.token().to_string()),
            ConnectionError::StartupFailure { classification, .. } => {
                classification.evidence.clone()
            }
            ConnectionError::Transport(e) => e.evidence().map(str::to_string),
            ConnectionError::Protocol { source, evidence } => evidence.clone().or_else(|| {
                match source {
                    ProtocolError::Server {
                        data: Some(data), ..
                    } => Some(data.to_string()),
                    ProtocolError::Channel { source, .. } => source.evidence().map(str::to_string),
                    _ => None,
                }
            }),
            _ => None,
        }
    }

    /// What the user can do about it
    pub fn remediation(&self) -> Option<String> {
        match self {
            ConnectionError::Validation(ValidationError::PathTraversal { root, .. }) => Some(
                format!("Keep server paths inside {}", root.display()),
            ),
            ConnectionError::Validation(_) => Some(
                "Remove shell syntax from the server command; arguments are passed without a shell"
                    .to_string(),
            ),
            ConnectionError::ProcessSpawn(ProcessError::ExecutableNotFound { command, .. }) => {
                Some(format!("Install {command} or use its full path"))
            }
            ConnectionError::StartupFailure { classification, .. } => {
                classification.remediation.clone()
            }
            ConnectionError::Transport(_) => {
                Some("Check that the server URL is reachable and speaks MCP".to_string())
            }
            ConnectionError::Protocol {
                source: ProtocolError::Timeout { .. },
                ..
            } => Some("The server did not answer in time; raise the timeout or check the server".to_string()),
            ConnectionError::NotConnected { .. } => Some("Connect to a server first".to_string()),
            _ => None,
        }
    }

    /// Flatten into the reporting shape
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            message: self.to_string(),
            evidence: self.evidence(),
            remediation: self.remediation(),
        }
    }
}

/// Serializable error summary for front ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}
