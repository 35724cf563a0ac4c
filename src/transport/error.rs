use crate::config::TransportKind;

/// Error types for transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Event stream error: {0}")]
    Stream(#[from] sse_stream::Error),

    #[error("Failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} transport requires a {field}")]
    MissingField {
        kind: TransportKind,
        field: &'static str,
    },

    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid HTTP header {name:?}")]
    InvalidHeader { name: String },

    #[error("Stdio transport requires a running process")]
    ProcessNotRunning,

    #[error("Process stdin/stdout were already claimed")]
    PipesUnavailable,

    #[error("Transport not started")]
    NotStarted,

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Server returned HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),

    #[error("Event stream closed before the endpoint event")]
    EndpointNotReceived,

    #[error("Server sent no response to request {id}")]
    ResponseMissing { id: String },
}

impl TransportError {
    /// Raw server text attached to the error, if any
    pub fn evidence(&self) -> Option<&str> {
        match self {
            TransportError::UnexpectedStatus { body, .. } if !body.is_empty() => Some(body),
            _ => None,
        }
    }
}
