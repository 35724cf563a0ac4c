//! Connection configuration
//!
//! Describes a single MCP server endpoint: which transport to use and the
//! fields that transport needs. A `ConnectionConfig` is handed to
//! `ConnectionService::connect` and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default time allowed for the initialize handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for a single request after the handshake
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Transport Kind
// ============================================================================

/// Transport used to reach an MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Local child process speaking newline-delimited JSON-RPC on stdin/stdout
    Stdio,
    /// Hanging GET event stream plus session-scoped POST endpoint
    #[serde(alias = "sse")]
    EventStream,
    /// Request/response HTTP (streamable HTTP)
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::EventStream => "event-stream",
            TransportKind::Http => "http",
        }
    }

    /// Whether this transport reaches the server over the network
    pub fn is_remote(&self) -> bool {
        !matches!(self, TransportKind::Stdio)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a transport kind from text
#[derive(Debug, thiserror::Error)]
#[error("Unsupported transport kind: {0} (expected stdio, event-stream or http)")]
pub struct UnknownTransportKind(pub String);

impl FromStr for TransportKind {
    type Err = UnknownTransportKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "event-stream" | "sse" => Ok(TransportKind::EventStream),
            "http" | "streamable-http" => Ok(TransportKind::Http),
            other => Err(UnknownTransportKind(other.to_string())),
        }
    }
}

// ============================================================================
// Connection Config
// ============================================================================

/// Everything needed to reach one MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Transport kind
    pub transport: TransportKind,

    /// Executable to spawn (stdio only)
    #[serde(default)]
    pub command: String,

    /// Command line arguments (stdio only)
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the child (stdio only)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child (stdio only)
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Server URL (event-stream and http only)
    #[serde(default)]
    pub url: String,

    /// Extra HTTP headers sent with every request (event-stream and http only)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Handshake timeout
    #[serde(
        rename = "timeout_ms",
        with = "duration_millis",
        default = "default_connect_timeout"
    )]
    pub timeout: Duration,

    /// Per-request timeout after the handshake
    #[serde(
        rename = "request_timeout_ms",
        with = "duration_millis",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

impl ConnectionConfig {
    fn empty(transport: TransportKind) -> Self {
        Self {
            transport,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: String::new(),
            headers: HashMap::new(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Config for a local server spawned as a child process
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::empty(TransportKind::Stdio)
        }
    }

    /// Config for a server reached over a hanging event stream
    pub fn event_stream(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::empty(TransportKind::EventStream)
        }
    }

    /// Config for a request/response HTTP server
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::empty(TransportKind::Http)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Short human-readable target description for logs
    pub fn target(&self) -> String {
        match self.transport {
            TransportKind::Stdio if self.args.is_empty() => self.command.clone(),
            TransportKind::Stdio => format!("{} {}", self.command, self.args.join(" ")),
            _ => self.url.clone(),
        }
    }
}

/// Serde helper storing durations as integer milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!(
            "SSE".parse::<TransportKind>().unwrap(),
            TransportKind::EventStream
        );
        assert_eq!(
            "event-stream".parse::<TransportKind>().unwrap(),
            TransportKind::EventStream
        );
        assert_eq!("http".parse::<TransportKind>().unwrap(), TransportKind::Http);
        assert!("websocket".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"transport": "stdio", "command": "npx", "args": ["-y", "server"]}"#,
        )
        .unwrap();

        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.command, "npx");
        assert_eq!(config.args, vec!["-y", "server"]);
        assert!(config.url.is_empty());
        assert_eq!(config.timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_config_deserialization_sse_alias_and_timeouts() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"transport": "sse", "url": "http://localhost:3000/sse", "timeout_ms": 1500}"#,
        )
        .unwrap();

        assert_eq!(config.transport, TransportKind::EventStream);
        assert_eq!(config.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_target_description() {
        let stdio = ConnectionConfig::stdio("node", vec!["server.js".to_string()]);
        assert_eq!(stdio.target(), "node server.js");

        let http = ConnectionConfig::http("http://localhost:8080/mcp");
        assert_eq!(http.target(), "http://localhost:8080/mcp");
        assert!(http.transport.is_remote());
    }
}
