//! Tracing subscriber setup and the structured event macros

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Where log events go and how they are rendered
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `mcp_probe=debug`
    pub level: String,
    /// Append to this file instead of stderr
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl LogConfig {
    /// Read `RUST_LOG`, `MCP_PROBE_LOG_FILE` and `MCP_PROBE_LOG_JSON`
    pub fn from_env() -> Self {
        Self {
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            file_path: env::var_os("MCP_PROBE_LOG_FILE").map(PathBuf::from),
            json_format: env::var("MCP_PROBE_LOG_JSON").is_ok_and(|v| v == "true"),
        }
    }

    /// Command-line values win over the environment
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if file_path.is_some() {
            self.file_path = file_path;
        }
        self
    }
}

/// Install the global subscriber
///
/// An unparsable level falls back to `info`.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_format {
        registry
            .with(fmt::layer().json().with_writer(writer).with_ansi(false))
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    Ok(())
}

/// One event per MCP message crossing a transport
#[macro_export]
macro_rules! log_mcp_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = ?$data,
            "MCP message"
        );
    };
}

/// Duration of one transport operation
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            "Operation timing"
        );
    };
}
