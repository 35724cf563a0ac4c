//! Diagnosable MCP client core
//!
//! Connects to MCP servers over stdio, event-stream or HTTP, supervises the
//! server processes it spawns, records protocol traffic for debugging and
//! explains servers that fail before the handshake.
//!
//! ```no_run
//! use mcp_probe::{ClientSettings, ConnectionConfig, ConnectionService};
//!
//! # async fn run() -> Result<(), mcp_probe::ConnectionError> {
//! let service = ConnectionService::new(&ClientSettings::from_env());
//! let config = ConnectionConfig::stdio("npx", vec!["-y".into(), "@modelcontextprotocol/server-everything".into()]);
//! let info = service.connect(config).await?;
//! println!("connected to {}", info.server_info.name);
//! let tools = service.list_tools(None).await?;
//! println!("{} tools", tools.tools.len());
//! service.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod debug;
pub mod error;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod security;
pub mod service;
pub mod settings;
pub mod startup;
pub(crate) mod sync;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use config::{ConnectionConfig, TransportKind};
pub use debug::{DebugEntry, DebugLog};
pub use error::{ConnectionError, ErrorCategory, ErrorReport};
pub use service::{ConnectionHealth, ConnectionService, ConnectionState};
pub use settings::ClientSettings;
