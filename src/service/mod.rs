//! Connection service: one MCP session's lifecycle, health and operations

pub mod connection;
pub mod health;
pub mod state;

pub use connection::ConnectionService;
pub use health::ConnectionHealth;
pub use state::{ConnectionState, InvalidTransition, StateCell};
