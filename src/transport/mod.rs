//! Transport layer - message exchange with an MCP server
//!
//! Three interchangeable transports implement [`Transport`]:
//!
//! - **stdio**: newline-delimited JSON-RPC with a supervised child process
//! - **event-stream**: hanging GET for server messages, POST for client messages
//! - **http**: one POST per message, JSON or event-stream reply
//!
//! [`TransportFactory`] picks one from a `ConnectionConfig`.

mod dispatch;
pub mod error;
pub mod factory;
pub mod http;
#[cfg(test)]
pub mod mock;
pub mod sse;
pub mod stdio;

use crate::config::TransportKind;
use crate::protocol::{JsonrpcNotification, JsonrpcRequest, Reply};
use async_trait::async_trait;
use std::fmt;

pub use dispatch::NotificationHandler;
pub use error::TransportError;
pub use factory::{TransportBuilder, TransportFactory};
pub use http::HttpTransport;
pub use sse::EventStreamTransport;
pub use stdio::StdioTransport;

/// Bidirectional JSON-RPC channel to one MCP server
///
/// Methods take `&self` so a transport can be shared between the caller and
/// decorators; implementations guard their own state.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Which transport this is
    fn kind(&self) -> TransportKind;

    /// Open the channel (spawn readers, open streams)
    async fn start(&self) -> Result<(), TransportError>;

    /// Send a request and wait for its reply
    ///
    /// A JSON-RPC error object is a successful exchange and comes back as
    /// [`Reply::Error`]. Carries no timeout of its own; dropping the future
    /// abandons the request.
    async fn send_request(&self, request: JsonrpcRequest) -> Result<Reply, TransportError>;

    /// Send a notification (no response expected)
    async fn send_notification(&self, notification: JsonrpcNotification) -> Result<(), TransportError>;

    /// Receive server notifications
    fn set_notification_handler(&self, handler: NotificationHandler);

    /// Close the channel; pending requests fail with `Disconnected`
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}
