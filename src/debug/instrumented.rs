//! Recording decorator for any transport

use super::{DebugEntry, DebugLog, Direction, EntryKind};
use crate::config::TransportKind;
use crate::protocol::{JsonrpcNotification, JsonrpcRequest, Reply};
use crate::transport::{NotificationHandler, Transport, TransportError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

/// Transport wrapper that records traffic into a [`DebugLog`]
///
/// Behaves exactly like the wrapped transport; callers cannot tell the two
/// apart except through the log.
#[derive(Debug)]
pub struct InstrumentedTransport {
    inner: Arc<dyn Transport>,
    log: DebugLog,
}

impl InstrumentedTransport {
    pub fn new(inner: Arc<dyn Transport>, log: DebugLog) -> Self {
        Self { inner, log }
    }

    fn record<T: Serialize>(&self, direction: Direction, kind: EntryKind, method: Option<&str>, payload: &T) {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| json!({ "unserializable": e.to_string() }));
        crate::log_mcp_message!(
            Level::TRACE,
            direction_label(direction),
            method.unwrap_or("-"),
            &payload
        );
        self.log.record(DebugEntry::new(direction, kind, method, payload));
    }

    fn record_event(&self, event: &str, detail: Option<String>) {
        let mut payload = json!({ "event": event, "transport": self.inner.kind().as_str() });
        if let Some(detail) = detail {
            payload["detail"] = Value::String(detail);
        }
        self.log.record(DebugEntry::new(
            Direction::Outbound,
            EntryKind::TransportEvent,
            None,
            payload,
        ));
    }

    fn record_error(&self, method: Option<&str>, error: &TransportError) {
        self.log.record(DebugEntry::new(
            Direction::Inbound,
            EntryKind::Error,
            method,
            json!({ "error": error.to_string() }),
        ));
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Outbound => "outbound",
        Direction::Inbound => "inbound",
    }
}

#[async_trait]
impl Transport for InstrumentedTransport {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    async fn start(&self) -> Result<(), TransportError> {
        let result = self.inner.start().await;
        match &result {
            Ok(()) => self.record_event("started", None),
            Err(e) => self.record_event("start-failed", Some(e.to_string())),
        }
        result
    }

    async fn send_request(&self, request: JsonrpcRequest) -> Result<Reply, TransportError> {
        let method = request.method.clone();
        self.record(Direction::Outbound, EntryKind::Request, Some(&method), &request);

        let started = Instant::now();
        let result = self.inner.send_request(request).await;
        crate::log_timing!(Level::DEBUG, method.as_str(), started.elapsed());

        match &result {
            Ok(reply) => self.record(Direction::Inbound, EntryKind::Response, Some(&method), reply),
            Err(e) => self.record_error(Some(&method), e),
        }
        result
    }

    async fn send_notification(&self, notification: JsonrpcNotification) -> Result<(), TransportError> {
        let recorded = notification.clone();
        let result = self.inner.send_notification(notification).await;
        match &result {
            Ok(()) => self.record(
                Direction::Outbound,
                EntryKind::Notification,
                Some(&recorded.method),
                &recorded,
            ),
            Err(e) => self.record_error(Some(&recorded.method), e),
        }
        result
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        let log = self.log.clone();
        self.inner.set_notification_handler(Arc::new(move |notification: JsonrpcNotification| {
            let payload = serde_json::to_value(&notification).unwrap_or(Value::Null);
            log.record(DebugEntry::new(
                Direction::Inbound,
                EntryKind::Notification,
                Some(&notification.method),
                payload,
            ));
            handler(notification);
        }));
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.inner.close().await;
        match &result {
            Ok(()) => self.record_event("closed", None),
            Err(e) => self.record_event("close-failed", Some(e.to_string())),
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
