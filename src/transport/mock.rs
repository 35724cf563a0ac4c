//! Scripted transport for tests
//!
//! Answers requests from a per-method table and records everything sent.

use super::{NotificationHandler, Transport, TransportError};
use crate::config::TransportKind;
use crate::protocol::{JsonrpcNotification, JsonrpcRequest, Reply, RpcError, id_key};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Scripted {
    Result(Map<String, Value>),
    Error(RpcError),
    Hang,
}

/// Mock transport for testing - allows controlling sent/received messages
#[derive(Debug)]
pub struct MockTransport {
    kind: TransportKind,
    script: Mutex<HashMap<String, Scripted>>,
    delay: Mutex<Option<Duration>>,
    sent_requests: Mutex<Vec<JsonrpcRequest>>,
    sent_notifications: Mutex<Vec<JsonrpcNotification>>,
    handler: Mutex<Option<NotificationHandlerSlot>>,
    connected: AtomicBool,
    close_calls: Mutex<usize>,
}

/// Wrapper so the handler can live in a `Debug` struct
struct NotificationHandlerSlot(NotificationHandler);

impl std::fmt::Debug for NotificationHandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NotificationHandler")
    }
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            sent_requests: Mutex::new(Vec::new()),
            sent_notifications: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            connected: AtomicBool::new(false),
            close_calls: Mutex::new(0),
        })
    }

    /// Answer `method` with `result`, a JSON object
    pub fn respond(&self, method: &str, result: Value) {
        let Value::Object(result) = result else {
            panic!("scripted result for {method} must be an object");
        };
        self.script
            .lock()
            .unwrap()
            .insert(method.to_string(), Scripted::Result(result));
    }

    /// Answer `method` with a JSON-RPC error
    pub fn fail(&self, method: &str, code: i64, message: &str) {
        self.script.lock().unwrap().insert(
            method.to_string(),
            Scripted::Error(RpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        );
    }

    /// Never answer `method`
    pub fn hang(&self, method: &str) {
        self.script
            .lock()
            .unwrap()
            .insert(method.to_string(), Scripted::Hang);
    }

    /// Delay every response
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn sent_requests(&self) -> Vec<JsonrpcRequest> {
        self.sent_requests.lock().unwrap().clone()
    }

    pub fn sent_notifications(&self) -> Vec<JsonrpcNotification> {
        self.sent_notifications.lock().unwrap().clone()
    }

    /// Params of every request sent, as JSON (`null` when absent)
    pub fn sent_params(&self) -> Vec<Value> {
        self.sent_requests()
            .iter()
            .map(|request| serde_json::to_value(&request.params).unwrap())
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        *self.close_calls.lock().unwrap()
    }

    /// Simulate a server notification
    pub fn emit(&self, notification: JsonrpcNotification) {
        let handler = self.handler.lock().unwrap().as_ref().map(|slot| slot.0.clone());
        if let Some(handler) = handler {
            handler(notification);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_request(&self, request: JsonrpcRequest) -> Result<Reply, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.sent_requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().get(&request.method).cloned();
        match scripted {
            Some(Scripted::Result(result)) => Ok(Reply::success(request.id, result)),
            Some(Scripted::Error(error)) => Ok(Reply::failure(request.id, error)),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Err(TransportError::ResponseMissing {
                id: id_key(&request.id),
            }),
        }
    }

    async fn send_notification(&self, notification: JsonrpcNotification) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.sent_notifications.lock().unwrap().push(notification);
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.handler.lock().unwrap() = Some(NotificationHandlerSlot(handler));
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.close_calls.lock().unwrap() += 1;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
