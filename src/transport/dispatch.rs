//! Inbound message routing shared by every transport
//!
//! Responses are matched to waiting requests through a pending table keyed by
//! JSON-RPC id. Each waiter holds a [`PendingGuard`] so an abandoned request
//! (timeout, cancelled future) removes its own entry.

use crate::protocol::{
    JsonrpcMessage, JsonrpcNotification, Reply, id_key, reply_to_server_request,
};
use crate::sync::MutexExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Callback for server notifications
pub type NotificationHandler = Arc<dyn Fn(JsonrpcNotification) + Send + Sync>;

type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

/// Removes a pending entry when the waiting request goes away
pub(crate) struct PendingGuard {
    table: PendingTable,
    key: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.lock_unpoisoned().remove(&self.key).is_some() {
            trace!("Dropped pending request {}", self.key);
        }
    }
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    pending: PendingTable,
    notifications: Mutex<Option<NotificationHandler>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the response with the given id key
    pub(crate) fn register(&self, key: String) -> (PendingGuard, oneshot::Receiver<Reply>) {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock_unpoisoned().insert(key.clone(), sender);
        (
            PendingGuard {
                table: Arc::clone(&self.pending),
                key,
            },
            receiver,
        )
    }

    pub(crate) fn set_handler(&self, handler: NotificationHandler) {
        *self.notifications.lock_unpoisoned() = Some(handler);
    }

    /// Route an inbound message; returns the reply owed to a server request
    pub(crate) fn dispatch(&self, message: JsonrpcMessage) -> Option<Reply> {
        match message {
            JsonrpcMessage::Response(response) => {
                self.complete(Reply::Result(response));
                None
            }
            JsonrpcMessage::Error(error) => {
                self.complete(Reply::Error(error));
                None
            }
            JsonrpcMessage::Notification(notification) => {
                self.notify(notification);
                None
            }
            JsonrpcMessage::Request(request) => {
                debug!("Server request {} ({})", request.method, id_key(&request.id));
                Some(reply_to_server_request(&request))
            }
        }
    }

    /// Deliver a reply to its waiter
    pub(crate) fn complete(&self, reply: Reply) {
        let key = id_key(reply.id());
        let waiter = self.pending.lock_unpoisoned().remove(&key);
        match waiter {
            Some(sender) => {
                if sender.send(reply).is_err() {
                    debug!("Response receiver dropped for request {}", key);
                }
            }
            None => debug!("Received response for unknown request {}", key),
        }
    }

    pub(crate) fn notify(&self, notification: JsonrpcNotification) {
        // Clone out so the handler runs without the lock held
        let handler = self.notifications.lock_unpoisoned().clone();
        match handler {
            Some(handler) => handler(notification),
            None => trace!("No handler for notification {}", notification.method),
        }
    }

    /// Fail every waiting request with a disconnect
    pub(crate) fn fail_all(&self) {
        let drained: Vec<String> = self
            .pending
            .lock_unpoisoned()
            .drain()
            .map(|(key, _sender)| key)
            .collect();
        if !drained.is_empty() {
            debug!("Failing {} pending request(s): transport closed", drained.len());
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock_unpoisoned().len()
    }
}
