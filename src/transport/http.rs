//! Request/response HTTP transport
//!
//! Every request is a POST whose reply is either a JSON body or a short event
//! stream carrying the response (and any notifications sent before it).

use super::dispatch::{Dispatcher, NotificationHandler};
use super::sse::{EVENT_STREAM_MIME_TYPE, JSON_MIME_TYPE};
use super::{Transport, TransportError};
use crate::config::TransportKind;
use crate::protocol::{JsonrpcMessage, JsonrpcNotification, JsonrpcRequest, Reply, id_key, jsonrpc};
use crate::sync::MutexExt;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Serialize;
use sse_stream::SseStream;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Session header assigned by the server
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Transport implementation using one POST per message
pub struct HttpTransport {
    url: Url,
    client: Client,
    headers: HeaderMap,
    request_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    connected: AtomicBool,
    session_id: Mutex<Option<String>>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url.as_str())
            .field("session_id", &self.session_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl HttpTransport {
    pub fn new(url: Url, client: Client, headers: HeaderMap, request_timeout: Duration) -> Self {
        Self {
            url,
            client,
            headers,
            request_timeout,
            dispatcher: Arc::new(Dispatcher::new()),
            connected: AtomicBool::new(false),
            session_id: Mutex::new(None),
        }
    }

    /// Session id assigned by the server, if any
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock_unpoisoned().clone()
    }

    fn with_session(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session_id() {
            Some(session) => builder.header(SESSION_ID_HEADER, session),
            None => builder,
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, message: &T) -> Result<Response, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let builder = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, format!("{JSON_MIME_TYPE}, {EVENT_STREAM_MIME_TYPE}"))
            .timeout(self.request_timeout)
            .json(message);
        let response = self.with_session(builder).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            let mut current = self.session_id.lock_unpoisoned();
            if current.as_deref() != Some(session) {
                info!("HTTP session established: {}", session);
                *current = Some(session.to_string());
            }
        }

        Ok(response)
    }

    /// Handle one message found in a reply body; returns it if it answers `key`
    async fn accept(&self, message: JsonrpcMessage, key: &str) -> Option<Reply> {
        let reply = match message {
            JsonrpcMessage::Response(response) => Reply::Result(response),
            JsonrpcMessage::Error(error) => Reply::Error(error),
            other => {
                if let Some(reply) = self.dispatcher.dispatch(other)
                    && let Err(e) = self.post(&reply).await
                {
                    warn!("Failed to reply to server request {}: {}", id_key(reply.id()), e);
                }
                return None;
            }
        };

        if id_key(reply.id()) == key {
            Some(reply)
        } else {
            debug!("Ignoring reply for unknown request {}", id_key(reply.id()));
            None
        }
    }

    async fn read_response(&self, response: Response, key: &str) -> Result<Reply, TransportError> {
        if matches!(response.status(), StatusCode::ACCEPTED | StatusCode::NO_CONTENT) {
            return Err(TransportError::ResponseMissing { id: key.to_string() });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|ct| String::from_utf8_lossy(ct.as_bytes()).to_string());

        match content_type.as_deref() {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => {
                let mut events = SseStream::from_byte_stream(response.bytes_stream()).boxed();
                while let Some(event) = events.next().await {
                    let Some(data) = event?.data else { continue };
                    match jsonrpc::parse(&data) {
                        Ok(message) => {
                            trace!("HttpTransport: received {}", data);
                            if let Some(response) = self.accept(message, key).await {
                                return Ok(response);
                            }
                        }
                        Err(e) => debug!("HttpTransport: ignoring event data ({}): {}", e, data),
                    }
                }
                Err(TransportError::ResponseMissing { id: key.to_string() })
            }
            Some(ct) if ct.starts_with(JSON_MIME_TYPE) => {
                let body = response.text().await?;
                trace!("HttpTransport: received {}", body);
                let message = jsonrpc::parse(&body).map_err(|_| TransportError::UnexpectedStatus {
                    status: StatusCode::OK.as_u16(),
                    body: body.clone(),
                })?;
                match self.accept(message, key).await {
                    Some(response) => Ok(response),
                    None => Err(TransportError::ResponseMissing { id: key.to_string() }),
                }
            }
            _ => Err(TransportError::UnexpectedContentType(content_type)),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self) -> Result<(), TransportError> {
        // Nothing to open: the first POST is the handshake
        self.connected.store(true, Ordering::SeqCst);
        debug!("HttpTransport: ready for {}", self.url);
        Ok(())
    }

    async fn send_request(&self, request: JsonrpcRequest) -> Result<Reply, TransportError> {
        let key = id_key(&request.id);
        let response = self.post(&request).await?;
        self.read_response(response, &key).await
    }

    async fn send_notification(&self, notification: JsonrpcNotification) -> Result<(), TransportError> {
        self.post(&notification).await.map(drop)
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        self.dispatcher.set_handler(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(session) = self.session_id.lock_unpoisoned().take() else {
            return Ok(());
        };

        let result = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_ID_HEADER, &session)
            .timeout(self.request_timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                debug!("Server does not support session deletion");
            }
            Ok(response) if !response.status().is_success() => {
                warn!("Deleting session {} returned {}", session, response.status());
            }
            Ok(_) => debug!("Deleted session {}", session),
            Err(e) => warn!("Failed to delete session {}: {}", session, e),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
