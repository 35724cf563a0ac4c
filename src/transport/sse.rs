//! Event-stream transport
//!
//! A long-lived GET carries every server message. Its first `endpoint` event
//! names a session-scoped URL; requests are POSTed there and answered on the
//! stream. The stream lives in its own task under its own cancellation token
//! and never inherits a caller's timeout.

use super::dispatch::{Dispatcher, NotificationHandler};
use super::{Transport, TransportError};
use crate::config::TransportKind;
use crate::protocol::{JsonrpcMessage, JsonrpcNotification, JsonrpcRequest, Reply, id_key, jsonrpc};
use crate::sync::MutexExt;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Url};
use serde::Serialize;
use sse_stream::SseStream;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub(crate) const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub(crate) const JSON_MIME_TYPE: &str = "application/json";

/// Transport over a hanging event stream plus a POST endpoint
pub struct EventStreamTransport {
    url: Url,
    client: Client,
    headers: HeaderMap,
    request_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    connected: Arc<AtomicBool>,
    endpoint: Mutex<Option<Url>>,
    shutdown: CancellationToken,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EventStreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamTransport")
            .field("url", &self.url.as_str())
            .field("endpoint", &self.endpoint.lock_unpoisoned().as_ref().map(Url::as_str))
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// State owned by the stream task
struct StreamContext {
    client: Client,
    headers: HeaderMap,
    request_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl EventStreamTransport {
    pub fn new(url: Url, client: Client, headers: HeaderMap, request_timeout: Duration) -> Self {
        Self {
            url,
            client,
            headers,
            request_timeout,
            dispatcher: Arc::new(Dispatcher::new()),
            connected: Arc::new(AtomicBool::new(false)),
            endpoint: Mutex::new(None),
            shutdown: CancellationToken::new(),
            stream_task: Mutex::new(None),
        }
    }

    /// Session-scoped POST endpoint, once the stream announced it
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.lock_unpoisoned().clone()
    }

    async fn run_stream(context: StreamContext, url: Url, ready: oneshot::Sender<Result<Url, TransportError>>) {
        let mut ready = Some(ready);

        let outcome = tokio::select! {
            _ = context.shutdown.cancelled() => {
                debug!("Event stream {} cancelled", url);
                Ok(())
            }
            result = Self::read_stream(&context, &url, &mut ready) => result,
        };

        context.connected.store(false, Ordering::SeqCst);
        context.dispatcher.fail_all();

        match (outcome, ready.take()) {
            (Err(e), Some(ready)) => {
                let _ = ready.send(Err(e));
            }
            (Ok(()), Some(ready)) => {
                let _ = ready.send(Err(TransportError::EndpointNotReceived));
            }
            (Err(e), None) => warn!("Event stream {} failed: {}", url, e),
            (Ok(()), None) => info!("Event stream {} closed", url),
        }
    }

    async fn read_stream(
        context: &StreamContext,
        url: &Url,
        ready: &mut Option<oneshot::Sender<Result<Url, TransportError>>>,
    ) -> Result<(), TransportError> {
        let response = context
            .client
            .get(url.clone())
            .headers(context.headers.clone())
            .header(ACCEPT, EVENT_STREAM_MIME_TYPE)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|ct| String::from_utf8_lossy(ct.as_bytes()).to_string());
        if !content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with(EVENT_STREAM_MIME_TYPE))
        {
            return Err(TransportError::UnexpectedContentType(content_type));
        }

        let mut events = SseStream::from_byte_stream(response.bytes_stream()).boxed();
        let mut endpoint: Option<Url> = None;

        while let Some(event) = events.next().await {
            let event = event?;
            let data = event.data.unwrap_or_default();

            match event.event.as_deref() {
                Some("endpoint") => {
                    let resolved = url.join(data.trim()).map_err(|e| TransportError::InvalidUrl {
                        url: data.clone(),
                        reason: e.to_string(),
                    })?;
                    info!(
                        "Event stream endpoint {} (session {})",
                        resolved,
                        session_id(&resolved).unwrap_or_else(|| "-".to_string())
                    );
                    context.connected.store(true, Ordering::SeqCst);
                    endpoint = Some(resolved.clone());
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(resolved));
                    }
                }
                None | Some("message") => {
                    if data.trim().is_empty() {
                        continue;
                    }
                    match jsonrpc::parse(&data) {
                        Ok(message) => {
                            trace!("EventStream: received {}", data);
                            if let Some(reply) = context.dispatcher.dispatch(message) {
                                match &endpoint {
                                    Some(endpoint) => Self::spawn_reply(context, endpoint.clone(), reply),
                                    None => warn!("Server request before endpoint event; cannot reply"),
                                }
                            }
                        }
                        Err(e) => debug!("EventStream: ignoring event data ({}): {}", e, data),
                    }
                }
                Some(other) => trace!("EventStream: ignoring {} event", other),
            }
        }

        Ok(())
    }

    fn spawn_reply(context: &StreamContext, endpoint: Url, reply: Reply) {
        let request = context
            .client
            .post(endpoint)
            .headers(context.headers.clone())
            .timeout(context.request_timeout)
            .json(&reply);

        tokio::spawn(async move {
            if let Err(e) = request.send().await.and_then(|r| r.error_for_status()) {
                warn!("Failed to reply to server request {}: {}", id_key(reply.id()), e);
            }
        });
    }

    /// POST a message to the session endpoint; the answer arrives on the stream
    async fn post<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let endpoint = self.endpoint().ok_or(TransportError::NotStarted)?;

        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .timeout(self.request_timeout)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        // Some servers also answer inline
        let inline_json = response
            .headers()
            .get(CONTENT_TYPE)
            .is_some_and(|ct| ct.as_bytes().starts_with(JSON_MIME_TYPE.as_bytes()));
        if inline_json {
            let body = response.text().await?;
            if let Ok(message @ (JsonrpcMessage::Response(_) | JsonrpcMessage::Error(_))) =
                jsonrpc::parse(&body)
            {
                self.dispatcher.dispatch(message);
            }
        }

        Ok(())
    }
}

/// Session id carried in the endpoint's query string
fn session_id(endpoint: &Url) -> Option<String> {
    endpoint
        .query_pairs()
        .find(|(key, _)| key == "sessionId" || key == "session_id")
        .map(|(_, value)| value.into_owned())
}

#[async_trait]
impl Transport for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn start(&self) -> Result<(), TransportError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let context = StreamContext {
            client: self.client.clone(),
            headers: self.headers.clone(),
            request_timeout: self.request_timeout,
            dispatcher: Arc::clone(&self.dispatcher),
            connected: Arc::clone(&self.connected),
            shutdown: self.shutdown.clone(),
        };

        info!("Opening event stream {}", self.url);
        let task = tokio::spawn(Self::run_stream(context, self.url.clone(), ready_tx));
        if let Some(previous) = self.stream_task.lock_unpoisoned().replace(task) {
            previous.abort();
        }

        let endpoint = ready_rx.await.map_err(|_| TransportError::EndpointNotReceived)??;
        *self.endpoint.lock_unpoisoned() = Some(endpoint);
        Ok(())
    }

    async fn send_request(&self, request: JsonrpcRequest) -> Result<Reply, TransportError> {
        let (_guard, receiver) = self.dispatcher.register(id_key(&request.id));
        self.post(&request).await?;
        receiver.await.map_err(|_| TransportError::Disconnected)
    }

    async fn send_notification(&self, notification: JsonrpcNotification) -> Result<(), TransportError> {
        self.post(&notification).await
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        self.dispatcher.set_handler(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
        self.dispatcher.fail_all();

        let task = self.stream_task.lock_unpoisoned().take();
        if let Some(task) = task
            && tokio::time::timeout(Duration::from_secs(1), task).await.is_err()
        {
            error!("Event stream task did not stop after cancellation");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
