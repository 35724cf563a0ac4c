//! Stdio transport - newline-delimited JSON-RPC over a child's stdin/stdout
//!
//! Servers often print banners, usage text or fatal errors on stdout before
//! (or instead of) speaking the protocol. Such lines are kept in the
//! process's [`EarlyOutput`] until the first valid message seals it.

use super::dispatch::{Dispatcher, NotificationHandler};
use super::{Transport, TransportError};
use crate::config::TransportKind;
use crate::io::capture::EarlyOutput;
use crate::protocol::{JsonrpcNotification, JsonrpcRequest, Reply, id_key, jsonrpc};
use crate::sync::MutexExt;
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, trace, warn};

/// Longest stdout line accepted from a server
const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

/// Transport implementation using a child's stdin/stdout
pub struct StdioTransport {
    pid: u32,
    early_output: EarlyOutput,
    dispatcher: Arc<Dispatcher>,
    connected: Arc<AtomicBool>,

    /// Pipes waiting for `start`
    pipes: Mutex<Option<(ChildStdin, ChildStdout)>>,

    /// Channel feeding the stdin writer task
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioTransport")
            .field("pid", &self.pid)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl StdioTransport {
    /// Create a transport over claimed pipes; nothing runs until `start`
    pub fn new(stdin: ChildStdin, stdout: ChildStdout, pid: u32, early_output: EarlyOutput) -> Self {
        Self {
            pid,
            early_output,
            dispatcher: Arc::new(Dispatcher::new()),
            connected: Arc::new(AtomicBool::new(false)),
            pipes: Mutex::new(Some((stdin, stdout))),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Background task that writes messages to stdin
    async fn stdin_writer_task(mut stdin: ChildStdin, mut receiver: mpsc::UnboundedReceiver<String>) {
        while let Some(mut message) = receiver.recv().await {
            trace!("StdioTransport: writing message (length: {})", message.len());
            message.push('\n');

            if let Err(e) = stdin.write_all(message.as_bytes()).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    /// Background task that splits stdout into lines and routes them
    async fn stdout_reader_task(
        stdout: ChildStdout,
        dispatcher: Arc<Dispatcher>,
        early_output: EarlyOutput,
        replies: mpsc::UnboundedSender<String>,
        connected: Arc<AtomicBool>,
    ) {
        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break;
                }
            };

            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            match jsonrpc::parse(text) {
                Ok(message) => {
                    early_output.seal();
                    trace!("StdioTransport: received {}", text);

                    if let Some(reply) = dispatcher.dispatch(message) {
                        match serde_json::to_string(&reply) {
                            Ok(reply) => {
                                let _ = replies.send(reply);
                            }
                            Err(e) => warn!("Failed to encode reply: {}", e),
                        }
                    }
                }
                Err(_) if !early_output.protocol_seen() => {
                    debug!("StdioTransport: pre-handshake output: {}", text);
                    early_output.record_line(text);
                }
                Err(e) => debug!("StdioTransport: ignoring non-protocol line ({}): {}", e, text),
            }
        }

        trace!("StdioTransport: stdout reader reached EOF");
        connected.store(false, Ordering::SeqCst);
        dispatcher.fail_all();
    }

    fn send_line(&self, line: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let outbound = self.outbound.lock_unpoisoned();
        let sender = outbound.as_ref().ok_or(TransportError::NotStarted)?;
        sender.send(line).map_err(|_| TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn start(&self) -> Result<(), TransportError> {
        let (stdin, stdout) = self
            .pipes
            .lock_unpoisoned()
            .take()
            .ok_or(TransportError::PipesUnavailable)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.connected.store(true, Ordering::SeqCst);

        let writer = tokio::spawn(Self::stdin_writer_task(stdin, receiver));
        let reader = tokio::spawn(Self::stdout_reader_task(
            stdout,
            Arc::clone(&self.dispatcher),
            self.early_output.clone(),
            sender.clone(),
            Arc::clone(&self.connected),
        ));

        *self.outbound.lock_unpoisoned() = Some(sender);
        self.tasks.lock_unpoisoned().extend([writer, reader]);

        debug!("StdioTransport: started for pid {}", self.pid);
        Ok(())
    }

    async fn send_request(&self, request: JsonrpcRequest) -> Result<Reply, TransportError> {
        let line = serde_json::to_string(&request)?;
        let (_guard, receiver) = self.dispatcher.register(id_key(&request.id));

        self.send_line(line)?;

        receiver.await.map_err(|_| TransportError::Disconnected)
    }

    async fn send_notification(&self, notification: JsonrpcNotification) -> Result<(), TransportError> {
        let line = serde_json::to_string(&notification)?;
        self.send_line(line)
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        self.dispatcher.set_handler(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock_unpoisoned().take();

        // Aborting the writer drops stdin, which closes the pipe
        for task in self.tasks.lock_unpoisoned().drain(..) {
            task.abort();
        }
        self.pipes.lock_unpoisoned().take();
        self.dispatcher.fail_all();

        debug!("StdioTransport: closed for pid {}", self.pid);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::process::{CommandSpec, ProcessSupervisor};
    use serde_json::json;
    use std::time::Duration;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn transport_for(supervisor: &ProcessSupervisor, script: &str) -> (StdioTransport, EarlyOutput) {
        let mut process = supervisor
            .spawn(&CommandSpec::new(
                "sh",
                vec!["-c".to_string(), script.to_string()],
            ))
            .unwrap();
        let (stdin, stdout) = process.take_stdio().unwrap();
        let early_output = process.early_output().clone();
        (
            StdioTransport::new(stdin, stdout, process.handle().pid(), early_output.clone()),
            early_output,
        )
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let supervisor = ProcessSupervisor::new();
        let (transport, early_output) = transport_for(
            &supervisor,
            r#"echo 'starting up'; read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; while read line; do :; done"#,
        );
        transport.start().await.unwrap();

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            transport.send_request(jsonrpc::request(1, "ping", None)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.into_result().unwrap(), json!({"ok": true}));
        let captured = early_output.snapshot();
        assert!(captured.protocol_seen);
        assert_eq!(captured.text, "starting up\n");

        transport.close().await.unwrap();
        supervisor.kill_all().await;
    }

    #[tokio::test]
    async fn test_eof_fails_pending_request() {
        let supervisor = ProcessSupervisor::new();
        let (transport, early_output) =
            transport_for(&supervisor, "echo 'Usage: server <dir>'; read line; exit 1");
        transport.start().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.send_request(jsonrpc::request(1, "initialize", None)),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert!(!transport.is_connected());
        assert!(early_output.snapshot().text.contains("Usage: server <dir>"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let supervisor = ProcessSupervisor::new();
        let (transport, _) = transport_for(&supervisor, "while read line; do :; done");

        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(TransportError::PipesUnavailable)
        ));

        transport.close().await.unwrap();
        assert!(matches!(
            transport
                .send_notification(jsonrpc::notification("x", None))
                .await,
            Err(TransportError::Disconnected)
        ));
        supervisor.kill_all().await;
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let supervisor = ProcessSupervisor::new();
        // The server pings first, then reports whether our pong arrived
        let (transport, _) = transport_for(
            &supervisor,
            r#"echo '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}'; read a; read b; case "$a$b" in *'"id":"srv-1"'*'"result":{}'*) echo '{"jsonrpc":"2.0","id":1,"result":{"answered":true}}';; *) echo '{"jsonrpc":"2.0","id":1,"result":{"answered":false}}';; esac; while read line; do :; done"#,
        );
        transport.start().await.unwrap();

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            transport.send_request(jsonrpc::request(1, "tools/list", None)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.into_result().unwrap(), json!({"answered": true}));
        transport.close().await.unwrap();
        supervisor.kill_all().await;
    }
}
