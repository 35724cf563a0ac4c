//! Connection orchestration
//!
//! `ConnectionService` owns one MCP session at a time. Connecting runs the
//! pipeline validate → spawn → build → instrument → handshake; for stdio
//! servers a failed handshake is diagnosed from the process's early output
//! before any error is surfaced.

use super::health::{ConnectionHealth, HealthTracker};
use super::state::{ConnectionState, StateCell};
use crate::config::{ConnectionConfig, TransportKind};
use crate::debug::{DebugLog, InstrumentedTransport};
use crate::error::{ConnectionError, ErrorCategory, ProtocolError};
use crate::io::capture::EarlyOutput;
use crate::io::process::{
    CommandSpec, ProcessHandle, ProcessSupervisor, SpawnedProcess, TerminationOutcome,
};
use crate::protocol::{JsonrpcNotification, Reply, jsonrpc, methods, params};
use crate::security::CommandValidator;
use crate::settings::ClientSettings;
use crate::startup;
use crate::sync::MutexExt;
use crate::transport::{
    NotificationHandler, Transport, TransportBuilder, TransportError, TransportFactory,
};
use rust_mcp_sdk::schema::{
    CallToolResult, GetPromptResult, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a failed stdio server gets to report its exit code
const STARTUP_EXIT_WAIT: Duration = Duration::from_secs(1);

/// Time for the stderr drain to catch up after an observed exit
const OUTPUT_SETTLE: Duration = Duration::from_millis(50);

/// Lines of early output attached to an unclassified failure
const EVIDENCE_LINES: usize = 20;

/// Upper bound on `tools/list` pages fetched to find a tool's schema
const MAX_SCHEMA_PAGES: usize = 10;

const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

type RequiredArguments = Arc<Mutex<HashMap<String, HashSet<String>>>>;

/// One established connection
struct Session {
    id: Uuid,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    process: Option<ProcessHandle>,
    server_info: InitializeResult,
    required_arguments: RequiredArguments,
    closed: AtomicBool,
}

/// Connect / disconnect / call lifecycle for a single MCP server
pub struct ConnectionService {
    supervisor: Arc<ProcessSupervisor>,
    builder: Arc<dyn TransportBuilder>,
    validator: CommandValidator,
    debug_log: DebugLog,
    state: StateCell,
    session: Mutex<Option<Arc<Session>>>,
    connect_cancel: Mutex<Option<CancellationToken>>,
    health: Mutex<HealthTracker>,
    notification_handler: Mutex<Option<NotificationHandler>>,
    next_id: AtomicI64,
}

impl fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionService")
            .field("state", &self.state.get())
            .field("builder", &self.builder)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

impl ConnectionService {
    /// Service with the real transport factory and a fresh supervisor
    pub fn new(settings: &ClientSettings) -> Self {
        let validator = match &settings.allowed_root {
            Some(root) => CommandValidator::with_allowed_root(root.clone()),
            None => CommandValidator::new(),
        };

        Self::with_parts(
            Arc::new(ProcessSupervisor::with_windows(
                settings.terminate_grace,
                settings.kill_wait,
            )),
            Arc::new(TransportFactory::new()),
            validator,
            DebugLog::new(settings.debug_capacity),
        )
    }

    /// Service from explicit collaborators
    pub fn with_parts(
        supervisor: Arc<ProcessSupervisor>,
        builder: Arc<dyn TransportBuilder>,
        validator: CommandValidator,
        debug_log: DebugLog,
    ) -> Self {
        Self {
            supervisor,
            builder,
            validator,
            debug_log,
            state: StateCell::new(),
            session: Mutex::new(None),
            connect_cancel: Mutex::new(None),
            health: Mutex::new(HealthTracker::default()),
            notification_handler: Mutex::new(None),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn debug_log(&self) -> &DebugLog {
        &self.debug_log
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Receive server notifications; applies from the next `connect`
    pub fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.notification_handler.lock_unpoisoned() = Some(handler);
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Establish a session and run the initialize handshake
    pub async fn connect(
        &self,
        config: ConnectionConfig,
    ) -> Result<InitializeResult, ConnectionError> {
        let result = self.connect_inner(config).await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    async fn connect_inner(
        &self,
        config: ConnectionConfig,
    ) -> Result<InitializeResult, ConnectionError> {
        self.begin_connect()?;

        let cancel = CancellationToken::new();
        *self.connect_cancel.lock_unpoisoned() = Some(cancel.clone());
        let mut attempt = ConnectAttempt::new(self);

        info!("Connecting to {} server: {}", config.transport, config.target());
        let outcome = self.establish(&config, &cancel, &mut attempt).await;

        let session = match outcome {
            Ok(session) if cancel.is_cancelled() => {
                release(&self.supervisor, session.process, Some(&session.transport)).await;
                attempt.settle(ConnectionState::Failed);
                return Err(ConnectionError::Cancelled);
            }
            Ok(session) => session,
            Err(e) => {
                warn!("Connection to {} failed: {}", config.target(), e);
                attempt.settle(ConnectionState::Failed);
                return Err(e);
            }
        };

        let server_info = session.server_info.clone();
        info!(
            "Connected to {} {} over {} (session {})",
            server_info.server_info.name,
            server_info.server_info.version,
            config.transport,
            session.id
        );

        self.health
            .lock_unpoisoned()
            .mark_connected(session.id, config.transport);
        *self.session.lock_unpoisoned() = Some(Arc::new(session));
        attempt.settle(ConnectionState::Connected);
        Ok(server_info)
    }

    /// Claim the Connecting state or explain why not
    fn begin_connect(&self) -> Result<(), ConnectionError> {
        match self.state.transition(ConnectionState::Connecting) {
            Ok(_) => Ok(()),
            Err(rejected) => match rejected.from {
                ConnectionState::Connected => Err(ConnectionError::AlreadyConnected),
                _ => Err(ConnectionError::Busy),
            },
        }
    }

    async fn establish(
        &self,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
        attempt: &mut ConnectAttempt<'_>,
    ) -> Result<Session, ConnectionError> {
        let mut spawned: Option<SpawnedProcess> = None;
        if config.transport == TransportKind::Stdio {
            self.validator.validate(&config.command, &config.args)?;
            spawned = Some(self.supervisor.spawn(&CommandSpec::from_config(config))?);
        }

        attempt.process = spawned.as_ref().map(SpawnedProcess::handle);
        let early_output = spawned.as_ref().map(|p| p.early_output().clone());

        let transport = match self.builder.build(config, spawned.as_mut()) {
            Ok(transport) => transport,
            Err(e) => {
                attempt.release().await;
                return Err(e.into());
            }
        };
        let transport: Arc<dyn Transport> =
            Arc::new(InstrumentedTransport::new(transport, self.debug_log.clone()));
        attempt.transport = Some(Arc::clone(&transport));

        let required_arguments: RequiredArguments = Arc::new(Mutex::new(HashMap::new()));
        transport.set_notification_handler(self.notification_router(Arc::clone(&required_arguments)));

        let handshake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            result = tokio::time::timeout(config.timeout, self.handshake(&transport)) => match result {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout {
                    method: methods::INITIALIZE.to_string(),
                    timeout: config.timeout,
                }
                .into()),
            },
        };

        match handshake {
            Ok(server_info) => {
                let process = attempt.process.take();
                attempt.transport = None;
                Ok(Session {
                    id: Uuid::new_v4(),
                    config: config.clone(),
                    transport,
                    process,
                    server_info,
                    required_arguments,
                    closed: AtomicBool::new(false),
                })
            }
            Err(error) => {
                let error = match (attempt.process, early_output) {
                    (Some(handle), Some(output)) if !matches!(error, ConnectionError::Cancelled) => {
                        self.diagnose_startup(handle, &output, error).await
                    }
                    _ => error,
                };
                attempt.release().await;
                Err(error)
            }
        }
    }

    async fn handshake(
        &self,
        transport: &Arc<dyn Transport>,
    ) -> Result<InitializeResult, ConnectionError> {
        let kind = transport.kind();
        transport
            .start()
            .await
            .map_err(|e| channel_error(kind, methods::INITIALIZE, e))?;

        let request = jsonrpc::request(
            self.next_request_id(),
            methods::INITIALIZE,
            Some(params::initialize_params(CLIENT_NAME, CLIENT_VERSION)),
        );
        let reply = transport
            .send_request(request)
            .await
            .map_err(|e| channel_error(kind, methods::INITIALIZE, e))?;

        let value = reply_result(methods::INITIALIZE, reply)?;
        let server_info: InitializeResult = parse_result(methods::INITIALIZE, value)?;
        debug!("Server capabilities: {:?}", server_info.capabilities);

        transport
            .send_notification(jsonrpc::notification(methods::INITIALIZED, None))
            .await
            .map_err(|e| channel_error(kind, methods::INITIALIZED, e))?;

        Ok(server_info)
    }

    /// Turn a failed stdio handshake into a startup failure when the output explains it
    async fn diagnose_startup(
        &self,
        handle: ProcessHandle,
        output: &EarlyOutput,
        error: ConnectionError,
    ) -> ConnectionError {
        let exit = self.supervisor.wait_for_exit(handle, STARTUP_EXIT_WAIT).await;
        if exit.is_some() {
            tokio::time::sleep(OUTPUT_SETTLE).await;
        }
        let exit_code = exit.and_then(|record| record.code);
        let captured = output.snapshot();

        if captured.protocol_seen {
            debug!("Protocol traffic seen from {}; skipping startup classification", handle.id());
        } else {
            let classification = startup::classify(exit_code, &captured.text);
            if classification.is_classified() {
                warn!(
                    "Server {} failed to start: {} (exit code {:?})",
                    handle.id(),
                    classification.category,
                    exit_code
                );
                return ConnectionError::StartupFailure {
                    classification,
                    exit_code,
                };
            }
        }

        match error {
            ConnectionError::Protocol { source, evidence } => ConnectionError::Protocol {
                source,
                evidence: evidence.or_else(|| captured.tail(EVIDENCE_LINES)),
            },
            other => other,
        }
    }

    fn notification_router(&self, required_arguments: RequiredArguments) -> NotificationHandler {
        let forward = self.notification_handler.lock_unpoisoned().clone();
        Arc::new(move |notification: JsonrpcNotification| {
            debug!("Server notification: {}", notification.method);
            if notification.method == methods::TOOLS_LIST_CHANGED {
                required_arguments.lock_unpoisoned().clear();
            }
            if let Some(forward) = &forward {
                forward(notification);
            }
        })
    }

    // ========================================================================
    // Disconnect
    // ========================================================================

    /// Tear down the current session
    ///
    /// Idempotent. Concurrent callers perform the cleanup once; the others
    /// wait for it to finish. During `Connecting` the attempt is cancelled.
    pub async fn disconnect(&self) {
        loop {
            match self.state.get() {
                ConnectionState::Idle => return,
                ConnectionState::Failed => {
                    if self.state.transition(ConnectionState::Idle).is_ok() {
                        return;
                    }
                }
                ConnectionState::Connecting => {
                    if let Some(token) = self.connect_cancel.lock_unpoisoned().as_ref() {
                        debug!("Cancelling connection attempt");
                        token.cancel();
                    }
                    self.state
                        .wait_for(|s| *s != ConnectionState::Connecting)
                        .await;
                }
                ConnectionState::Disconnecting => {
                    self.state
                        .wait_for(|s| *s != ConnectionState::Disconnecting)
                        .await;
                    return;
                }
                ConnectionState::Connected => {
                    let Some(session) = self.session.lock_unpoisoned().clone() else {
                        return;
                    };

                    if session.closed.swap(true, Ordering::SeqCst) {
                        self.state
                            .wait_for(|s| {
                                !matches!(
                                    s,
                                    ConnectionState::Connected | ConnectionState::Disconnecting
                                )
                            })
                            .await;
                        return;
                    }

                    self.set_state(ConnectionState::Disconnecting);
                    info!(
                        "Disconnecting from {} (session {})",
                        session.config.target(),
                        session.id
                    );
                    release(&self.supervisor, session.process, Some(&session.transport)).await;

                    self.session.lock_unpoisoned().take();
                    self.health.lock_unpoisoned().mark_disconnected();
                    self.set_state(ConnectionState::Idle);
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Round-trip a `ping`
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        let started = Instant::now();
        self.request_value(methods::PING, None).await?;
        Ok(started.elapsed())
    }

    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<ListToolsResult, ConnectionError> {
        let value = self
            .request_value(methods::TOOLS_LIST, params::list_params(cursor))
            .await?;

        if let Ok(session) = self.active_session() {
            session
                .required_arguments
                .lock_unpoisoned()
                .extend(params::required_arguments(&value));
        }
        self.parse(methods::TOOLS_LIST, value)
    }

    /// Call a tool; empty collections are shaped against its input schema
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ConnectionError> {
        let required = self.required_arguments_for(name).await;
        let value = self
            .request_value(
                methods::TOOLS_CALL,
                Some(params::call_tool_params(name, &arguments, &required)),
            )
            .await?;
        self.parse(methods::TOOLS_CALL, value)
    }

    pub async fn list_resources(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListResourcesResult, ConnectionError> {
        self.request(methods::RESOURCES_LIST, params::list_params(cursor))
            .await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListResourceTemplatesResult, ConnectionError> {
        self.request(methods::RESOURCE_TEMPLATES_LIST, params::list_params(cursor))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ConnectionError> {
        self.request(methods::RESOURCES_READ, Some(params::read_resource_params(uri)))
            .await
    }

    pub async fn list_prompts(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListPromptsResult, ConnectionError> {
        self.request(methods::PROMPTS_LIST, params::list_params(cursor))
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<GetPromptResult, ConnectionError> {
        self.request(
            methods::PROMPTS_GET,
            Some(params::get_prompt_params(name, arguments)),
        )
        .await
    }

    /// Handshake result of the current session
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.session
            .lock_unpoisoned()
            .as_ref()
            .map(|session| session.server_info.clone())
    }

    pub fn health(&self) -> ConnectionHealth {
        let state = self.state.get();
        let mut health = self.health.lock_unpoisoned().snapshot(state);
        if let Some(session) = self.session.lock_unpoisoned().as_ref() {
            health.connected = health.connected && session.transport.is_connected();
        }
        health
    }

    pub fn error_statistics(&self) -> BTreeMap<ErrorCategory, u64> {
        self.health.lock_unpoisoned().error_counts()
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    async fn request<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Option<Map<String, Value>>,
    ) -> Result<T, ConnectionError> {
        let value = self.request_value(method, params).await?;
        self.parse(method, value)
    }

    async fn request_value(
        &self,
        method: &'static str,
        params: Option<Map<String, Value>>,
    ) -> Result<Value, ConnectionError> {
        let result = self.send(method, params).await;
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    async fn send(
        &self,
        method: &'static str,
        params: Option<Map<String, Value>>,
    ) -> Result<Value, ConnectionError> {
        let session = self.active_session()?;
        let kind = session.transport.kind();
        let timeout = session.config.request_timeout;
        let request = jsonrpc::request(self.next_request_id(), method, params);

        let reply = match tokio::time::timeout(timeout, session.transport.send_request(request)).await {
            Ok(reply) => reply.map_err(|e| channel_error(kind, method, e))?,
            Err(_) => {
                return Err(ProtocolError::Timeout {
                    method: method.to_string(),
                    timeout,
                }
                .into());
            }
        };
        reply_result(method, reply)
    }

    fn parse<T: DeserializeOwned>(&self, method: &str, value: Value) -> Result<T, ConnectionError> {
        parse_result(method, value).inspect_err(|e| self.record_error(e))
    }

    async fn required_arguments_for(&self, tool: &str) -> HashSet<String> {
        if let Some(required) = self.cached_required(tool) {
            return required;
        }

        debug!("No cached schema for tool {}; refreshing tool list", tool);
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_SCHEMA_PAGES {
            match self.list_tools(cursor.as_deref()).await {
                Ok(page) => cursor = page.next_cursor,
                Err(e) => {
                    debug!("Tool list refresh failed: {}", e);
                    break;
                }
            }
            if self.cached_required(tool).is_some() || cursor.is_none() {
                break;
            }
        }
        self.cached_required(tool).unwrap_or_default()
    }

    fn cached_required(&self, tool: &str) -> Option<HashSet<String>> {
        let session = self.active_session().ok()?;
        let cached = session.required_arguments.lock_unpoisoned().get(tool).cloned();
        cached
    }

    fn active_session(&self) -> Result<Arc<Session>, ConnectionError> {
        let state = self.state.get();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected { state });
        }
        self.session
            .lock_unpoisoned()
            .clone()
            .ok_or(ConnectionError::NotConnected { state })
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Err(e) = self.state.transition(next) {
            warn!("{}", e);
        }
    }

    fn record_error(&self, error: &ConnectionError) {
        self.health.lock_unpoisoned().record_error(error);
    }
}

/// Stdio channel failures are protocol errors; remote ones are transport errors
fn channel_error(kind: TransportKind, method: &str, error: TransportError) -> ConnectionError {
    if kind.is_remote() {
        ConnectionError::Transport(error)
    } else {
        ProtocolError::Channel {
            method: method.to_string(),
            source: error,
        }
        .into()
    }
}

fn reply_result(method: &str, reply: Reply) -> Result<Value, ConnectionError> {
    reply.into_result().map_err(|error| {
        ProtocolError::Server {
            method: method.to_string(),
            code: error.code,
            message: error.message,
            data: error.data,
        }
        .into()
    })
}

/// Close the transport and stop the process, logging rather than failing
async fn release(
    supervisor: &ProcessSupervisor,
    process: Option<ProcessHandle>,
    transport: Option<&Arc<dyn Transport>>,
) {
    if let Some(transport) = transport
        && let Err(e) = transport.close().await
    {
        debug!("Error closing {} transport: {}", transport.kind(), e);
    }

    if let Some(handle) = process {
        match supervisor.terminate(handle).await {
            TerminationOutcome::Unconfirmed => {
                warn!("Process {} did not confirm exit; left to the reaper", handle.id())
            }
            outcome => debug!("Process {} terminated: {:?}", handle.id(), outcome),
        }
    }
}

/// Resources of an in-flight `connect`
///
/// Settled explicitly once the attempt reaches its final state. If the
/// `connect` future is dropped first, `Drop` moves the service to `Failed`
/// and hands whatever was acquired to a background release.
struct ConnectAttempt<'a> {
    service: &'a ConnectionService,
    process: Option<ProcessHandle>,
    transport: Option<Arc<dyn Transport>>,
    settled: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn new(service: &'a ConnectionService) -> Self {
        Self {
            service,
            process: None,
            transport: None,
            settled: false,
        }
    }

    /// Release what has been acquired so far
    async fn release(&mut self) {
        release(&self.service.supervisor, self.process, self.transport.as_ref()).await;
        self.process = None;
        self.transport = None;
    }

    fn settle(&mut self, state: ConnectionState) {
        self.settled = true;
        self.service.connect_cancel.lock_unpoisoned().take();
        self.service.set_state(state);
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        warn!("Connection attempt abandoned before it completed; rolling back");
        let process = self.process.take();
        let transport = self.transport.take();
        if process.is_some() || transport.is_some() {
            let supervisor = Arc::clone(&self.service.supervisor);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        release(&supervisor, process, transport.as_ref()).await;
                    });
                }
                Err(_) => warn!("No runtime left to release the abandoned connection"),
            }
        }

        self.service.record_error(&ConnectionError::Cancelled);
        self.settle(ConnectionState::Failed);
    }
}

fn parse_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, ConnectionError> {
    serde_json::from_value(value).map_err(|source| {
        ProtocolError::InvalidResult {
            method: method.to_string(),
            source,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::SpawnedProcess;
    use crate::startup::StartupCategory;
    use crate::transport::mock::MockTransport;
    use serde_json::json;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn initialize_result() -> Value {
        json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock-server", "version": "1.0.0"}
        })
    }

    fn tools_result() -> Value {
        json!({
            "tools": [{
                "name": "search",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "paths": {"type": "array"},
                        "tags": {"type": "array"}
                    },
                    "required": ["paths"]
                }
            }]
        })
    }

    /// Builder handing out one prepared transport
    #[derive(Debug)]
    struct MockBuilder(Arc<MockTransport>);

    impl TransportBuilder for MockBuilder {
        fn build(
            &self,
            _config: &ConnectionConfig,
            _process: Option<&mut SpawnedProcess>,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            Ok(self.0.clone())
        }
    }

    fn mock_service() -> (ConnectionService, Arc<MockTransport>) {
        let mock = MockTransport::new(TransportKind::Http);
        mock.respond("initialize", initialize_result());
        let service = ConnectionService::with_parts(
            Arc::new(ProcessSupervisor::new()),
            Arc::new(MockBuilder(mock.clone())),
            CommandValidator::new(),
            DebugLog::new(100),
        );
        (service, mock)
    }

    fn http_config() -> ConnectionConfig {
        ConnectionConfig::http("http://127.0.0.1:1/mcp")
            .with_timeout(Duration::from_secs(5))
            .with_request_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_connect_runs_handshake() {
        let (service, mock) = mock_service();

        let info = service.connect(http_config()).await.unwrap();
        assert_eq!(info.server_info.name, "mock-server");
        assert_eq!(service.state(), ConnectionState::Connected);
        let health = service.health();
        assert!(health.connected);
        assert!(health.session_id.is_some());

        let requests = mock.sent_requests();
        assert_eq!(requests[0].method, "initialize");
        assert_eq!(mock.sent_params()[0]["clientInfo"]["name"], "mcp-probe");
        let notifications = mock.sent_notifications();
        assert_eq!(notifications[0].method, "notifications/initialized");
        assert_eq!(
            service.server_info().map(|info| info.server_info.version),
            Some("1.0.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (service, mock) = mock_service();

        let result = service.list_tools(None).await;
        assert!(matches!(
            result,
            Err(ConnectionError::NotConnected {
                state: ConnectionState::Idle
            })
        ));
        assert!(mock.sent_requests().is_empty());
        assert_eq!(
            service.error_statistics().get(&ErrorCategory::NotConnected),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_call_tool_shapes_empty_collections() {
        let (service, mock) = mock_service();
        mock.respond("tools/list", tools_result());
        mock.respond(
            "tools/call",
            json!({"content": [{"type": "text", "text": "found"}]}),
        );
        service.connect(http_config()).await.unwrap();

        let arguments = json!({"paths": [], "tags": [], "query": "x"});
        let result = service
            .call_tool("search", arguments.as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(result.content.len(), 1);

        // Schema fetched on demand, then the call
        let requests = mock.sent_requests();
        assert_eq!(requests[1].method, "tools/list");
        assert_eq!(requests[2].method, "tools/call");
        assert_eq!(
            mock.sent_params()[2],
            json!({"name": "search", "arguments": {"paths": [], "query": "x"}})
        );

        // Cached from now on
        service
            .call_tool("search", Map::new())
            .await
            .unwrap();
        let requests = mock.sent_requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(mock.sent_params()[3], json!({"name": "search"}));
    }

    #[tokio::test]
    async fn test_list_changed_clears_schema_cache() {
        let (service, mock) = mock_service();
        mock.respond("tools/list", tools_result());
        mock.respond("tools/call", json!({"content": []}));
        service.connect(http_config()).await.unwrap();
        service.list_tools(None).await.unwrap();

        mock.emit(jsonrpc::notification("notifications/tools/list_changed", None));
        service.call_tool("search", Map::new()).await.unwrap();

        let methods: Vec<String> = mock.sent_requests().into_iter().map(|r| r.method).collect();
        assert_eq!(methods, vec!["initialize", "tools/list", "tools/list", "tools/call"]);
    }

    #[tokio::test]
    async fn test_connect_while_connected_and_busy() {
        let (service, mock) = mock_service();
        service.connect(http_config()).await.unwrap();
        assert!(matches!(
            service.connect(http_config()).await,
            Err(ConnectionError::AlreadyConnected)
        ));
        service.disconnect().await;

        mock.set_delay(Duration::from_millis(300));
        let service = Arc::new(service);
        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.connect(http_config()).await })
        };
        service
            .wait_for_state(ConnectionState::Connecting)
            .await;

        assert!(matches!(
            service.connect(http_config()).await,
            Err(ConnectionError::Busy)
        ));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_disconnect_cleans_up_once() {
        let (service, mock) = mock_service();
        service.connect(http_config()).await.unwrap();

        tokio::join!(service.disconnect(), service.disconnect());

        assert_eq!(mock.close_calls(), 1);
        assert_eq!(service.state(), ConnectionState::Idle);
        assert!(service.server_info().is_none());

        // Repeated disconnect is a no-op
        service.disconnect().await;
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connect() {
        let (service, mock) = mock_service();
        mock.hang("initialize");
        let service = Arc::new(service);

        let attempt = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.connect(http_config()).await })
        };
        service
            .wait_for_state(ConnectionState::Connecting)
            .await;
        // Let the attempt reach the handshake
        tokio::time::sleep(Duration::from_millis(50)).await;

        service.disconnect().await;

        assert!(matches!(
            attempt.await.unwrap(),
            Err(ConnectionError::Cancelled)
        ));
        assert_eq!(service.state(), ConnectionState::Idle);
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connect_rolls_back() {
        let (service, mock) = mock_service();
        mock.hang("initialize");

        // The caller gives up on its own; connect never returns
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), service.connect(http_config())).await;
        assert!(abandoned.is_err());
        assert_eq!(service.state(), ConnectionState::Failed);
        assert_eq!(
            service.error_statistics().get(&ErrorCategory::Cancelled),
            Some(&1)
        );

        tokio::time::timeout(Duration::from_secs(2), service.disconnect())
            .await
            .unwrap();
        assert_eq!(service.state(), ConnectionState::Idle);

        // The half-built transport is closed in the background
        tokio::time::timeout(Duration::from_secs(2), async {
            while mock.close_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        mock.respond("initialize", initialize_result());
        service.connect(http_config()).await.unwrap();
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_timeout_then_reconnect() {
        let (service, mock) = mock_service();
        mock.hang("initialize");

        let result = service
            .connect(http_config().with_timeout(Duration::from_millis(100)))
            .await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol {
                source: ProtocolError::Timeout { .. },
                ..
            })
        ));
        assert_eq!(service.state(), ConnectionState::Failed);
        assert_eq!(mock.close_calls(), 1);

        // Failed -> Connecting is allowed
        mock.respond("initialize", initialize_result());
        service.connect(http_config()).await.unwrap();
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_request_timeout_and_server_error() {
        let (service, mock) = mock_service();
        mock.hang("resources/list");
        mock.fail("prompts/get", -32602, "unknown prompt");
        service
            .connect(http_config().with_request_timeout(Duration::from_millis(100)))
            .await
            .unwrap();

        let result = service.list_resources(None).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol {
                source: ProtocolError::Timeout { .. },
                ..
            })
        ));

        let result = service.get_prompt("missing", &HashMap::new()).await;
        match result {
            Err(ConnectionError::Protocol {
                source: ProtocolError::Server { code, message, .. },
                ..
            }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "unknown prompt");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(service.error_statistics().get(&ErrorCategory::Protocol), Some(&2));
        let health = service.health();
        assert!(health.last_error.unwrap().message.contains("unknown prompt"));
        // The session survives request failures
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_remote_channel_failure_is_transport_error() {
        let (service, mock) = mock_service();
        service.connect(http_config()).await.unwrap();

        // Unscripted method: the mock reports a missing response
        let result = service.ping().await;
        assert!(matches!(
            result,
            Err(ConnectionError::Transport(TransportError::ResponseMissing { .. }))
        ));
    }

    #[tokio::test]
    async fn test_traffic_recorded_in_debug_log() {
        let (service, mock) = mock_service();
        mock.respond("ping", json!({}));
        service.connect(http_config()).await.unwrap();
        service.ping().await.unwrap();

        let methods: Vec<Option<String>> = service
            .debug_log()
            .snapshot()
            .into_iter()
            .map(|entry| entry.method)
            .collect();
        assert!(methods.contains(&Some("initialize".to_string())));
        assert!(methods.contains(&Some("notifications/initialized".to_string())));
        assert!(methods.contains(&Some("ping".to_string())));
    }

    impl ConnectionService {
        async fn wait_for_state(&self, wanted: ConnectionState) {
            tokio::time::timeout(Duration::from_secs(5), self.state.wait_for(|s| *s == wanted))
                .await
                .unwrap();
        }
    }

    #[cfg(unix)]
    mod stdio {
        use super::*;
        use crate::test_utils::fake_server;

        fn stdio_service() -> ConnectionService {
            ConnectionService::new(&ClientSettings::default())
        }

        #[tokio::test]
        async fn test_metacharacter_command_never_spawns() {
            let service = stdio_service();

            let result = service
                .connect(ConnectionConfig::stdio("ls;rm -rf /", vec![]))
                .await;

            assert!(matches!(result, Err(ConnectionError::Validation(_))));
            assert_eq!(service.supervisor().tracked_count(), 0);
            assert_eq!(service.state(), ConnectionState::Failed);
        }

        #[tokio::test]
        async fn test_missing_env_var_is_startup_failure() {
            let service = stdio_service();
            let config = fake_server::config(
                "echo 'Error: X environment variable is required' >&2; exit 1".to_string(),
            );

            let result = service.connect(config).await;

            match result {
                Err(ConnectionError::StartupFailure {
                    classification,
                    exit_code,
                }) => {
                    assert_eq!(classification.category, StartupCategory::MissingEnvVar);
                    assert!(classification.remediation.unwrap().contains('X'));
                    assert_eq!(exit_code, Some(1));
                }
                other => panic!("expected startup failure, got {other:?}"),
            }
            assert_eq!(service.supervisor().tracked_count(), 0);
        }

        #[tokio::test]
        async fn test_non_server_is_protocol_error() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
            let service = stdio_service();

            let result = service
                .connect(ConnectionConfig::stdio("/bin/ls", vec![]).with_cwd(dir.path()))
                .await;

            match result {
                Err(ConnectionError::Protocol { evidence, .. }) => {
                    assert_eq!(evidence.as_deref(), Some("notes.txt"));
                }
                other => panic!("expected protocol error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_stdio_session_lifecycle() {
            let service = stdio_service();
            let config = fake_server::with_tools(
                r#"{"tools":[{"name":"echo","inputSchema":{"type":"object","properties":{}}}]}"#,
            );

            let info = service.connect(config).await.unwrap();
            assert_eq!(info.server_info.name, "fake-server");
            assert_eq!(service.supervisor().tracked_count(), 1);

            let tools = service.list_tools(None).await.unwrap();
            assert_eq!(tools.tools[0].name, "echo");

            service.disconnect().await;
            assert_eq!(service.state(), ConnectionState::Idle);
            assert_eq!(service.supervisor().tracked_count(), 0);
        }

        #[tokio::test]
        async fn test_dropped_connect_stops_server() {
            let service = stdio_service();
            let config = fake_server::config("while read -r line; do :; done".to_string());

            let abandoned =
                tokio::time::timeout(Duration::from_millis(200), service.connect(config)).await;
            assert!(abandoned.is_err());
            assert_eq!(service.state(), ConnectionState::Failed);

            tokio::time::timeout(Duration::from_secs(10), async {
                while service.supervisor().tracked_count() > 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn test_handshake_timeout_with_silent_server() {
            let service = stdio_service();
            let config = fake_server::config("echo 'warming up' >&2; while read -r line; do :; done".to_string())
                .with_timeout(Duration::from_millis(200));

            let result = service.connect(config).await;

            match result {
                Err(ConnectionError::Protocol {
                    source: ProtocolError::Timeout { .. },
                    evidence,
                }) => assert_eq!(evidence.as_deref(), Some("warming up")),
                other => panic!("expected handshake timeout, got {other:?}"),
            }
            assert_eq!(service.supervisor().tracked_count(), 0);
        }
    }
}
