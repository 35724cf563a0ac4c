//! Transport construction from a connection config

use super::{EventStreamTransport, HttpTransport, StdioTransport, Transport, TransportError};
use crate::config::{ConnectionConfig, TransportKind};
use crate::io::process::SpawnedProcess;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds transports; the seam `ConnectionService` depends on
pub trait TransportBuilder: Send + Sync + fmt::Debug {
    fn build(
        &self,
        config: &ConnectionConfig,
        process: Option<&mut SpawnedProcess>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Builds the real transport for a config's declared kind
#[derive(Debug, Clone, Default)]
pub struct TransportFactory;

impl TransportFactory {
    pub fn new() -> Self {
        Self
    }

    fn build_stdio(
        config: &ConnectionConfig,
        process: Option<&mut SpawnedProcess>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if config.command.trim().is_empty() {
            return Err(TransportError::MissingField {
                kind: TransportKind::Stdio,
                field: "command",
            });
        }

        let process = process.ok_or(TransportError::ProcessNotRunning)?;
        let (stdin, stdout) = process.take_stdio().ok_or(TransportError::PipesUnavailable)?;

        Ok(Arc::new(StdioTransport::new(
            stdin,
            stdout,
            process.handle().pid(),
            process.early_output().clone(),
        )))
    }

    fn build_remote(config: &ConnectionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let url = parse_url(config)?;
        let headers = header_map(config)?;

        // No overall timeout: the event stream must outlive any single call
        let client = Client::builder().connect_timeout(config.timeout).build()?;

        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::EventStream => Arc::new(EventStreamTransport::new(
                url,
                client,
                headers,
                config.request_timeout,
            )),
            _ => Arc::new(HttpTransport::new(url, client, headers, config.request_timeout)),
        };
        Ok(transport)
    }
}

impl TransportBuilder for TransportFactory {
    fn build(
        &self,
        config: &ConnectionConfig,
        process: Option<&mut SpawnedProcess>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        debug!("Building {} transport for {}", config.transport, config.target());
        match config.transport {
            TransportKind::Stdio => Self::build_stdio(config, process),
            TransportKind::EventStream | TransportKind::Http => Self::build_remote(config),
        }
    }
}

fn parse_url(config: &ConnectionConfig) -> Result<Url, TransportError> {
    if config.url.trim().is_empty() {
        return Err(TransportError::MissingField {
            kind: config.transport,
            field: "url",
        });
    }

    let url = Url::parse(config.url.trim()).map_err(|e| TransportError::InvalidUrl {
        url: config.url.clone(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(TransportError::InvalidUrl {
            url: config.url.clone(),
            reason: format!("unsupported scheme {scheme:?}"),
        }),
    }
}

fn header_map(config: &ConnectionConfig) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let invalid = || TransportError::InvalidHeader { name: name.clone() };
        let name_value = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        headers.insert(name_value, header_value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remote_kinds() {
        let factory = TransportFactory::new();

        let sse = factory
            .build(&ConnectionConfig::event_stream("http://localhost:3000/sse"), None)
            .unwrap();
        assert_eq!(sse.kind(), TransportKind::EventStream);
        assert!(!sse.is_connected());

        let http = factory
            .build(
                &ConnectionConfig::http("https://example.com/mcp").with_header("Authorization", "Bearer t"),
                None,
            )
            .unwrap();
        assert_eq!(http.kind(), TransportKind::Http);
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let factory = TransportFactory::new();

        assert!(matches!(
            factory.build(&ConnectionConfig::http(""), None),
            Err(TransportError::MissingField { field: "url", .. })
        ));
        assert!(matches!(
            factory.build(&ConnectionConfig::event_stream("not a url"), None),
            Err(TransportError::InvalidUrl { .. })
        ));
        assert!(matches!(
            factory.build(&ConnectionConfig::http("ftp://example.com"), None),
            Err(TransportError::InvalidUrl { .. })
        ));
        assert!(matches!(
            factory.build(&ConnectionConfig::stdio("", vec![]), None),
            Err(TransportError::MissingField { field: "command", .. })
        ));
        assert!(matches!(
            factory.build(
                &ConnectionConfig::http("http://localhost/mcp").with_header("bad header", "x"),
                None
            ),
            Err(TransportError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_stdio_requires_process() {
        let factory = TransportFactory::new();
        assert!(matches!(
            factory.build(&ConnectionConfig::stdio("server", vec![]), None),
            Err(TransportError::ProcessNotRunning)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_pipes_claimed_once() {
        use crate::io::process::{CommandSpec, ProcessSupervisor};

        let supervisor = ProcessSupervisor::new();
        let mut process = supervisor.spawn(&CommandSpec::new("cat", vec![])).unwrap();
        let config = ConnectionConfig::stdio("cat", vec![]);
        let factory = TransportFactory::new();

        let transport = factory.build(&config, Some(&mut process)).unwrap();
        assert_eq!(transport.kind(), TransportKind::Stdio);
        assert!(matches!(
            factory.build(&config, Some(&mut process)),
            Err(TransportError::PipesUnavailable)
        ));

        supervisor.kill_all().await;
    }
}
