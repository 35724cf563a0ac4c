//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and fake MCP servers.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG` (default: debug for this crate, info for the HTTP
    /// stack) and writes through the test writer.
    ///
    /// ```bash
    /// RUST_LOG=mcp_probe::transport=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("debug,tokio=info,hyper=info,hyper_util=info,reqwest=info")
            });

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok(); // Ignore errors if already initialized by another test
        });
    }
}

/// Fake MCP servers as `sh -c` scripts
///
/// Scripts avoid `$(`, `${` and backticks so they pass the command validator.
#[cfg(all(test, unix))]
pub mod fake_server {
    use crate::config::ConnectionConfig;

    /// `initialize` result every fake server returns
    pub const INITIALIZE_RESULT: &str = r#"{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"fake-server","version":"0.1.0"}}"#;

    /// Script answering `(method, result)` pairs
    ///
    /// Request ids are echoed by position: the service numbers requests from
    /// 1 upwards, so the n-th scripted answer carries id n. Unknown methods
    /// and notifications are ignored.
    pub fn script(answers: &[(&str, &str)]) -> String {
        let mut script = String::from("while read -r line; do case \"$line\" in ");
        for (index, (method, result)) in answers.iter().enumerate() {
            script.push_str(&format!(
                "*'\"method\":\"{method}\"'*) echo '{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{result}}}' ;; ",
                id = index + 1,
            ));
        }
        script.push_str("*) : ;; esac; done");
        script
    }

    /// Stdio config running `script` under `sh -c`
    pub fn config(script: String) -> ConnectionConfig {
        ConnectionConfig::stdio("sh", vec!["-c".to_string(), script])
    }

    /// Server that completes the handshake and answers `tools/list`
    pub fn with_tools(tools_result: &str) -> ConnectionConfig {
        config(script(&[
            ("initialize", INITIALIZE_RESULT),
            ("tools/list", tools_result),
        ]))
    }
}
