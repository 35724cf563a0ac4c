use clap::{Args as ClapArgs, Parser, Subcommand};
use mcp_probe::logging::{LogConfig, init_logging};
use mcp_probe::{
    ClientSettings, ConnectionConfig, ConnectionError, ConnectionService, TransportKind,
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Command-line MCP client for poking at servers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides MCP_PROBE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Handshake timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Per-request timeout in milliseconds
    #[arg(long, value_name = "MS")]
    request_timeout: Option<u64>,

    /// Number of protocol messages kept for --show-traffic (overrides MCP_PROBE_DEBUG_CAPACITY)
    #[arg(long, value_name = "N")]
    debug_capacity: Option<usize>,

    /// Reject server paths that escape this directory (overrides MCP_PROBE_ALLOWED_ROOT)
    #[arg(long, value_name = "DIR")]
    allowed_root: Option<PathBuf>,

    /// Print the captured protocol traffic to stderr when done
    #[arg(long)]
    show_traffic: bool,

    #[command(subcommand)]
    operation: Operation,
}

/// Where the server lives
#[derive(ClapArgs, Debug)]
struct ServerArgs {
    /// Transport: stdio, event-stream (sse) or http
    #[arg(long, value_name = "KIND", default_value = "stdio")]
    transport: TransportKind,

    /// Server URL (event-stream and http)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Extra HTTP header, repeatable
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_key_value)]
    headers: Vec<(String, String)>,

    /// Extra environment variable for the server process, repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Working directory for the server process
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Server command and arguments (stdio), after `--`
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Operation {
    /// Connect and ping the server
    Ping {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// List tools
    Tools {
        #[arg(long)]
        cursor: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Call a tool
    Call {
        /// Tool name
        name: String,
        /// Tool argument; the value is parsed as JSON when possible, repeatable
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        arguments: Vec<(String, String)>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// List resources
    Resources {
        #[arg(long)]
        cursor: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// List resource templates
    Templates {
        #[arg(long)]
        cursor: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Read a resource
    Read {
        uri: String,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// List prompts
    Prompts {
        #[arg(long)]
        cursor: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Get a prompt
    Prompt {
        name: String,
        /// Prompt argument, repeatable
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        arguments: Vec<(String, String)>,
        #[command(flatten)]
        server: ServerArgs,
    },
}

impl Operation {
    fn server(&self) -> &ServerArgs {
        match self {
            Operation::Ping { server }
            | Operation::Tools { server, .. }
            | Operation::Call { server, .. }
            | Operation::Resources { server, .. }
            | Operation::Templates { server, .. }
            | Operation::Read { server, .. }
            | Operation::Prompts { server, .. }
            | Operation::Prompt { server, .. } => server,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// Build the connection config from the command line
fn connection_config(args: &Args) -> Result<ConnectionConfig, String> {
    let server = args.operation.server();

    let mut config = match server.transport {
        TransportKind::Stdio => {
            let (command, rest) = server
                .command
                .split_first()
                .ok_or("stdio transport needs the server command after --")?;
            ConnectionConfig::stdio(command.clone(), rest.to_vec())
        }
        kind => {
            let url = server
                .url
                .clone()
                .ok_or_else(|| format!("{kind} transport needs --url"))?;
            if kind == TransportKind::EventStream {
                ConnectionConfig::event_stream(url)
            } else {
                ConnectionConfig::http(url)
            }
        }
    };

    for (name, value) in &server.headers {
        config = config.with_header(name, value);
    }
    for (key, value) in &server.env {
        config = config.with_env(key, value);
    }
    if let Some(cwd) = &server.cwd {
        config = config.with_cwd(cwd);
    }
    if let Some(ms) = args.timeout {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = args.request_timeout {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "unserializable": e.to_string() }))
}

/// Connect, run one operation and return its JSON result
async fn run(
    service: &ConnectionService,
    config: ConnectionConfig,
    operation: &Operation,
) -> Result<Value, ConnectionError> {
    let info = service.connect(config).await?;

    let value = match operation {
        Operation::Ping { .. } => {
            let round_trip = service.ping().await?;
            json!({
                "server": info.server_info,
                "protocolVersion": info.protocol_version,
                "roundTripMs": round_trip.as_millis(),
            })
        }
        Operation::Tools { cursor, .. } => to_json(&service.list_tools(cursor.as_deref()).await?),
        Operation::Call {
            name, arguments, ..
        } => {
            let arguments: Map<String, Value> = arguments
                .iter()
                .map(|(key, raw)| {
                    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
                    (key.clone(), value)
                })
                .collect();
            to_json(&service.call_tool(name, arguments).await?)
        }
        Operation::Resources { cursor, .. } => {
            to_json(&service.list_resources(cursor.as_deref()).await?)
        }
        Operation::Templates { cursor, .. } => {
            to_json(&service.list_resource_templates(cursor.as_deref()).await?)
        }
        Operation::Read { uri, .. } => to_json(&service.read_resource(uri).await?),
        Operation::Prompts { cursor, .. } => {
            to_json(&service.list_prompts(cursor.as_deref()).await?)
        }
        Operation::Prompt {
            name, arguments, ..
        } => {
            let arguments: HashMap<String, String> = arguments.iter().cloned().collect();
            to_json(&service.get_prompt(name, &arguments).await?)
        }
    };

    Ok(value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let settings =
        ClientSettings::from_env().with_overrides(args.debug_capacity, args.allowed_root.clone());

    let config = match connection_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid server configuration: {e}");
            std::process::exit(2);
        }
    };

    let service = Arc::new(ConnectionService::new(&settings));

    // Ctrl-C tears the session down; the pending operation then fails and we exit normally
    let interrupted = Arc::clone(&service);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, disconnecting");
            interrupted.disconnect().await;
        }
    });

    let outcome = run(&service, config, &args.operation).await;

    if args.show_traffic {
        for entry in service.debug_log().snapshot() {
            eprintln!("{entry}");
        }
    }
    service.disconnect().await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", serde_json::to_string_pretty(&e.report())?);
            std::process::exit(1);
        }
    }
}
