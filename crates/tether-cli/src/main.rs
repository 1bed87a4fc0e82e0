//! Tether CLI: talk to MCP servers from the terminal.

mod notify;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tether_client::{ConnectionState, McpClient, McpError};
use tether_config::{CliOverrides, ServerConfig, TetherConfig};
use tether_types::schema::LoggingLevel;

#[derive(Parser)]
#[command(name = "tether", version, about = "Command-line client for MCP servers")]
struct Cli {
    /// Config file, layered over ~/.tether/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server to connect to, as named in the config
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Per-request timeout in milliseconds (0 disables it)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured servers
    Servers,
    /// List the server's tools
    Tools,
    /// Call a tool
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// List the server's resources
    Resources {
        #[arg(long)]
        cursor: Option<String>,
        /// List resource templates instead
        #[arg(long)]
        templates: bool,
    },
    /// Read a resource
    Read { uri: String },
    /// List the server's prompts
    Prompts {
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Get a prompt
    Prompt {
        name: String,
        /// Prompt arguments as a JSON object of strings
        #[arg(long)]
        args: Option<String>,
    },
    /// Ping the server
    Ping,
    /// Stay connected and print state changes and notifications
    Watch {
        /// Resource URIs to subscribe to
        #[arg(long)]
        subscribe: Vec<String>,
        /// Ask the server to send logs at this level or above
        #[arg(long, value_parser = parse_logging_level)]
        log_level: Option<LoggingLevel>,
        /// Ping interval in milliseconds
        #[arg(long)]
        heartbeat_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let heartbeat_interval_ms = match &cli.command {
        Command::Watch { heartbeat_ms, .. } => *heartbeat_ms,
        _ => None,
    };
    let config = TetherConfig::load(CliOverrides {
        config_file: cli.config,
        request_timeout_ms: cli.timeout_ms,
        heartbeat_interval_ms,
    })
    .context("Failed to load configuration")?;

    if let Command::Servers = cli.command {
        return print_json(&config.settings.servers);
    }

    let name = pick_server(&config, cli.server)?;
    let server = config.server(&name)?;
    let watching = matches!(cli.command, Command::Watch { .. });
    let reconnects = server.client.reconnect.enabled;
    let client = connect(server, watching).await?;

    let result = run(&client, cli.command, reconnects).await;
    client.disconnect().await;
    result
}

/// The named server, or the only configured one.
fn pick_server(config: &TetherConfig, requested: Option<String>) -> Result<String> {
    if let Some(name) = requested {
        return Ok(name);
    }
    match config.server_names().as_slice() {
        [only] => Ok(only.clone()),
        [] => bail!(
            "No servers configured; add a [servers.<name>] table to {}",
            config.config_dir.join("config.toml").display()
        ),
        names => bail!("Several servers configured ({}); pick one with --server", names.join(", ")),
    }
}

async fn connect(server: ServerConfig, watching: bool) -> Result<McpClient> {
    let transport = server
        .transport
        .build()
        .with_context(|| format!("Invalid transport for server '{}'", server.name))?;

    let mut builder = McpClient::builder(transport)
        .config(server.client)
        .notification_handler(notify::CliNotifications {
            server: server.name.clone(),
            echo: watching,
        });
    if !server.roots.is_empty() {
        builder = builder.roots(server.roots);
    }
    let client = builder.build();

    client
        .connect_and_wait()
        .await
        .with_context(|| format!("Failed to connect to '{}'", server.name))?;
    if let Some(info) = client.server_info() {
        tracing::info!(
            "Connected to {} {} (protocol {})",
            info.server_info.name,
            info.server_info.version,
            info.protocol_version
        );
    }
    Ok(client)
}

async fn run(client: &McpClient, command: Command, reconnects: bool) -> Result<()> {
    match command {
        Command::Servers => Ok(()),
        Command::Tools => print_json(&client.list_all_tools().await?),
        Command::Call { tool, args } => {
            let arguments = args
                .as_deref()
                .map(parse_json_object)
                .transpose()
                .context("--args must be a JSON object")?;
            let result = client
                .call_tool(&tool, arguments)
                .await
                .with_context(|| format!("Tool '{tool}' failed"))?;
            print_json(&result)
        }
        Command::Resources { cursor, templates } => {
            if templates {
                print_json(&client.list_resource_templates(cursor).await?)
            } else {
                print_json(&client.list_resources(cursor).await?)
            }
        }
        Command::Read { uri } => print_json(&client.read_resource(&uri).await?),
        Command::Prompts { cursor } => print_json(&client.list_prompts(cursor).await?),
        Command::Prompt { name, args } => {
            let arguments = args
                .as_deref()
                .map(serde_json::from_str::<HashMap<String, String>>)
                .transpose()
                .context("--args must be a JSON object of strings")?;
            print_json(&client.get_prompt(&name, arguments).await?)
        }
        Command::Ping => {
            let started = std::time::Instant::now();
            client.ping().await?;
            print_json(&serde_json::json!({ "ok": true, "ms": started.elapsed().as_millis() as u64 }))
        }
        Command::Watch {
            subscribe,
            log_level,
            ..
        } => watch(client, subscribe, log_level, reconnects).await,
    }
}

/// Print every state transition until Ctrl+C or a failure the session
/// will not recover from.
async fn watch(
    client: &McpClient,
    subscribe: Vec<String>,
    log_level: Option<LoggingLevel>,
    reconnects: bool,
) -> Result<()> {
    let mut transitions = client.transitions();
    print_state(&client.state());

    if let Some(level) = log_level {
        client
            .set_logging_level(level)
            .await
            .context("Failed to set logging level")?;
    }
    for uri in &subscribe {
        client
            .subscribe_resource(uri)
            .await
            .with_context(|| format!("Failed to subscribe to {uri}"))?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted");
                return Ok(());
            }
            transition = transitions.recv() => match transition {
                Ok(state) => {
                    print_state(&state);
                    if let ConnectionState::Disconnected(Some(err)) = &state {
                        if !reconnects || matches!(err, McpError::MaxReconnectAttemptsReached(_)) {
                            bail!("Connection lost: {err}");
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {n} state transitions");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn print_state(state: &ConnectionState) {
    println!(
        "{}",
        serde_json::json!({"event": "state", "state": state.to_string()})
    );
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{text}");
    Ok(())
}

fn parse_json_object(text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {other}"),
    }
}

fn parse_logging_level(text: &str) -> Result<LoggingLevel, String> {
    serde_json::from_value(Value::String(text.to_ascii_lowercase()))
        .map_err(|_| format!("unknown logging level '{text}'"))
}
