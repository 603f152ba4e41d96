//! RelayNet - Relay cache node and client
//!
//! Serves relay messages from an in-memory store, or sends single relay
//! operations to a running node.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relaynet::config::{self, Config};
use relaynet::network::{self as net, ServerEvent, SocketServer};
use relaynet::protocol::{self, MessageType, RelayMessage, RelayPayload};
use relaynet::relay::{MemoryStore, RelayClient, RelayMessageHandler};

/// RelayNet - Zone-aware relay cache transport
#[derive(Parser)]
#[command(name = "relaynet")]
#[command(version)]
#[command(about = "Serve and send relay cache messages", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay node backed by an in-memory store
    Serve {
        /// Port to listen on (overrides the configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Send one relay operation to a node
    Send {
        #[arg(value_enum)]
        operation: Operation,

        /// Node address, host or host:port
        #[arg(short, long)]
        server: String,

        #[arg(short, long)]
        type_id: i16,

        #[arg(short, long)]
        id: i32,

        /// Object contents for save
        #[arg(short, long)]
        data: Option<String>,

        /// Object lifetime in seconds, -1 for none
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        ttl: i32,

        /// Wait for the node to confirm save or delete
        #[arg(long)]
        confirm: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show node information, or a running node's runtime info
    Info {
        /// Node to query
        #[arg(short, long)]
        server: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Operation {
    Get,
    Save,
    Delete,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, bind } => {
            run_server(config, port, bind).await?;
        }
        Commands::Send {
            operation,
            server,
            type_id,
            id,
            data,
            ttl,
            confirm,
        } => {
            let message = build_message(operation, type_id, id, data, ttl, confirm, config.general.zone)?;
            run_send(config, &server, message).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info { server } => match server {
            Some(server) => print_runtime_info(config, &server).await?,
            None => print_node_info(&config),
        },
    }

    Ok(())
}

/// Run a relay node until Ctrl-C
async fn run_server(mut config: Config, port: Option<u16>, bind: Option<IpAddr>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if bind.is_some() {
        config.server.bind_address = bind;
    }

    let node_id = config.node_id();
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(RelayMessageHandler::new(
        store.clone(),
        config.relay.codec(),
        node_id.clone(),
        config.general.zone,
    ));

    let mut server = SocketServer::new(config.server.clone(), handler);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let bind_addr = server.start().await?;
    tracing::info!(
        "Relay node '{}' ({}) listening on {} in zone {}",
        config.general.name,
        node_id,
        bind_addr,
        config.general.zone
    );

    println!("\n========================================");
    println!("  RelayNet Node Running");
    println!("========================================");
    println!("  Node: {} ({})", config.general.name, node_id);
    println!("  Listening: {}", bind_addr);
    println!("  Zone: {}", config.general.zone);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { addr } => {
                        tracing::info!("Client connected: {}", addr);
                    }
                    ServerEvent::ClientDisconnected { addr, reason } => {
                        tracing::info!("Client disconnected: {} - {}", addr, reason);
                    }
                    ServerEvent::ClientRejected { addr, reason } => {
                        tracing::warn!("Client rejected: {} - {}", addr, reason);
                    }
                    ServerEvent::ReplyChannelRegistered { endpoint, via } => {
                        tracing::info!("Replies for {} now go through {}", endpoint, via);
                    }
                    ServerEvent::ConnectionsPruned { count } => {
                        tracing::info!("Pruned {} dead connections", count);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped with {} objects in store", store.len());

    Ok(())
}

fn build_message(
    operation: Operation,
    type_id: i16,
    id: i32,
    data: Option<String>,
    ttl: i32,
    confirm: bool,
    zone: u16,
) -> anyhow::Result<RelayMessage> {
    let confirmed = |message_type: MessageType| {
        if confirm {
            message_type.with_confirm().unwrap_or(message_type)
        } else {
            message_type
        }
    };

    let mut message = match operation {
        Operation::Get => RelayMessage::new(type_id, id, MessageType::Get),
        Operation::Save => {
            let data = data.ok_or_else(|| anyhow::anyhow!("save needs --data"))?;
            let payload = RelayPayload::new(type_id, id, data.into_bytes(), false, ttl);
            RelayMessage::with_payload(confirmed(MessageType::Save), payload)
        }
        Operation::Delete => RelayMessage::new(type_id, id, confirmed(MessageType::Delete)),
    };
    message.source_zone = zone;
    Ok(message)
}

async fn parse_server(server: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let (host, port) = match server.rsplit_once(':') {
        Some((host, port)) => (host, port.parse()?),
        None => (server, protocol::DEFAULT_PORT),
    };
    Ok(net::resolve_host(host, port).await?)
}

async fn connect(config: &Config, server: &str) -> anyhow::Result<RelayClient> {
    let addr = parse_server(server).await?;
    tracing::debug!("Connecting to {}", addr);
    Ok(RelayClient::connect(addr, config.client.clone(), &config.relay).await?)
}

/// Send one message and print what came back
async fn run_send(config: Config, server: &str, mut message: RelayMessage) -> anyhow::Result<()> {
    let client = connect(&config, server).await?;
    client.send(&mut message).await?;

    match message.result_outcome {
        Some(outcome) => println!("Outcome: {}", outcome),
        None => println!("Sent (no reply expected)"),
    }
    if let Some(details) = &message.result_details {
        println!("Details: {}", details);
    }
    if message.message_type == MessageType::Get {
        if let Some(bytes) = message.payload.as_ref().and_then(|p| p.byte_array.as_ref()) {
            println!("Payload ({} bytes): {}", bytes.len(), String::from_utf8_lossy(bytes));
        }
    }

    client.close().await;
    Ok(())
}

async fn print_runtime_info(config: Config, server: &str) -> anyhow::Result<()> {
    let client = connect(&config, server).await?;
    let info = client.get_runtime_info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    client.close().await;
    Ok(())
}

/// Print node information
fn print_node_info(config: &Config) {
    println!("RelayNet Node Information");
    println!("=========================\n");

    println!("Name: {}", config.general.name);
    println!("Node ID: {}", config.node_id());
    println!("Zone: {}", config.general.zone);
    println!("Port: {}", config.server.port);
    println!(
        "Byte order: {}",
        if config.server.use_network_order { "network" } else { "little-endian" }
    );

    println!("\nMessage Version: {}", protocol::CURRENT_MESSAGE_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["relaynet", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "relaynet", "send", "save", "--server", "127.0.0.1:9000", "--type-id", "7", "--id",
            "42", "--data", "abc", "--ttl", "60", "--confirm",
        ])
        .unwrap();
        match cli.command {
            Commands::Send { operation, type_id, id, ttl, confirm, .. } => {
                assert_eq!(operation, Operation::Save);
                assert_eq!((type_id, id, ttl), (7, 42, 60));
                assert!(confirm);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_build_message() {
        let message = build_message(Operation::Delete, 1, 2, None, -1, true, 3).unwrap();
        assert_eq!(message.message_type, MessageType::DeleteWithConfirm);
        assert_eq!(message.source_zone, 3);

        let message = build_message(Operation::Save, 7, 42, Some("abc".into()), 60, false, 0).unwrap();
        assert_eq!(message.message_type, MessageType::Save);
        assert_eq!(message.payload.unwrap().byte_array.as_deref(), Some(&b"abc"[..]));

        assert!(build_message(Operation::Save, 1, 1, None, -1, false, 0).is_err());
    }
}
