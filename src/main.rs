//! Chat Relay Server
//!
//! Room-scoped WebSocket relay. Clients join a conversation with a
//! `conversationId` query parameter and every message is fanned out to the
//! other members of that room.

mod client;
mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use client::{ClientError, RelayClient};
use config::RelayConfig;
use server::RelayServer;

/// Chat Relay Server
///
/// Room-scoped WebSocket message relay
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Join a room and relay stdin lines to it
    Connect {
        /// Room to join
        conversation_id: String,

        /// Sender id attached to outgoing messages
        #[arg(short, long, default_value = "console")]
        sender_id: String,

        /// Relay URL, without the room parameter
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = RelayConfig::load(&args.config)?;

    match args.command.unwrap_or(Command::Serve {
        port: None,
        bind: None,
    }) {
        Command::Serve { port, bind } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await
        }
        Command::Connect {
            conversation_id,
            sender_id,
            url,
        } => {
            if let Some(url) = url {
                config.client.url = url;
            }
            connect(config, conversation_id, sender_id).await
        }
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!("Chat Relay v{}", env!("CARGO_PKG_VERSION"));

    let server = Arc::new(RelayServer::new(config.server_config()));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn connect(
    config: RelayConfig,
    conversation_id: String,
    sender_id: String,
) -> anyhow::Result<()> {
    let client = Arc::new(RelayClient::new(
        &config.client.url,
        conversation_id,
        config.reconnect_policy(),
    )?);
    info!("Joining {}", client.endpoint());

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let running = Arc::clone(&client);
    let mut run = tokio::spawn(async move { running.run(events_tx).await });

    tokio::spawn(async move {
        while let Some(message) = events_rx.recv().await {
            println!(
                "[{}] {}: {}",
                message.timestamp.format("%H:%M:%S"),
                message.sender_id.as_deref().unwrap_or("anonymous"),
                message.content
            );
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut run => return Ok(result??),
            _ = &mut shutdown => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match client.send(line, sender_id.as_str()).await {
                    Ok(()) => {}
                    Err(ClientError::NotConnected) => warn!("Not connected, message dropped"),
                    Err(e) => warn!("Failed to send message: {}", e),
                },
                None => break,
            },
        }
    }

    client.close();
    run.await??;
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
