use clap::Parser;
use haze_server::{ChannelHandler, Server, ServerConfig, ServerEvent, CLOSED_REASON};
use log::{error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

/// Command line arguments for the server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Name advertised to clients
    #[clap(short, long, default_value = "Haze Server")]
    name: String,
    /// Maximum number of connected clients
    #[clap(short, long, default_value = "32")]
    max_clients: usize,
    /// Milliseconds a new connection has to authenticate
    #[clap(long, default_value = "10000")]
    validation_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let config = ServerConfig::default()
        .with_bind_addr(format!("{}:{}", args.host, args.port))
        .with_name(args.name)
        .with_max_clients(args.max_clients)
        .with_validation_timeout(Duration::from_millis(args.validation_timeout_ms));

    let (handler, events) = ChannelHandler::new();
    let server = Server::bind(config, handler).await?;
    let (handle, server_task) = server.spawn();

    tokio::spawn(log_events(events));

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            if let Err(e) = handle.shutdown(CLOSED_REASON).await {
                warn!("Shutdown failed: {}", e);
            }
        }
    }

    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Connected(member) => {
                info!("{} joined at index {}", member.name, member.index)
            }
            ServerEvent::Invalidated { id, reason } => info!("{} invalidated: {}", id, reason),
            ServerEvent::Disconnected(departure) => info!(
                "{} left after {}ms: {}",
                departure.member.name, departure.connected_for_ms, departure.reason
            ),
            ServerEvent::NameChanged { member, old_name } => {
                info!("{} is now known as {}", old_name, member.name)
            }
            ServerEvent::Data { sender, packet } => {
                info!("{} sent {}", sender.name, packet.describe())
            }
            ServerEvent::OperationFailed { reporter, failure } => warn!(
                "{} could not handle {}: {:?}",
                reporter.name,
                failure.cause.describe(),
                failure.error
            ),
        }
    }
}
