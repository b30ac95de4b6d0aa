use clap::Parser;
use haze_client::{ChannelHandler, Client, ClientConfig, ClientEvent, Origin};
use haze_shared::{EndpointId, Packet, PacketBody};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name to join with
    #[arg(short = 'n', long, default_value = "anonymous")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let (handler, events) = ChannelHandler::new();
    let client = Client::connect(ClientConfig::new(args.server, args.name), handler).await?;
    tokio::spawn(print_events(events));

    match client.ping().await {
        Ok(report) => info!(
            "Round trip {:?} ({:?} up, {:?} server, {:?} down)",
            report.round_trip, report.upload, report.server_processing, report.download
        ),
        Err(e) => warn!("Ping failed: {}", e),
    }
    println!("Commands: /ping, /name <name>, /roster, /to <id> <text>, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !client.is_connected() {
            break;
        }
        let line = line.trim();
        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/ping", _) => match client.ping().await {
                Ok(report) => {
                    println!("{:?}", report);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ("/name", name) if !name.is_empty() => client.set_name(name),
            ("/roster", _) => {
                if let Some(server) = client.server() {
                    for member in &server.members {
                        println!("[{}] {} {}", member.index, member.name, member.id);
                    }
                }
                Ok(())
            }
            ("/to", rest) => match rest.split_once(' ') {
                Some((id, text)) => {
                    client.send_to_peer(&EndpointId::from_string(id), Packet::text(text))
                }
                None => {
                    println!("Usage: /to <id> <text>");
                    Ok(())
                }
            },
            _ if line.is_empty() => Ok(()),
            _ => client.send(Packet::text(line)),
        };
        if let Err(e) = result {
            warn!("{}", e);
        }
    }

    client.disconnect("client quit");
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connected(server) => {
                println!("Joined '{}' ({}/{})", server.name, server.size, server.capacity)
            }
            ClientEvent::RosterUpdated(update) => {
                if let Some(member) = update.joined {
                    println!("{} joined", member.name);
                }
                if let Some(departure) = update.departed {
                    println!("{} left: {}", departure.member.name, departure.reason);
                }
            }
            ClientEvent::Data { origin, packet } => {
                let from = match origin {
                    Origin::Server => "server".to_string(),
                    Origin::Peer(id) => id.to_string(),
                };
                match packet.body() {
                    PacketBody::Text { text } => println!("<{}> {}", from, text),
                    _ => println!("<{}> {}", from, packet.describe()),
                }
            }
            ClientEvent::OperationFailed(failure) => {
                println!("Failed: {} {:?}", failure.cause.describe(), failure.error)
            }
            ClientEvent::Disconnected { reason, .. } => {
                println!("Disconnected: {}", reason);
                break;
            }
        }
    }
}
