//! # Haze Server Library
//!
//! The server side of the Haze messaging framework. It accepts TCP
//! connections, admits them through an authentication queue into an ordered
//! roster, keeps every member informed of roster changes, and relays packets
//! between members without reading them.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Every accepted connection starts in a queue. Its first frame must be an
//! `Authentication` packet; anything else, or silence past the validation
//! timeout, drops the connection without a reason. The listener is only
//! polled while `roster + queue < max_clients`, so excess connection attempts
//! simply wait in the OS backlog.
//!
//! ### Roster Bookkeeping
//! Validated members sit at dense zero-based indices. When a member leaves,
//! everyone after it moves down by one in the same step, and the remaining
//! members receive a full roster snapshot naming who left and why.
//!
//! ### Peer Relay
//! `PeerRelay` packets are forwarded to the addressed member with the sender
//! rewritten to the connection they arrived on. Unknown recipients produce an
//! operation failure back to the sender.
//!
//! ## Architecture Design
//!
//! ### Single Roster Owner
//! A single actor task owns all roster state. Connection readers, validation
//! timers and [`ServerHandle`](network::ServerHandle) commands send messages
//! to it over one channel, so connects and disconnects can never race on
//! index bookkeeping.
//!
//! ### Per-Connection Writers
//! Each connection has its own writer task fed by a queue. Replies, relayed
//! packets, roster updates and farewells from different producers are
//! written one frame at a time.
//!
//! ## Module Organization
//!
//! - `client`: the server-side proxy for one peer
//! - `client_manager`: queue, roster and capacity
//! - `relay`: peer relay routing
//! - `handler`: application hooks
//! - `network`: the actor, the accept loop and the command handle
//! - `config`: server settings
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use haze_server::{ChannelHandler, Server, ServerConfig, ServerEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (handler, mut events) = ChannelHandler::new();
//!     let server = Server::bind(ServerConfig::default(), handler).await?;
//!     let (handle, task) = server.spawn();
//!
//!     while let Some(event) = events.recv().await {
//!         if let ServerEvent::Data { sender, packet } = event {
//!             println!("{} sent {}", sender.name, packet.describe());
//!             handle.broadcast(packet, Some(sender.index))?;
//!         }
//!     }
//!
//!     task.await??;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod client_manager;
pub mod config;
pub mod handler;
pub mod network;
pub mod relay;

pub use client::ServerClient;
pub use client_manager::ClientManager;
pub use config::ServerConfig;
pub use handler::{ChannelHandler, ServerEvent, ServerHandler};
pub use network::{Server, ServerError, ServerHandle, CLOSED_REASON};
