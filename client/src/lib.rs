//! # Haze Client Library
//!
//! The client side of the Haze messaging framework. A client opens one TCP
//! connection, authenticates with a name and an optional tag, and after the
//! server's welcome can talk to the server or, through the server's relay,
//! to any other member.
//!
//! ## Identity
//!
//! Every client starts with a provisional ID from the process-wide pool. The
//! server assigns the real one in its welcome, and from then on
//! [`Client::id`] returns the assigned ID. The provisional lease stays
//! reserved for the client's lifetime.
//!
//! ## Connection Lifecycle
//!
//! [`Client::connect`] only returns once the welcome has arrived. A goodbye
//! before that turns into [`ConnectionError::Rejected`], and silence turns
//! into [`ConnectionError::Timeout`]. The read loop runs on its own task and
//! reports the end of the connection to the handler exactly once, whether
//! the server said goodbye, the socket failed or [`Client::disconnect`] was
//! called.
//!
//! [`ConnectionError::Rejected`]: haze_shared::ConnectionError::Rejected
//! [`ConnectionError::Timeout`]: haze_shared::ConnectionError::Timeout
//!
//! ## Module Organization
//!
//! - `network`: the [`Client`] handle and its read loop
//! - `handler`: application hooks
//! - `ping`: round trip breakdown
//! - `history`: sent and received packet timelines
//! - `resolver`: local and public address lookup
//! - `config`: client settings
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use haze_client::{ChannelHandler, Client, ClientConfig, ClientEvent};
//! use haze_shared::Packet;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (handler, mut events) = ChannelHandler::new();
//!     let client = Client::connect(ClientConfig::new("127.0.0.1:8080", "alice"), handler).await?;
//!
//!     client.send(Packet::text("hello"))?;
//!     println!("{:?}", client.ping().await?);
//!
//!     while let Some(event) = events.recv().await {
//!         if let ClientEvent::Disconnected { reason, .. } = event {
//!             println!("Disconnected: {reason}");
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod handler;
pub mod history;
pub mod network;
pub mod ping;
pub mod resolver;

pub use config::ClientConfig;
pub use handler::{ChannelHandler, ClientEvent, ClientHandler, Origin};
pub use history::Record;
pub use network::Client;
pub use ping::PingReport;
pub use resolver::{AddressResolver, StaticResolver, SystemResolver};
