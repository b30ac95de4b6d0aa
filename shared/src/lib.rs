//! # Haze Shared Library
//!
//! Protocol types and connection plumbing used by both the server and the
//! client.
//!
//! ## Components
//! - **Packets**: the [`Packet`] envelope and every message kind
//! - **Codec**: length-delimited bincode frames with an authenticity marker
//! - **Connection**: a TCP endpoint with an ordered outbound queue and
//!   one-shot teardown
//! - **Identity**: random 32 character endpoint IDs, unique per process
//! - **Snapshots**: the roster view the server hands to its clients
//!
//! ## Protocol Flow
//! 1. Client opens a TCP connection and sends `Authentication`
//! 2. Server answers with `Welcome` and tells everyone else via `RosterUpdate`
//! 3. Clients exchange data with the server, or with each other through
//!    `PeerRelay`
//! 4. Either side ends the session with `Disconnect` or by dropping the stream

pub mod codec;
pub mod connection;
pub mod error;
pub mod id;
pub mod packet;
pub mod snapshot;
pub mod utils;

pub use codec::{HazeCodec, Inbound, MAX_FRAME_LENGTH};
pub use connection::{Connection, FrameReader, Outbox, ReadEvent};
pub use error::{CodecError, ConnectionError, HandlerError};
pub use id::{EndpointId, IdLease, IdPool, ID_LENGTH};
pub use packet::{Failure, FailureInfo, FailureKind, Packet, PacketBody, PacketKind};
pub use snapshot::{Departure, MemberSnapshot, RosterUpdate, ServerSnapshot};
