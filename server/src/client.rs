use std::net::SocketAddr;
use std::time::{Duration, Instant};

use haze_shared::utils::duration_ms;
use haze_shared::{Connection, ConnectionError, EndpointId, IdLease, MemberSnapshot, Packet};

/// Server-side proxy for one connected peer
#[derive(Debug)]
pub struct ServerClient {
    lease: IdLease,
    connection: Connection,
    name: String,
    tag: Option<Vec<u8>>,
    index: Option<usize>,
    validated_at: Option<Instant>,
    history: Vec<Packet>,
}

impl ServerClient {
    pub fn new(lease: IdLease, connection: Connection) -> Self {
        Self {
            lease,
            connection,
            name: String::new(),
            tag: None,
            index: None,
            validated_at: None,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &EndpointId {
        self.lease.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&[u8]> {
        self.tag.as_deref()
    }

    /// Current roster position; `None` while the client is still queued
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_valid(&self) -> bool {
        self.validated_at.is_some()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Time since the TCP connection was accepted
    pub fn connected_for(&self) -> Duration {
        self.connection.connected_for()
    }

    pub(crate) fn validate(&mut self, name: String, tag: Option<Vec<u8>>, index: usize) {
        self.name = name;
        self.tag = tag;
        self.index = Some(index);
        self.validated_at = Some(Instant::now());
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = Some(index);
    }

    /// Renames the client, returning the previous name.
    pub fn set_name(&mut self, name: impl Into<String>) -> String {
        std::mem::replace(&mut self.name, name.into())
    }

    /// Appends a packet received from this peer to its timeline.
    pub fn record(&mut self, packet: Packet) {
        self.history.push(packet);
    }

    pub fn history(&self) -> &[Packet] {
        &self.history
    }

    pub fn snapshot(&self) -> Option<MemberSnapshot> {
        self.index.map(|index| MemberSnapshot {
            id: self.id().clone(),
            name: self.name.clone(),
            index,
            tag: self.tag.clone(),
            connected_for_ms: duration_ms(self.connected_for()),
        })
    }

    pub fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.connection.send(packet)
    }

    pub fn close(&self, farewell: Option<String>) -> bool {
        self.connection.close(farewell)
    }
}
