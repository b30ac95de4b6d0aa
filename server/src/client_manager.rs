//! Roster and admission bookkeeping for the server
//!
//! This module owns every connection the server knows about, in two stages:
//! - The admission queue of accepted connections that have not authenticated yet
//! - The ordered roster of validated members, each at a dense zero-based index
//!
//! The roster is kept as an ordered list plus an ID-to-position map, and every
//! member also stores its own index. All three move together inside a single
//! `&mut self` call, so nobody can observe a stale or duplicate index. The
//! manager is owned by the server actor and never shared across tasks.

use haze_shared::{EndpointId, MemberSnapshot, ServerSnapshot};
use log::{debug, info};
use std::collections::{HashMap, VecDeque};

use crate::client::ServerClient;

/// Outcome of promoting a queued connection into the roster
#[derive(Debug)]
pub enum Validation {
    /// Now a member at this index
    Admitted(usize),
    /// The roster has no room left; the connection was taken off the queue
    Full(ServerClient),
    /// Not in the queue (already validated, or never accepted)
    Unknown,
}

/// Manages queued and validated clients
///
/// Capacity applies to queue and roster combined at accept time: a new
/// connection is only taken off the listener while `len + queue_len` is
/// below `max_clients`.
#[derive(Debug)]
pub struct ClientManager {
    /// Accepted connections waiting to authenticate, oldest first
    queue: VecDeque<ServerClient>,
    /// Validated members ordered by roster index
    roster: Vec<ServerClient>,
    /// Roster position of every validated member
    positions: HashMap<EndpointId, usize>,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            roster: Vec::new(),
            positions: HashMap::new(),
            max_clients,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Returns the number of validated members
    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether another connection may be accepted from the listener
    pub fn has_capacity(&self) -> bool {
        self.roster.len() + self.queue.len() < self.max_clients
    }

    /// Puts a freshly accepted connection into the admission queue.
    pub fn enqueue(&mut self, client: ServerClient) {
        debug!(
            "Queued connection {} from {} ({} waiting)",
            client.id(),
            client.peer_addr(),
            self.queue.len() + 1
        );
        self.queue.push_back(client);
    }

    pub fn is_pending(&self, id: &EndpointId) -> bool {
        self.queue.iter().any(|c| c.id() == id)
    }

    pub fn is_member(&self, id: &EndpointId) -> bool {
        self.positions.contains_key(id)
    }

    /// Moves a queued connection into the roster at the next free index
    ///
    /// The new member is appended, so its index equals the roster length
    /// before insertion.
    pub fn validate(&mut self, id: &EndpointId, name: String, tag: Option<Vec<u8>>) -> Validation {
        let Some(position) = self.queue.iter().position(|c| c.id() == id) else {
            return Validation::Unknown;
        };
        let Some(mut client) = self.queue.remove(position) else {
            return Validation::Unknown;
        };

        if self.roster.len() >= self.max_clients {
            return Validation::Full(client);
        }

        let index = self.roster.len();
        client.validate(name, tag, index);
        info!(
            "Client {} validated as '{}' at index {}",
            client.id(),
            client.name(),
            index
        );
        self.positions.insert(client.id().clone(), index);
        self.roster.push(client);

        Validation::Admitted(index)
    }

    /// Removes a connection that never authenticated.
    pub fn drop_pending(&mut self, id: &EndpointId) -> Option<ServerClient> {
        let position = self.queue.iter().position(|c| c.id() == id)?;
        self.queue.remove(position)
    }

    /// Removes a validated member and renumbers everyone after it
    ///
    /// The returned client keeps the index it had before removal so the
    /// departure can still be described.
    pub fn remove(&mut self, id: &EndpointId) -> Option<ServerClient> {
        let position = self.positions.remove(id)?;
        let client = self.roster.remove(position);

        for (offset, later) in self.roster[position..].iter_mut().enumerate() {
            let index = position + offset;
            later.set_index(index);
            self.positions.insert(later.id().clone(), index);
        }

        info!(
            "Client {} removed from index {} ({} remaining)",
            client.id(),
            position,
            self.roster.len()
        );
        Some(client)
    }

    pub fn get(&self, id: &EndpointId) -> Option<&ServerClient> {
        self.positions.get(id).and_then(|&i| self.roster.get(i))
    }

    pub fn get_mut(&mut self, id: &EndpointId) -> Option<&mut ServerClient> {
        match self.positions.get(id) {
            Some(&i) => self.roster.get_mut(i),
            None => None,
        }
    }

    pub fn pending(&self, id: &EndpointId) -> Option<&ServerClient> {
        self.queue.iter().find(|c| c.id() == id)
    }

    pub fn by_index(&self, index: usize) -> Option<&ServerClient> {
        self.roster.get(index)
    }

    /// Validated members in roster order
    pub fn members(&self) -> impl Iterator<Item = &ServerClient> {
        self.roster.iter()
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.roster.iter().map(|c| c.id().clone()).collect()
    }

    /// Changes the capacity and returns the members that no longer fit,
    /// highest index first. The caller disconnects them.
    pub fn set_max_clients(&mut self, max_clients: usize) -> Vec<EndpointId> {
        self.max_clients = max_clients;
        self.roster
            .iter()
            .skip(max_clients)
            .rev()
            .map(|c| c.id().clone())
            .collect()
    }

    /// Takes every queued connection, for shutdown.
    pub fn drain_queue(&mut self) -> Vec<ServerClient> {
        self.queue.drain(..).collect()
    }

    pub fn member_snapshots(&self) -> Vec<MemberSnapshot> {
        self.roster.iter().filter_map(|c| c.snapshot()).collect()
    }

    /// Builds the roster view sent to one recipient
    ///
    /// `recipient` is the recipient's own roster index, if it is a member.
    pub fn snapshot(&self, server_id: &EndpointId, name: &str, recipient: Option<usize>) -> ServerSnapshot {
        ServerSnapshot {
            id: server_id.clone(),
            name: name.to_string(),
            capacity: self.max_clients,
            size: self.roster.len(),
            index: recipient,
            members: self.member_snapshots(),
        }
    }

    /// Checks that the ordered roster, the position map and every member's
    /// stored index agree.
    pub fn check_consistency(&self) -> bool {
        self.positions.len() == self.roster.len()
            && self.roster.iter().enumerate().all(|(i, c)| {
                c.index() == Some(i) && self.positions.get(c.id()) == Some(&i)
            })
    }
}
