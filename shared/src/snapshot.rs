//! Read-only roster snapshots sent from the server to its clients.
//!
//! Snapshots are rebuilt in full on every change; clients replace their copy
//! wholesale instead of applying diffs.

use serde::{Deserialize, Serialize};

use crate::id::EndpointId;

/// One validated roster member as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub id: EndpointId,
    pub name: String,
    /// Position in the server's ordered roster at the time of the snapshot
    pub index: usize,
    /// Opaque value the member presented when authenticating
    pub tag: Option<Vec<u8>>,
    pub connected_for_ms: u64,
}

/// The state of a server from the point of view of one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub id: EndpointId,
    pub name: String,
    pub capacity: usize,
    pub size: usize,
    /// The recipient's own roster index, if the recipient is a member
    pub index: Option<usize>,
    pub members: Vec<MemberSnapshot>,
}

impl ServerSnapshot {
    pub fn member(&self, id: &EndpointId) -> Option<&MemberSnapshot> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn member_at(&self, index: usize) -> Option<&MemberSnapshot> {
        self.members.get(index)
    }

    /// The recipient's own entry.
    pub fn own_entry(&self) -> Option<&MemberSnapshot> {
        self.index.and_then(|i| self.member_at(i))
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }
}

/// A member leaving the roster, with the reason it left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Departure {
    pub member: MemberSnapshot,
    pub reason: String,
    pub connected_for_ms: u64,
}

/// Roster broadcast: a full snapshot plus an optional change annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterUpdate {
    pub server: ServerSnapshot,
    pub joined: Option<MemberSnapshot>,
    pub departed: Option<Departure>,
}
