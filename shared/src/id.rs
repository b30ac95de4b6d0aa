//! Endpoint identity.
//!
//! Every participant (server, client, server-side proxy) carries a random
//! 32 character ID. IDs are handed out as [`IdLease`]s by an [`IdPool`]; the
//! pool remembers every live lease so two live endpoints in one process can
//! never share an ID. Dropping a lease returns its ID to the pool.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

pub const ID_LENGTH: usize = 32;

/// Opaque identifier of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out IDs that are unique among all live leases of this pool.
#[derive(Debug, Clone, Default)]
pub struct IdPool {
    live: Arc<Mutex<HashSet<String>>>,
}

impl IdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool used by servers and clients.
    pub fn global() -> &'static IdPool {
        static POOL: OnceLock<IdPool> = OnceLock::new();
        POOL.get_or_init(IdPool::new)
    }

    /// Reserves a fresh random ID until the returned lease is dropped.
    pub fn lease(&self) -> IdLease {
        loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(ID_LENGTH)
                .map(char::from)
                .collect();

            if self.lock().insert(candidate.clone()) {
                return IdLease {
                    id: EndpointId(candidate),
                    pool: self.clone(),
                };
            }
        }
    }

    pub fn is_live(&self, id: &EndpointId) -> bool {
        self.lock().contains(id.as_str())
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A reserved [`EndpointId`]. The ID is released when the lease drops.
#[derive(Debug)]
pub struct IdLease {
    id: EndpointId,
    pool: IdPool,
}

impl IdLease {
    pub fn id(&self) -> &EndpointId {
        &self.id
    }
}

impl Drop for IdLease {
    fn drop(&mut self) {
        self.pool.lock().remove(self.id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_shape() {
        let pool = IdPool::new();
        let lease = pool.lease();

        assert_eq!(lease.id().as_str().len(), ID_LENGTH);
        assert!(lease.id().as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_live_leases_are_distinct() {
        let pool = IdPool::new();
        let leases: Vec<IdLease> = (0..500).map(|_| pool.lease()).collect();

        let distinct: HashSet<&str> = leases.iter().map(|l| l.id().as_str()).collect();
        assert_eq!(distinct.len(), leases.len());
        assert_eq!(pool.live_count(), 500);
    }

    #[test]
    fn test_drop_releases_id() {
        let pool = IdPool::new();
        let lease = pool.lease();
        let id = lease.id().clone();
        assert!(pool.is_live(&id));

        drop(lease);
        assert!(!pool.is_live(&id));
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_pools_are_independent() {
        let a = IdPool::new();
        let b = IdPool::new();
        let lease = a.lease();

        assert!(a.is_live(lease.id()));
        assert!(!b.is_live(lease.id()));
    }
}
