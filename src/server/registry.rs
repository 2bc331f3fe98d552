//! Connection Registry
//!
//! Bijection between connection ids and live remote endpoints. Ids come
//! from a monotonically increasing counter starting at 1 and are never
//! reused for the lifetime of the listener, restarts included.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::transport::PeerHandle;

pub type ConnectionId = u64;

/// Bookkeeping for one remote peer
#[derive(Debug, Clone)]
pub(crate) struct ConnectionRecord {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub connected_at: Instant,
    pub handle: PeerHandle,
}

/// Read-only view of a registered connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub connected_for: Duration,
}

#[derive(Default)]
struct RegistryTables {
    records: HashMap<ConnectionId, ConnectionRecord>,
    /// Reverse index for datagram peers, which are identified by address
    datagram_ids: HashMap<SocketAddr, ConnectionId>,
}

pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    tables: Mutex<RegistryTables>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tables: Mutex::new(RegistryTables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryTables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an accepted stream peer under a fresh id
    pub fn insert(&self, remote: SocketAddr, handle: PeerHandle) -> ConnectionId {
        let id = self.allocate_id();
        let record = ConnectionRecord {
            id,
            remote,
            connected_at: Instant::now(),
            handle,
        };
        self.lock().records.insert(id, record);
        id
    }

    /// Id for a datagram peer, assigning one on first sight.
    ///
    /// Returns `(id, true)` when the address was newly registered.
    pub fn get_or_assign(&self, remote: SocketAddr, handle: impl FnOnce() -> PeerHandle) -> (ConnectionId, bool) {
        let mut tables = self.lock();

        if let Some(&id) = tables.datagram_ids.get(&remote) {
            return (id, false);
        }

        let id = self.allocate_id();
        tables.datagram_ids.insert(remote, id);
        tables.records.insert(
            id,
            ConnectionRecord {
                id,
                remote,
                connected_at: Instant::now(),
                handle: handle(),
            },
        );
        (id, true)
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// Linear scan; registries are small and address lookups rare
    pub fn find_by_address(&self, remote: SocketAddr) -> Option<ConnectionRecord> {
        self.lock()
            .records
            .values()
            .find(|record| record.remote == remote)
            .cloned()
    }

    /// Remove a record. Only the caller that gets `Some` may emit on_disconnect.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let mut tables = self.lock();
        let record = tables.records.remove(&id)?;
        if tables.datagram_ids.get(&record.remote) == Some(&id) {
            tables.datagram_ids.remove(&record.remote);
        }
        Some(record)
    }

    /// Remove every record, ordered by id
    pub fn drain(&self) -> Vec<ConnectionRecord> {
        let mut tables = self.lock();
        tables.datagram_ids.clear();
        let mut records: Vec<_> = tables.records.drain().map(|(_, record)| record).collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .lock()
            .records
            .values()
            .map(|record| ConnectionInfo {
                id: record.id,
                remote: record.remote,
                connected_for: record.connected_at.elapsed(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
