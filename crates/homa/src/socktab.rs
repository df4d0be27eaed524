//! Socket table.
//!
//! Port → socket mapping, one table per network namespace, looked up by
//! `(namespace, port)`. Generic over the socket type so this module has no
//! dependency on `socket.rs`'s internals — it is pure bucketed storage plus
//! default-port allocation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::MIN_DEFAULT_PORT;
use crate::error::{Error, Result};

pub struct SocketTable<T> {
    sockets: DashMap<(u32, u16), Arc<T>>,
    rolling: DashMap<u32, AtomicU32>,
}

impl<T> SocketTable<T> {
    pub fn new(buckets: usize) -> Self {
        Self {
            sockets: DashMap::with_shard_amount(buckets.next_power_of_two().max(1)),
            rolling: DashMap::new(),
        }
    }

    pub fn find(&self, namespace: u32, port: u16) -> Option<Arc<T>> {
        self.sockets.get(&(namespace, port)).map(|e| e.clone())
    }

    /// Insert at an explicit port, failing with `EADDRINUSE` if taken.
    pub fn insert(&self, namespace: u32, port: u16, socket: Arc<T>) -> Result<()> {
        match self.sockets.entry((namespace, port)) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AddrInUse(port)),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(socket);
                Ok(())
            }
        }
    }

    pub fn remove(&self, namespace: u32, port: u16) {
        self.sockets.remove(&(namespace, port));
    }

    /// Walks a per-namespace rolling counter starting at `MIN_DEFAULT_PORT`,
    /// skipping in-use ports; fails with `EADDRNOTAVAIL` after a full sweep.
    pub fn alloc_default_port(&self, namespace: u32, socket: Arc<T>) -> Result<u16> {
        let counter = self
            .rolling
            .entry(namespace)
            .or_insert_with(|| AtomicU32::new(MIN_DEFAULT_PORT as u32));
        let span = (u16::MAX as u32) - (MIN_DEFAULT_PORT as u32) + 1;
        for _ in 0..span {
            let candidate = counter.fetch_add(1, Ordering::Relaxed);
            let port = (MIN_DEFAULT_PORT as u32 + (candidate - MIN_DEFAULT_PORT as u32) % span) as u16;
            if self.insert(namespace, port, socket.clone()).is_ok() {
                return Ok(port);
            }
        }
        Err(Error::AddrNotAvailable)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// All sockets currently bound in this table, for a background sweep
    /// (the timer and pacer threads) that must visit every open socket.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.sockets.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_above_floor_and_unique() {
        let table: SocketTable<u32> = SocketTable::new(16);
        let a = table.alloc_default_port(0, Arc::new(1)).unwrap();
        let b = table.alloc_default_port(0, Arc::new(2)).unwrap();
        assert!(a >= MIN_DEFAULT_PORT);
        assert!(b >= MIN_DEFAULT_PORT);
        assert_ne!(a, b);
    }

    #[test]
    fn explicit_bind_conflict_is_addr_in_use() {
        let table: SocketTable<u32> = SocketTable::new(16);
        table.insert(0, 100, Arc::new(1)).unwrap();
        let err = table.insert(0, 100, Arc::new(2)).unwrap_err();
        assert!(matches!(err, Error::AddrInUse(100)));
        // The first socket's binding is untouched by the failed second bind.
        assert!(table.find(0, 100).is_some());
    }

    #[test]
    fn namespaces_are_independent() {
        let table: SocketTable<u32> = SocketTable::new(16);
        table.insert(0, 100, Arc::new(1)).unwrap();
        table.insert(1, 100, Arc::new(2)).unwrap();
        assert!(table.find(0, 100).is_some());
        assert!(table.find(1, 100).is_some());
    }

    #[test]
    fn snapshot_lists_every_bound_socket() {
        let table: SocketTable<u32> = SocketTable::new(16);
        table.insert(0, 100, Arc::new(1)).unwrap();
        table.insert(0, 101, Arc::new(2)).unwrap();
        assert_eq!(table.snapshot().len(), 2);
    }
}
