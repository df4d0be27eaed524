//! RPC table & state machine.
//!
//! Each RPC is an `Arc<Mutex<Rpc>>` reachable from exactly one of a socket's
//! two tables (client-role, keyed by id; server-role, keyed by `(peer,
//! id)`). The `Mutex` *is* the bucket lock of the table's lock hierarchy: no
//! field of an `Rpc` may be read or written without holding it, and it is
//! never held across a blocking syscall or while taking the grant lock.
//! `DashMap` provides the sharding — each internal shard is a bucket with
//! its own lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Error;
use crate::id::{is_client_id, IdAllocator};
use crate::interest::Interest;
use crate::message::Reassembly;
use crate::outgoing::OutgoingMessage;
use crate::peer::{Peer, PeerKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    Outgoing,
    Incoming,
    /// Server-only: between completing the request read and sending the response.
    InService,
    Dead,
}

pub struct Rpc {
    pub id: u64,
    pub peer: Arc<Peer>,
    /// Port on `peer` this RPC's other end is bound to, so the timer and
    /// grant scheduler can address unprompted packets (RESEND, NEED_ACK,
    /// GRANT) without waiting for another inbound datagram to learn it from.
    pub remote_port: u16,
    pub is_client: bool,
    pub state: RpcState,
    pub error: Option<Error>,
    pub completion_cookie: u64,
    pub private: bool,
    pub incoming: Option<Reassembly>,
    pub outgoing: Option<OutgoingMessage>,
    /// Bpage indices backing `incoming`, owned by the pool until `recv`
    /// hands them to the application.
    pub bpages: Vec<usize>,
    /// Bytes the grant scheduler has authorized the peer to send for our
    /// incoming message; monotonic non-decreasing.
    pub granted: u32,
    pub scheduled_priority: u8,
    pub created_ns: u64,
    pub last_progress_ns: u64,
    pub ticks_since_progress: u32,
    pub resends_sent: u32,
    /// Set once the application has consumed the terminal message and the
    /// peer has acked it; `end()` is idempotent so this just short-circuits
    /// repeats.
    pub reaped: bool,
    /// Set when `sendmsg`'s `PRIVATE` flag requires this RPC's completion to
    /// be delivered only to a `recv` naming this exact id.
    pub private_interest: Option<Arc<Interest>>,
}

impl Rpc {
    fn new(id: u64, peer: Arc<Peer>, remote_port: u16, is_client: bool, now_ns: u64) -> Self {
        Self {
            id,
            peer,
            remote_port,
            is_client,
            state: if is_client { RpcState::Outgoing } else { RpcState::Incoming },
            error: None,
            completion_cookie: 0,
            private: false,
            incoming: None,
            outgoing: None,
            bpages: Vec::new(),
            granted: 0,
            scheduled_priority: 0,
            created_ns: now_ns,
            last_progress_ns: now_ns,
            ticks_since_progress: 0,
            resends_sent: 0,
            reaped: false,
            private_interest: None,
        }
    }

    /// Moves the RPC to `Dead`. Idempotent.
    pub fn end(&mut self) {
        self.state = RpcState::Dead;
    }

    /// Records the error and ends the RPC. Client RPCs keep the error
    /// visible for a future `recv`; server RPCs
    /// are ended without anything further to notify.
    pub fn abort(&mut self, err: Error) {
        self.error = Some(err);
        self.end();
    }

    pub fn is_dead(&self) -> bool {
        self.state == RpcState::Dead
    }
}

/// Key for the server-role table: a server-side id is only unique per peer,
/// since a client allocates its own ids independently of other clients.
pub type ServerKey = (PeerKey, u64);

pub type RpcHandle = Arc<Mutex<Rpc>>;

/// Per-socket dead-RPC queue, drained by the timer's reaper.
struct DeadEntry {
    is_client: bool,
    id: u64,
    server_key: Option<ServerKey>,
}

pub struct RpcTable {
    client: DashMap<u64, RpcHandle>,
    server: DashMap<ServerKey, RpcHandle>,
    /// Reverse index from a server-role id to the peer half of its real key,
    /// so `send(id, ...)`'s response path can look an RPC up from the id
    /// alone, the way an application only ever has an id to hand back.
    server_by_id: DashMap<u64, PeerKey>,
    dead: Mutex<VecDeque<DeadEntry>>,
    ids: IdAllocator,
}

impl RpcTable {
    pub fn new(buckets: usize) -> Self {
        let shards = buckets.next_power_of_two().max(1);
        Self {
            client: DashMap::with_shard_amount(shards),
            server: DashMap::with_shard_amount(shards),
            server_by_id: DashMap::with_shard_amount(shards),
            dead: Mutex::new(VecDeque::new()),
            ids: IdAllocator::new(),
        }
    }

    /// Atomically reserves a new client id and inserts the RPC.
    pub fn alloc_client(&self, peer: Arc<Peer>, remote_port: u16, now_ns: u64) -> RpcHandle {
        let id = self.ids.alloc();
        let rpc = Arc::new(Mutex::new(Rpc::new(id, peer, remote_port, true, now_ns)));
        self.client.insert(id, rpc.clone());
        rpc
    }

    pub fn find_client(&self, id: u64) -> Option<RpcHandle> {
        self.client.get(&id).map(|e| e.clone())
    }

    /// Inserts on first DATA for an unknown server-side id. Returns
    /// `(handle, newly_created)`.
    pub fn find_or_create_server(
        &self,
        peer: Arc<Peer>,
        remote_port: u16,
        id: u64,
        now_ns: u64,
    ) -> (RpcHandle, bool) {
        debug_assert!(!is_client_id(id), "server table keyed by server-role ids only");
        let key = (peer.key, id);
        if let Some(existing) = self.server.get(&key) {
            return (existing.clone(), false);
        }
        let rpc = Arc::new(Mutex::new(Rpc::new(id, peer, remote_port, false, now_ns)));
        match self.server.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(rpc.clone());
                self.server_by_id.insert(id, key.0);
                (rpc, true)
            }
        }
    }

    pub fn find_server(&self, peer_key: PeerKey, id: u64) -> Option<RpcHandle> {
        self.server.get(&(peer_key, id)).map(|e| e.clone())
    }

    /// Look up a server-role RPC by id alone, for `send(id, ...)`'s response
    /// path: the application only ever hands back the id `recv` gave it, not
    /// the peer.
    pub fn find_server_by_id(&self, id: u64) -> Option<RpcHandle> {
        let peer_key = *self.server_by_id.get(&id)?;
        self.find_server(peer_key, id)
    }

    /// Schedule a dead RPC for reaping. Idempotent: calling this twice for
    /// the same id just queues it twice, which the reaper tolerates by
    /// ignoring entries it can no longer find.
    pub fn schedule_reap(&self, is_client: bool, id: u64, server_key: Option<ServerKey>) {
        self.dead.lock().unwrap().push_back(DeadEntry { is_client, id, server_key });
    }

    /// Opportunistically reaps dead RPCs up to `limit` bpages. Returns the
    /// bpages freed so the caller can release them to the buffer pool.
    pub fn reap(&self, limit: usize) -> Vec<usize> {
        let mut freed = Vec::new();
        let mut dead = self.dead.lock().unwrap();
        let mut processed = 0;
        while processed < limit {
            let Some(entry) = dead.pop_front() else { break };
            processed += 1;
            let removed = if entry.is_client {
                self.client.remove(&entry.id).map(|(_, h)| h)
            } else {
                self.server_by_id.remove(&entry.id);
                entry.server_key.and_then(|k| self.server.remove(&k)).map(|(_, h)| h)
            };
            if let Some(handle) = removed {
                let rpc = handle.lock().unwrap();
                freed.extend_from_slice(&rpc.bpages);
            }
        }
        freed
    }

    pub fn dead_count(&self) -> usize {
        self.dead.lock().unwrap().len()
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.client.iter().map(|e| *e.key()).collect()
    }

    pub fn server_keys(&self) -> Vec<ServerKey> {
        self.server.iter().map(|e| *e.key()).collect()
    }

    /// Every RPC this table currently tracks, client- and server-role alike.
    /// Used by the grant scheduler's periodic sweep, which needs to see
    /// every live incoming message regardless of which side of the RPC it's
    /// on.
    pub fn all_handles(&self) -> Vec<RpcHandle> {
        self.client
            .iter()
            .map(|e| e.value().clone())
            .chain(self.server.iter().map(|e| e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomaConfig;
    use crate::peer::PeerTable;

    fn make_peer() -> Arc<Peer> {
        let table = PeerTable::new(&HomaConfig::default());
        table.find_or_create(0, "10.0.0.1".parse().unwrap(), 0)
    }

    #[test]
    fn alloc_client_ids_are_even_and_findable() {
        let table = RpcTable::new(8);
        let peer = make_peer();
        let rpc = table.alloc_client(peer, 200, 0);
        let id = rpc.lock().unwrap().id;
        assert!(is_client_id(id));
        assert!(table.find_client(id).is_some());
    }

    #[test]
    fn find_or_create_server_is_idempotent() {
        let table = RpcTable::new(8);
        let peer = make_peer();
        let (a, created_a) = table.find_or_create_server(peer.clone(), 200, 3, 0);
        let (b, created_b) = table.find_or_create_server(peer, 200, 3, 0);
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn server_rpc_is_findable_by_id_alone() {
        let table = RpcTable::new(8);
        let peer = make_peer();
        let (handle, _) = table.find_or_create_server(peer, 200, 5, 0);
        let by_id = table.find_server_by_id(5).unwrap();
        assert!(Arc::ptr_eq(&handle, &by_id));
        assert!(table.find_server_by_id(7).is_none());
    }

    #[test]
    fn end_is_idempotent_and_reap_frees_bpages() {
        let table = RpcTable::new(8);
        let peer = make_peer();
        let rpc = table.alloc_client(peer, 200, 0);
        let id;
        {
            let mut r = rpc.lock().unwrap();
            id = r.id;
            r.bpages = vec![1, 2, 3];
            r.end();
            r.end(); // idempotent
        }
        table.schedule_reap(true, id, None);
        let freed = table.reap(10);
        assert_eq!(freed, vec![1, 2, 3]);
        assert!(table.find_client(id).is_none());
    }
}
