//! Peer table.
//!
//! Long-lived per-destination state, independent of any individual RPC:
//! cached route info, the peer's current unscheduled-priority cutoffs, and a
//! bounded backlog of RPC ids this host owes an ack for. Keyed by
//! `(namespace, address)` with IPv4 addresses transported as IPv4-mapped
//! IPv6.
//!
//! Lookup uses a concurrent map rather than a lock-guarded `HashMap`;
//! eviction runs on its own thread and `retain`s instead of taking a global
//! write lock per lookup.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::config::HomaConfig;

/// Maximum number of not-yet-piggybacked acks a peer can queue before older
/// entries are dropped. Acks are cheap to regenerate (the client will resend
/// NEED_ACK-triggered state) so bounding this list is safe.
const MAX_PENDING_ACKS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub namespace: u32,
    pub addr: Ipv6Addr,
}

impl PeerKey {
    pub fn new(namespace: u32, addr: IpAddr) -> Self {
        let addr = match addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self { namespace, addr }
    }
}

pub struct Peer {
    pub key: PeerKey,
    /// Version counter for this host's own unscheduled-cutoff table as
    /// advertised to this peer; bumped by `mark_cutoffs_stale` to force a
    /// fresh CUTOFFS packet next time this peer is heard from.
    cutoff_version: AtomicU32,
    cutoffs: Mutex<[u32; 8]>,
    /// Version of `cutoffs` already put on the wire to this peer; a CUTOFFS
    /// packet goes out whenever this falls behind `cutoff_version`.
    sent_cutoff_version: AtomicU32,
    /// The cutoffs this peer has told us to use for unscheduled bytes sent
    /// its way, learned from its own CUTOFFS packets.
    received_cutoffs: Mutex<[u32; 8]>,
    received_cutoff_version: AtomicU32,
    /// (server-role id, remote port) pairs owed an ack, piggybacked on the
    /// next opportunity rather than forcing a dedicated round trip.
    pending_acks: Mutex<VecDeque<(u64, u16)>>,
    last_activity_ns: AtomicU64,
    /// Set by the timer after an RPC to this peer times out; cleared on the
    /// next packet actually received from it.
    suspect: AtomicBool,
}

impl Peer {
    fn new(key: PeerKey, now_ns: u64, local_cutoffs: [u32; 8]) -> Self {
        Self {
            key,
            // Starts one ahead of `sent_cutoff_version` so a brand new peer
            // always gets told this host's cutoffs on first contact.
            cutoff_version: AtomicU32::new(1),
            cutoffs: Mutex::new(local_cutoffs),
            sent_cutoff_version: AtomicU32::new(0),
            received_cutoffs: Mutex::new([0; 8]),
            received_cutoff_version: AtomicU32::new(0),
            pending_acks: Mutex::new(VecDeque::new()),
            last_activity_ns: AtomicU64::new(now_ns),
            suspect: AtomicBool::new(false),
        }
    }

    pub fn touch(&self, now_ns: u64) {
        self.last_activity_ns.store(now_ns, Ordering::Relaxed);
        self.suspect.store(false, Ordering::Relaxed);
    }

    pub fn mark_suspect(&self) {
        self.suspect.store(true, Ordering::Relaxed);
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::Relaxed)
    }

    pub fn idle_secs(&self, now_ns: u64) -> u64 {
        let last = self.last_activity_ns.load(Ordering::Relaxed);
        now_ns.saturating_sub(last) / 1_000_000_000
    }

    pub fn cutoff_version(&self) -> u32 {
        self.cutoff_version.load(Ordering::Acquire)
    }

    pub fn mark_cutoffs_stale(&self) {
        self.cutoff_version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn cutoffs(&self) -> [u32; 8] {
        *self.cutoffs.lock().unwrap()
    }

    /// If this peer hasn't been told the current cutoff version yet,
    /// returns `(version, cutoffs)` to send and marks it sent. `None` if
    /// the peer is already current.
    pub fn take_cutoffs_to_send(&self) -> Option<(u32, [u32; 8])> {
        let version = self.cutoff_version.load(Ordering::Acquire);
        let sent = self.sent_cutoff_version.swap(version, Ordering::AcqRel);
        if sent == version {
            return None;
        }
        Some((version, *self.cutoffs.lock().unwrap()))
    }

    /// Apply a CUTOFFS packet received from this peer: the unscheduled
    /// priority thresholds it wants this host to use when sending its way.
    pub fn apply_received_cutoffs(&self, version: u32, cutoffs: [u32; 8]) {
        *self.received_cutoffs.lock().unwrap() = cutoffs;
        self.received_cutoff_version.store(version, Ordering::Release);
    }

    pub fn received_cutoffs(&self) -> [u32; 8] {
        *self.received_cutoffs.lock().unwrap()
    }

    /// Append an RPC id to piggyback on the next outgoing packet to this
    /// peer. `remote_port` is the RPC's other end, recorded alongside the id
    /// since the ack must be addressed to the same port the RPC lived on.
    pub fn add_ack(&self, id: u64, remote_port: u16) {
        let mut acks = self.pending_acks.lock().unwrap();
        if acks.len() >= MAX_PENDING_ACKS {
            acks.pop_front();
        }
        acks.push_back((id, remote_port));
    }

    /// Drain every queued ack; returns an empty vec if none are pending.
    pub fn take_pending_acks(&self) -> Vec<(u64, u16)> {
        let mut acks = self.pending_acks.lock().unwrap();
        acks.drain(..).collect()
    }
}

pub struct PeerTable {
    peers: DashMap<PeerKey, Arc<Peer>>,
    idle_secs_max: u64,
    gc_threshold: usize,
    /// This host's own unscheduled-priority cutoffs, hand-derived from
    /// `config` once at startup rather than adapted to live traffic, and
    /// handed to every `Peer` it creates.
    local_cutoffs: [u32; 8],
}

impl PeerTable {
    pub fn new(config: &HomaConfig) -> Self {
        Self {
            peers: DashMap::new(),
            idle_secs_max: config.peer_idle_secs_max,
            gc_threshold: config.peer_gc_threshold,
            local_cutoffs: [config.unsched_bytes; 8],
        }
    }

    pub fn find_or_create(&self, namespace: u32, addr: IpAddr, now_ns: u64) -> Arc<Peer> {
        let key = PeerKey::new(namespace, addr);
        if let Some(existing) = self.peers.get(&key) {
            existing.touch(now_ns);
            return existing.clone();
        }
        let peer = Arc::new(Peer::new(key, now_ns, self.local_cutoffs));
        self.peers.entry(key).or_insert_with(|| peer.clone()).touch(now_ns);
        self.peers.get(&key).unwrap().clone()
    }

    pub fn find(&self, namespace: u32, addr: IpAddr) -> Option<Arc<Peer>> {
        self.peers.get(&PeerKey::new(namespace, addr)).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All currently-known peers, for the transport's ack-flush sweep.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Evict peers idle for more than `peer_idle_secs_max`, but only once the
    /// table has grown past `peer_gc_threshold`. A peer with an outstanding `Arc` reference
    /// elsewhere survives the `retain` call itself but is dropped from the
    /// table; the clone keeps it alive until that caller finishes.
    pub fn gc(&self, now_ns: u64) -> usize {
        if self.peers.len() <= self.gc_threshold {
            return 0;
        }
        let before = self.peers.len();
        self.peers.retain(|_, peer| peer.idle_secs(now_ns) <= self.idle_secs_max);
        before - self.peers.len()
    }
}
