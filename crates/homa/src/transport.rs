//! Transport: the background machinery `socket.rs` doesn't own itself — the
//! socket table, the shared peer and grant state, and the threads that
//! drive the timer, the pacer, and opportunistic ack flushing. `start()`
//! spawns one thread per subsystem and hands back their `JoinHandle`s.
//!
//! `IpSend` is the boundary a real UDP socket (or a test harness) plugs
//! into, so the transport takes its network layer as a constructor
//! argument rather than owning a concrete one.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::HomaConfig;
use crate::error::Error;
use crate::grant::{Grantable, GrantScheduler};
use crate::id::mirror;
use crate::incoming::{self, IncomingContext};
use crate::pacer::{Pacer, ThrottledPacket};
use crate::peer::{Peer, PeerKey, PeerTable};
use crate::protocol::{
    peek_kind, AckHeader, CommonHeader, CutoffsHeader, DataHeader, GrantHeader, Packet, PacketKind,
};
use crate::rpc::{RpcHandle, RpcState};
use crate::socket::Socket;
use crate::socktab::SocketTable;
use crate::timer::{self, TimerContext};

/// The network boundary a transport sends finished packets through. A real
/// binary implements this over a UDP socket; tests implement it over an
/// in-memory channel.
pub trait IpSend: Send + Sync {
    fn send(&self, namespace: u32, dest: PeerKey, dest_port: u16, src_port: u16, packet: &Packet);
}

/// Coarse classification an ICMP error maps onto, for whatever IP layer
/// sits below `IpSend` to hand back to [`Transport::on_icmp_error`] once it
/// has recovered the quoted original datagram's RPC id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Destination or address unreachable.
    HostUnreachable,
    /// Destination unreachable, port unreachable: the peer has no socket on
    /// that port, or no such RPC.
    PortUnreachable,
    /// Destination unreachable, protocol unreachable.
    ProtocolUnreachable,
}

impl IcmpError {
    fn into_rpc_error(self) -> Error {
        match self {
            IcmpError::HostUnreachable => Error::HostUnreachable,
            IcmpError::PortUnreachable => Error::NotConnected,
            IcmpError::ProtocolUnreachable => Error::ProtoNotSupported,
        }
    }
}

pub struct Transport<S: IpSend> {
    namespace: u32,
    config: HomaConfig,
    peers: Arc<PeerTable>,
    grant: Arc<GrantScheduler>,
    pacer: Arc<Pacer>,
    sockets: SocketTable<Socket>,
    ip: Arc<S>,
    shutdown: AtomicBool,
    /// Wall-clock-free tick source for tests; a real binary stamps this from
    /// `CLOCK_MONOTONIC` before each call.
    clock: Mutex<u64>,
}

impl<S: IpSend> Transport<S> {
    pub fn new(namespace: u32, config: HomaConfig, ip: Arc<S>) -> Arc<Self> {
        let socktab_buckets = config.socktab_buckets;
        Arc::new(Self {
            namespace,
            grant: Arc::new(GrantScheduler::new(&config)),
            pacer: Arc::new(Pacer::new(&config)),
            peers: Arc::new(PeerTable::new(&config)),
            sockets: SocketTable::new(socktab_buckets),
            config,
            ip,
            shutdown: AtomicBool::new(false),
            clock: Mutex::new(0),
        })
    }

    pub fn now_ns(&self) -> u64 {
        *self.clock.lock().unwrap()
    }

    pub fn set_now_ns(&self, now_ns: u64) {
        *self.clock.lock().unwrap() = now_ns;
    }

    /// Opens a socket on `port`; `port == 0` takes the next default port.
    pub fn open(&self, port: u16) -> crate::error::Result<Arc<Socket>> {
        let socket =
            Arc::new(Socket::new(self.namespace, 0, self.config.clone(), self.peers.clone(), self.grant.clone()));
        let bound = if port == 0 {
            self.sockets.alloc_default_port(self.namespace, socket.clone())?
        } else {
            self.sockets.insert(self.namespace, port, socket.clone())?;
            port
        };
        socket.set_port(bound);
        Ok(socket)
    }

    pub fn close(&self, socket: &Arc<Socket>) {
        socket.shutdown();
        self.sockets.remove(self.namespace, socket.port());
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Dispatch one inbound datagram. `src_addr` is the IP layer's sender
    /// address; the RPC/peer protocol never trusts an application-supplied
    /// address for identity.
    pub fn receive(&self, local_port: u16, src_addr: IpAddr, raw: &[u8], core: Option<u32>) {
        let Some(socket) = self.sockets.find(self.namespace, local_port) else {
            tracing::debug!(local_port, "datagram for unbound port, dropping");
            return;
        };
        if peek_kind(raw).is_none() {
            tracing::debug!(local_port, "unrecognized packet type, dropping before touching peer state");
            return;
        }
        let now_ns = self.now_ns();
        let peer = self.peers.find_or_create(self.namespace, src_addr, now_ns);
        peer.touch(now_ns);

        let Some(pool) = socket.pool() else {
            tracing::debug!(local_port, "no receive buffer configured, dropping datagram");
            return;
        };
        let ctx = IncomingContext {
            local_port,
            rpcs: &socket.rpcs,
            pool,
            ready_rpcs: &socket.ready_rpcs,
            shared_interests: &socket.shared_interests,
            grant: &self.grant,
            now_ns,
            core,
        };
        for out in incoming::dispatch(&ctx, &peer, raw) {
            self.ip.send(self.namespace, out.dest, out.dest_port, local_port, &out.packet);
        }

        self.flush_acks(&peer, local_port);

        // A GRANT advancing `granted`, or a RESEND/RPC_UNKNOWN marking bytes
        // for retransmission, just opened outgoing capacity `dispatch` only
        // accounted for — push it onto the wire or the pacer the same way
        // `send()` seeds a fresh message's unscheduled prefix.
        if let Some(packet) = Packet::parse(raw) {
            let common = packet.common();
            let local_id = mirror(common.sender_id);
            self.kick(&socket, local_id, now_ns);
            self.flush_cutoffs(&peer, local_port, common.src_port);
        }

        // The DATA we just processed may have created a new grantable
        // message, or advanced one enough to free up a slot under
        // `max_incoming` for the others — re-rank and issue.
        self.run_grant_cycle(now_ns);
    }

    /// Abort the RPC an ICMP error refers to. `local_port` and `rpc_id`
    /// come from the quoted original datagram the IP layer recovered from
    /// the ICMP payload; `rpc_id` is already this host's own id for it,
    /// since this host was the one that sent the packet being complained
    /// about. A no-op if the port or RPC is no longer around.
    pub fn on_icmp_error(&self, local_port: u16, rpc_id: u64, kind: IcmpError) {
        let Some(socket) = self.sockets.find(self.namespace, local_port) else { return };
        let _ = socket.abort(rpc_id, kind.into_rpc_error());
    }

    /// `sendmsg`, wired through this transport's pacer: `Socket::sendmsg`
    /// alone only creates the RPC's `OutgoingMessage`; getting the
    /// unscheduled prefix onto the wire is this transport's job — the split
    /// between "bytes are ready" and "bytes are sent."
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        socket: &Arc<Socket>,
        dest: Option<(Arc<Peer>, u16)>,
        id: u64,
        data: bytes::Bytes,
        completion_cookie: u64,
        private: bool,
        non_blocking: bool,
    ) -> crate::error::Result<u64> {
        let now_ns = self.now_ns();
        let out_id =
            socket.sendmsg(socket.port(), dest, id, data, completion_cookie, private, non_blocking, now_ns)?;
        self.kick(socket, out_id, now_ns);
        Ok(out_id)
    }

    /// Segment whatever an RPC's `OutgoingMessage` currently allows
    /// (unscheduled prefix on a fresh send, newly granted bytes, or a
    /// retransmit range) and either put it straight on the wire or hand it to
    /// the pacer's throttled list, mirroring the immediate-vs-throttled
    /// decision `pacer.rs` makes for every other packet.
    fn kick(&self, socket: &Arc<Socket>, id: u64, now_ns: u64) {
        let Some(handle) = socket.find_rpc(id) else { return };
        let (peer, remote_port, total_length, segments) = {
            let mut rpc = handle.lock().unwrap();
            let Some(outgoing) = rpc.outgoing.as_mut() else { return };
            let segments = outgoing.next_segments(self.config.max_gso_size);
            if segments.is_empty() {
                return;
            }
            let total_length = outgoing.length;
            let bytes: Vec<_> =
                segments.iter().map(|s| outgoing.segment_bytes(s.offset, s.length)).collect();
            if outgoing.is_complete() && rpc.is_client && rpc.state == RpcState::Outgoing {
                rpc.state = RpcState::Incoming;
            }
            (rpc.peer.clone(), rpc.remote_port, total_length, segments.into_iter().zip(bytes).collect::<Vec<_>>())
        };

        for (segment, bytes) in segments {
            if self.pacer.admit(segment.length, false, now_ns) {
                let data = Packet::Data(DataHeader {
                    common: CommonHeader {
                        sender_id: id,
                        src_port: socket.port(),
                        dst_port: remote_port,
                        kind: PacketKind::Data,
                    },
                    message_length: total_length,
                    offset: segment.offset,
                    unscheduled_bytes: self.config.unsched_bytes,
                    retransmit: segment.retransmit,
                    segment: bytes,
                });
                self.ip.send(self.namespace, peer.key, remote_port, socket.port(), &data);
            } else {
                self.pacer.enqueue_throttled(ThrottledPacket {
                    rpc_id: id,
                    peer: peer.key,
                    offset: segment.offset,
                    length: segment.length,
                    remaining_after: total_length.saturating_sub(segment.offset + segment.length),
                    arrival_ns: now_ns,
                });
            }
        }
    }

    /// Gathers every message this namespace is currently receiving, ranks
    /// and budgets them, and turns whatever `GrantScheduler` decides into
    /// outbound GRANT packets. Candidates are snapshotted with each RPC's
    /// bucket lock taken one at a time and released before the scheduler's
    /// own lock is taken.
    fn run_grant_cycle(&self, now_ns: u64) {
        let mut candidates = Vec::new();
        let mut owners: std::collections::HashMap<u64, (Arc<Socket>, RpcHandle)> =
            std::collections::HashMap::new();
        for socket in self.sockets.snapshot() {
            for handle in socket.rpcs.all_handles() {
                let grantable = {
                    let rpc = handle.lock().unwrap();
                    rpc.incoming.as_ref().and_then(|incoming| {
                        if incoming.length() > self.config.unsched_bytes && incoming.received() < incoming.length()
                        {
                            Some(Grantable {
                                rpc_id: rpc.id,
                                peer: rpc.peer.key,
                                length: incoming.length(),
                                received: incoming.received(),
                                granted: rpc.granted,
                                arrival_ns: rpc.created_ns,
                            })
                        } else {
                            None
                        }
                    })
                };
                if let Some(grantable) = grantable {
                    owners.insert(grantable.rpc_id, (socket.clone(), handle.clone()));
                    candidates.push(grantable);
                }
            }
        }
        if candidates.is_empty() {
            return;
        }

        for decision in self.grant.recompute(&candidates, now_ns) {
            let Some((socket, handle)) = owners.get(&decision.rpc_id) else { continue };
            let (peer, remote_port) = {
                let mut rpc = handle.lock().unwrap();
                rpc.granted = decision.offset;
                rpc.scheduled_priority = decision.priority;
                (rpc.peer.clone(), rpc.remote_port)
            };
            let packet = Packet::Grant(GrantHeader {
                common: CommonHeader {
                    sender_id: decision.rpc_id,
                    src_port: socket.port(),
                    dst_port: remote_port,
                    kind: PacketKind::Grant,
                },
                offset: decision.offset,
                priority: decision.priority,
            });
            self.ip.send(self.namespace, peer.key, remote_port, socket.port(), &packet);
        }
    }

    /// Opportunistically flush a peer's ack backlog, grouping by the remote
    /// port each acked id actually belongs to: an ack packet is addressed
    /// to one port, so ids bound for different ports can't share one
    /// datagram.
    fn flush_acks(&self, peer: &Arc<Peer>, local_port: u16) {
        let pending = peer.take_pending_acks();
        if pending.is_empty() {
            return;
        }
        let mut by_port: std::collections::BTreeMap<u16, Vec<u64>> = std::collections::BTreeMap::new();
        for (id, remote_port) in pending {
            by_port.entry(remote_port).or_default().push(id);
        }
        for (remote_port, acked_ids) in by_port {
            let packet = Packet::Ack(AckHeader {
                common: CommonHeader {
                    sender_id: 0,
                    src_port: local_port,
                    dst_port: remote_port,
                    kind: PacketKind::Ack,
                },
                acked_ids,
            });
            self.ip.send(self.namespace, peer.key, remote_port, local_port, &packet);
        }
    }

    /// Piggyback this host's own unscheduled-priority cutoffs on a reply to
    /// `peer` whenever `mark_cutoffs_stale` (or first contact) has left them
    /// unsent. A no-op once the peer is caught up.
    fn flush_cutoffs(&self, peer: &Arc<Peer>, local_port: u16, remote_port: u16) {
        let Some((version, cutoffs)) = peer.take_cutoffs_to_send() else { return };
        let packet = Packet::Cutoffs(CutoffsHeader {
            common: CommonHeader {
                sender_id: 0,
                src_port: local_port,
                dst_port: remote_port,
                kind: PacketKind::Cutoffs,
            },
            version,
            cutoffs,
        });
        self.ip.send(self.namespace, peer.key, remote_port, local_port, &packet);
    }

    /// Spawn the timer and pacer-drain background threads. Returns their
    /// handles so the caller can join them on shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>>
    where
        S: 'static,
    {
        let timer_self = Arc::clone(self);
        let timer = std::thread::Builder::new()
            .name("homa-timer".into())
            .spawn(move || timer_self.timer_loop())
            .expect("failed to spawn homa timer thread");

        let pacer_self = Arc::clone(self);
        let pacer = std::thread::Builder::new()
            .name("homa-pacer".into())
            .spawn(move || pacer_self.pacer_loop())
            .expect("failed to spawn homa pacer thread");

        let gc_self = Arc::clone(self);
        let gc = std::thread::Builder::new()
            .name("homa-peer-gc".into())
            .spawn(move || gc_self.gc_loop())
            .expect("failed to spawn homa peer-gc thread");

        vec![timer, pacer, gc]
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for socket in self.sockets.snapshot() {
            socket.shutdown();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// One sweep of every open socket per 1 ms tick.
    fn timer_loop(&self) {
        while !self.is_shutdown() {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn tick_once(&self) {
        let now_ns = self.now_ns();
        self.run_grant_cycle(now_ns);
        for socket in self.sockets.snapshot() {
            let Some(pool) = socket.pool() else { continue };
            let ctx = TimerContext {
                local_port: socket.port(),
                rpcs: &socket.rpcs,
                pool,
                config: &self.config,
                now_ns,
            };
            for out in timer::tick(&ctx) {
                self.ip.send(self.namespace, out.peer.key, out.dest_port, socket.port(), &out.packet);
            }
        }
    }

    /// Drains whatever the pacer has released since the last sweep.
    /// Resolving a released packet's owning socket is a linear scan over
    /// open sockets — acceptable at this reference scale; a NIC-facing
    /// implementation would index sockets by RPC id instead.
    fn pacer_loop(&self) {
        while !self.is_shutdown() {
            self.drain_pacer_once();
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn drain_pacer_once(&self) {
        while let Some(packet) = self.pacer.pop_next() {
            let Some((socket, handle)) = self.find_owning_socket(packet.rpc_id) else { continue };
            let Some((segment, remote_port)) = (|| {
                let rpc = handle.lock().unwrap();
                let outgoing = rpc.outgoing.as_ref()?;
                Some((outgoing.segment_bytes(packet.offset, packet.length), rpc.remote_port))
            })() else {
                continue;
            };
            let data = Packet::Data(crate::protocol::DataHeader {
                common: CommonHeader {
                    sender_id: packet.rpc_id,
                    src_port: socket.port(),
                    dst_port: remote_port,
                    kind: PacketKind::Data,
                },
                message_length: packet.length + packet.offset + packet.remaining_after,
                offset: packet.offset,
                unscheduled_bytes: self.config.unsched_bytes,
                retransmit: false,
                segment,
            });
            self.pacer.on_sent(packet.length);
            self.ip.send(self.namespace, packet.peer, remote_port, socket.port(), &data);
        }
    }

    fn find_owning_socket(&self, id: u64) -> Option<(Arc<Socket>, crate::rpc::RpcHandle)> {
        for socket in self.sockets.snapshot() {
            if let Some(handle) = socket.find_rpc(id) {
                return Some((socket, handle));
            }
        }
        None
    }

    /// Sweeps the peer table once a second. Kept off `timer_loop` since gc
    /// runs far less often than once per millisecond.
    fn gc_loop(&self) {
        while !self.is_shutdown() {
            std::thread::sleep(Duration::from_secs(1));
            self.gc_peers();
        }
    }

    /// LRU-evicts idle peers past the configured threshold. Exposed as a
    /// standalone method so tests can call it directly on a clock they
    /// control rather than waiting on `gc_loop`'s real-time sleep.
    pub fn gc_peers(&self) -> usize {
        self.peers.gc(self.now_ns())
    }
}

/// True once an RPC has nothing further this side is responsible for. Used
/// by integration tests that drive a `Transport` directly rather than
/// through `Socket::recvmsg`.
pub fn rpc_is_dead(handle: &crate::rpc::RpcHandle) -> bool {
    handle.lock().unwrap().state == RpcState::Dead
}
