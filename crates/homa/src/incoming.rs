//! Incoming dispatch engine.
//!
//! One packet in, zero or more reply packets out. The wire's `sender_id` is
//! always the *other* side's id for this RPC; `mirror()` turns it into the
//! id this host would use to look the RPC up, in either its client or
//! server table, without needing the caller to say in advance which role
//! applies. Handoff to a waiting `recv` happens inline via `interest::handoff`
//! rather than being queued as another action.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::grant::GrantScheduler;
use crate::id::{is_client_id, mirror};
use crate::interest::{handoff, Interest};
use crate::message::Reassembly;
use crate::peer::{Peer, PeerKey};
use crate::pool::BufferPool;
use crate::protocol::{
    AckHeader, CommonHeader, NeedAckHeader, Packet, PacketKind, RpcUnknownHeader,
};
use crate::rpc::{RpcState, RpcTable};

pub struct OutboundPacket {
    pub dest: PeerKey,
    pub dest_port: u16,
    pub packet: Packet,
}

/// Everything a socket's receive path needs to hand a single incoming
/// datagram to the protocol engine. Borrowed, not owned: `Transport` (or a
/// test harness) assembles one of these per call, fresh.
pub struct IncomingContext<'a> {
    pub local_port: u16,
    pub rpcs: &'a RpcTable,
    pub pool: &'a BufferPool,
    pub ready_rpcs: &'a Mutex<VecDeque<u64>>,
    pub shared_interests: &'a Mutex<VecDeque<Arc<Interest>>>,
    pub grant: &'a Arc<GrantScheduler>,
    pub now_ns: u64,
    pub core: Option<u32>,
}

/// Dispatch one already length-checked datagram from `peer`. Returns the
/// reply packets (if any) the caller should hand to `IpSend`. Unparseable or
/// unrecognized-type packets are dropped and counted, never panicked on.
pub fn dispatch(ctx: &IncomingContext, peer: &Arc<Peer>, raw: &[u8]) -> Vec<OutboundPacket> {
    let Some(packet) = Packet::parse(raw) else {
        tracing::debug!(peer = ?peer.key, "dropping short or unrecognized packet");
        return Vec::new();
    };
    let common = packet.common().clone();
    let local_id = mirror(common.sender_id);
    let mut out = Vec::new();

    match packet {
        Packet::Data(hdr) => handle_data(ctx, peer, common.src_port, local_id, hdr, &mut out),
        Packet::Grant(hdr) => handle_grant(ctx, peer, local_id, hdr.offset, hdr.priority),
        Packet::Resend(hdr) => {
            handle_resend(ctx, peer, &common, local_id, hdr.offset, hdr.length, &mut out)
        }
        Packet::RpcUnknown(_) => handle_rpc_unknown(ctx, peer, local_id),
        Packet::Busy(_) => handle_busy(ctx, peer, local_id),
        Packet::Cutoffs(hdr) => peer.apply_received_cutoffs(hdr.version, hdr.cutoffs),
        Packet::NeedAck(_) => handle_need_ack(ctx, peer, &common, local_id, &mut out),
        Packet::Ack(hdr) => handle_ack(ctx, peer, hdr),
        Packet::Freeze(_) => tracing::trace!(peer = ?peer.key, "freeze packet received"),
    }

    out.into_iter()
        .map(|(dest_port, packet)| OutboundPacket { dest: peer.key, dest_port, packet })
        .collect()
}

fn handle_data(
    ctx: &IncomingContext,
    peer: &Arc<Peer>,
    remote_port: u16,
    local_id: u64,
    hdr: crate::protocol::DataHeader,
    out: &mut Vec<(u16, Packet)>,
) {
    let handle = if is_client_id(local_id) {
        ctx.rpcs.find_client(local_id)
    } else {
        Some(ctx.rpcs.find_or_create_server(peer.clone(), remote_port, local_id, ctx.now_ns).0)
    };
    let Some(handle) = handle else {
        tracing::debug!(local_id, "DATA for unknown client rpc, dropping");
        return;
    };

    let mut rpc = handle.lock().unwrap();
    if rpc.incoming.is_none() {
        let needed = ctx.pool.bpages_needed(hdr.message_length as usize);
        match ctx.pool.alloc(needed, ctx.core.unwrap_or(0), ctx.now_ns) {
            Some(pages) => rpc.bpages = pages,
            None => {
                ctx.pool.park_waiting(rpc.id, hdr.message_length);
                return;
            }
        }
        rpc.incoming = Some(Reassembly::new(hdr.message_length));
    }

    let was_complete = rpc.incoming.as_ref().map(|r| r.is_complete()).unwrap_or(false);
    if let Some(reassembly) = rpc.incoming.as_mut() {
        reassembly.insert(hdr.offset, hdr.segment);
    }
    rpc.last_progress_ns = ctx.now_ns;
    rpc.ticks_since_progress = 0;

    let now_complete = rpc.incoming.as_ref().map(|r| r.is_complete()).unwrap_or(false);
    if !was_complete && now_complete {
        // This message's share of `total_incoming` (granted bytes not yet
        // landed) is now fully landed; release whatever slop is left from
        // the last grant rounding up past `length`.
        let len = rpc.incoming.as_ref().map(Reassembly::length).unwrap_or(0);
        let gap = rpc.granted.saturating_sub(len);
        let is_client = rpc.is_client;
        if is_client {
            rpc.end();
        } else {
            rpc.state = RpcState::InService;
        }
        let id = rpc.id;
        let rpc_remote_port = rpc.remote_port;
        let private = rpc.private_interest.clone();
        drop(rpc);
        if gap > 0 {
            ctx.grant.adjust_total_incoming(-(gap as i64));
        }
        if is_client {
            // Queue an ack for this peer's backlog rather than waiting for a
            // NEED_ACK round trip — `transport.rs` flushes it opportunistically.
            peer.add_ack(mirror(id), rpc_remote_port);
        }
        handoff(id, private.as_ref(), ctx.ready_rpcs, ctx.shared_interests, ctx.core);
    }
}

fn find_any(rpcs: &RpcTable, peer_key: PeerKey, local_id: u64) -> Option<crate::rpc::RpcHandle> {
    if is_client_id(local_id) {
        rpcs.find_client(local_id)
    } else {
        rpcs.find_server(peer_key, local_id)
    }
}

/// Re-attempt allocation for every RPC parked on buffer exhaustion, called
/// whenever a release may have freed enough bpages to satisfy one of them.
/// A retry that succeeds only stakes the pages and opens the reassembly
/// shell — the dropped segment itself is gone, so the message still waits
/// on a resend to actually land any bytes.
pub fn retry_waiting(rpcs: &RpcTable, pool: &BufferPool, core: u32, now_ns: u64) {
    for (id, message_length) in pool.take_waiting() {
        let handle = if is_client_id(id) { rpcs.find_client(id) } else { rpcs.find_server_by_id(id) };
        let Some(handle) = handle else { continue };
        let mut rpc = handle.lock().unwrap();
        if rpc.incoming.is_some() {
            continue;
        }
        let needed = pool.bpages_needed(message_length as usize);
        match pool.alloc(needed, core, now_ns) {
            Some(pages) => {
                rpc.bpages = pages;
                rpc.incoming = Some(Reassembly::new(message_length));
            }
            None => pool.park_waiting(id, message_length),
        }
    }
}

fn handle_grant(ctx: &IncomingContext, peer: &Arc<Peer>, local_id: u64, offset: u32, priority: u8) {
    let Some(handle) = find_any(ctx.rpcs, peer.key, local_id) else { return };
    let mut rpc = handle.lock().unwrap();
    if let Some(outgoing) = rpc.outgoing.as_mut() {
        outgoing.update_grant(offset);
    }
    rpc.scheduled_priority = priority;
}

fn handle_resend(
    ctx: &IncomingContext,
    peer: &Arc<Peer>,
    common: &CommonHeader,
    local_id: u64,
    offset: u32,
    length: u32,
    out: &mut Vec<(u16, Packet)>,
) {
    match find_any(ctx.rpcs, peer.key, local_id) {
        Some(handle) => {
            let mut rpc = handle.lock().unwrap();
            if let Some(outgoing) = rpc.outgoing.as_mut() {
                outgoing.mark_retransmit(offset, length);
                rpc.resends_sent += 1;
            }
        }
        None => {
            out.push((
                common.src_port,
                Packet::RpcUnknown(RpcUnknownHeader {
                    common: CommonHeader {
                        sender_id: local_id,
                        src_port: ctx.local_port,
                        dst_port: common.src_port,
                        kind: PacketKind::RpcUnknown,
                    },
                }),
            ));
        }
    }
}

/// On the client side, restarts the RPC from offset 0; on the server side, ends it.
fn handle_rpc_unknown(ctx: &IncomingContext, peer: &Arc<Peer>, local_id: u64) {
    if is_client_id(local_id) {
        if let Some(handle) = ctx.rpcs.find_client(local_id) {
            let mut rpc = handle.lock().unwrap();
            if let Some(outgoing) = rpc.outgoing.as_mut() {
                outgoing.restart();
            }
        }
    } else if let Some(handle) = ctx.rpcs.find_server(peer.key, local_id) {
        handle.lock().unwrap().end();
    }
}

fn handle_busy(ctx: &IncomingContext, peer: &Arc<Peer>, local_id: u64) {
    peer.touch(ctx.now_ns);
    if let Some(handle) = find_any(ctx.rpcs, peer.key, local_id) {
        handle.lock().unwrap().ticks_since_progress = 0;
    }
}

fn handle_need_ack(
    ctx: &IncomingContext,
    peer: &Arc<Peer>,
    common: &CommonHeader,
    local_id: u64,
    out: &mut Vec<(u16, Packet)>,
) {
    let Some(handle) = find_any(ctx.rpcs, peer.key, local_id) else { return };
    let complete = {
        let rpc = handle.lock().unwrap();
        rpc.incoming.as_ref().map(Reassembly::is_complete).unwrap_or(false) || rpc.is_dead()
    };
    if !complete {
        return;
    }
    out.push((
        common.src_port,
        Packet::Ack(AckHeader {
            common: CommonHeader {
                sender_id: local_id,
                src_port: ctx.local_port,
                dst_port: common.src_port,
                kind: PacketKind::Ack,
            },
            acked_ids: vec![common.sender_id],
        }),
    ));
}

/// An ACK's `acked_ids` are expressed in the *receiver's* id space (the
/// convention `handle_need_ack` relies on when it replies with the
/// requester's own id): mirror each one to land on our local id, then
/// dispatch to whichever table actually owns it, the same role-branch every
/// other handler in this file uses.
fn handle_ack(ctx: &IncomingContext, peer: &Arc<Peer>, hdr: AckHeader) {
    for acked in hdr.acked_ids {
        let local = mirror(acked);
        let handle = find_any(ctx.rpcs, peer.key, local);
        let Some(handle) = handle else { continue };
        let mut rpc = handle.lock().unwrap();
        rpc.end();
        rpc.reaped = true;
        let id = rpc.id;
        let is_client = rpc.is_client;
        let server_key = if is_client { None } else { Some((peer.key, id)) };
        drop(rpc);
        ctx.rpcs.schedule_reap(is_client, id, server_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomaConfig;
    use crate::id::IdAllocator;
    use crate::outgoing::OutgoingMessage;
    use crate::peer::PeerTable;
    use crate::protocol::{AckHeader, CommonHeader, DataHeader, PacketKind};
    use std::net::IpAddr;

    fn ctx_parts() -> (HomaConfig, RpcTable, BufferPool, PeerTable, Arc<GrantScheduler>) {
        let config = HomaConfig::default();
        let rpcs = RpcTable::new(8);
        let pool = BufferPool::new(1 << 20, &config);
        let peers = PeerTable::new(&config);
        let grant = Arc::new(GrantScheduler::new(&config));
        (config, rpcs, pool, peers, grant)
    }

    fn new_ctx<'a>(
        rpcs: &'a RpcTable,
        pool: &'a BufferPool,
        ready: &'a Mutex<VecDeque<u64>>,
        shared: &'a Mutex<VecDeque<Arc<Interest>>>,
        grant: &'a Arc<GrantScheduler>,
    ) -> IncomingContext<'a> {
        IncomingContext {
            local_port: 100,
            rpcs,
            pool,
            ready_rpcs: ready,
            shared_interests: shared,
            grant,
            now_ns: 0,
            core: Some(0),
        }
    }

    #[test]
    fn data_completes_server_rpc_and_wakes_shared_waiter() {
        let (_config, rpcs, pool, peers, grant) = ctx_parts();
        let ready = Mutex::new(VecDeque::new());
        let shared = Mutex::new(VecDeque::new());
        let ctx = new_ctx(&rpcs, &pool, &ready, &shared, &grant);
        let peer = peers.find_or_create(0, "10.0.0.5".parse::<IpAddr>().unwrap(), 0);

        // Client id 10 (even); server sees mirror(10) = 11 as the local id.
        let hdr = DataHeader {
            common: CommonHeader { sender_id: 10, src_port: 200, dst_port: 100, kind: PacketKind::Data },
            message_length: 5,
            offset: 0,
            unscheduled_bytes: 5,
            retransmit: false,
            segment: Bytes::from_static(b"hello"),
        };
        let raw = hdr.encode();
        let out = dispatch(&ctx, &peer, &raw);
        assert!(out.is_empty());
        let handle = rpcs.find_server(peer.key, 11).expect("server rpc created");
        let rpc = handle.lock().unwrap();
        assert_eq!(rpc.state, RpcState::InService);
    }

    #[test]
    fn resend_for_unknown_rpc_replies_rpc_unknown() {
        let (_config, rpcs, pool, peers, grant) = ctx_parts();
        let ready = Mutex::new(VecDeque::new());
        let shared = Mutex::new(VecDeque::new());
        let ctx = new_ctx(&rpcs, &pool, &ready, &shared, &grant);
        let peer = peers.find_or_create(0, "10.0.0.6".parse::<IpAddr>().unwrap(), 0);

        let hdr = crate::protocol::ResendHeader {
            common: CommonHeader { sender_id: 20, src_port: 200, dst_port: 100, kind: PacketKind::Resend },
            offset: 0,
            length: 100,
            priority: 2,
        };
        let raw = hdr.encode();
        let out = dispatch(&ctx, &peer, &raw);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].packet, Packet::RpcUnknown(_)));
    }

    #[test]
    fn rpc_unknown_restarts_client_outgoing() {
        let (_config, rpcs, pool, peers, grant) = ctx_parts();
        let ready = Mutex::new(VecDeque::new());
        let shared = Mutex::new(VecDeque::new());
        let ctx = new_ctx(&rpcs, &pool, &ready, &shared, &grant);
        let peer = peers.find_or_create(0, "10.0.0.7".parse::<IpAddr>().unwrap(), 0);

        let client_handle = rpcs.alloc_client(peer.clone(), 200, 0);
        let client_id = client_handle.lock().unwrap().id;
        client_handle.lock().unwrap().outgoing =
            Some(OutgoingMessage::new(Bytes::from(vec![0u8; 1000]), 100));
        {
            let mut rpc = client_handle.lock().unwrap();
            rpc.outgoing.as_mut().unwrap().next_segments(1000);
            assert!(rpc.outgoing.as_ref().unwrap().is_complete());
        }

        let hdr = RpcUnknownHeader {
            common: CommonHeader {
                sender_id: mirror(client_id),
                src_port: 200,
                dst_port: 100,
                kind: PacketKind::RpcUnknown,
            },
        };
        let raw = crate::protocol::encode_simple(&hdr.common);
        dispatch(&ctx, &peer, &raw);
        let rpc = client_handle.lock().unwrap();
        assert_eq!(rpc.outgoing.as_ref().unwrap().sent, 0);
    }

    #[test]
    fn ack_ends_client_rpc() {
        let (_config, rpcs, pool, peers, grant) = ctx_parts();
        let ready = Mutex::new(VecDeque::new());
        let shared = Mutex::new(VecDeque::new());
        let ctx = new_ctx(&rpcs, &pool, &ready, &shared, &grant);
        let peer = peers.find_or_create(0, "10.0.0.8".parse::<IpAddr>().unwrap(), 0);

        let client_handle = rpcs.alloc_client(peer.clone(), 200, 0);
        let client_id = client_handle.lock().unwrap().id;

        let hdr = AckHeader {
            common: CommonHeader {
                sender_id: mirror(client_id),
                src_port: 200,
                dst_port: 100,
                kind: PacketKind::Ack,
            },
            acked_ids: vec![mirror(client_id)],
        };
        let raw = hdr.encode();
        dispatch(&ctx, &peer, &raw);
        assert!(client_handle.lock().unwrap().is_dead());
        assert_eq!(rpcs.dead_count(), 1);
    }

    #[test]
    fn need_ack_replies_only_when_complete() {
        let (_config, rpcs, pool, peers, grant) = ctx_parts();
        let ready = Mutex::new(VecDeque::new());
        let shared = Mutex::new(VecDeque::new());
        let ctx = new_ctx(&rpcs, &pool, &ready, &shared, &grant);
        let peer = peers.find_or_create(0, "10.0.0.9".parse::<IpAddr>().unwrap(), 0);

        let ids = IdAllocator::new();
        let client_id = ids.alloc();
        let (server_handle, _) = rpcs.find_or_create_server(peer.clone(), 200, mirror(client_id), 0);
        server_handle.lock().unwrap().incoming = Some(Reassembly::new(0));

        let hdr = NeedAckHeader {
            common: CommonHeader {
                sender_id: client_id,
                src_port: 200,
                dst_port: 100,
                kind: PacketKind::NeedAck,
            },
        };
        let raw = crate::protocol::encode_simple(&hdr.common);
        let out = dispatch(&ctx, &peer, &raw);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].packet, Packet::Ack(_)));
    }
}
