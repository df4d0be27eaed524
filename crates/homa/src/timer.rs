//! Timer.
//!
//! Fires at a 1 ms cadence, driven by the transport's background thread
//! rather than by each RPC arming its own deadline — a flat, single-sweep
//! shape instead of a timer wheel. `tick` is a pure function over snapshots
//! taken under each RPC's own bucket lock, never the grant lock: resends
//! and NEED_ACKs it decides to send are returned to the caller as packets,
//! never written to a socket directly.

use std::sync::Arc;

use crate::config::HomaConfig;
use crate::peer::Peer;
use crate::pool::BufferPool;
use crate::protocol::{
    CommonHeader, NeedAckHeader, Packet, PacketKind, ResendHeader,
};
use crate::rpc::{RpcState, RpcTable};

pub struct OutboundPacket {
    pub peer: Arc<Peer>,
    pub dest_port: u16,
    pub packet: Packet,
}

pub struct TimerContext<'a> {
    pub local_port: u16,
    pub rpcs: &'a RpcTable,
    pub pool: &'a BufferPool,
    pub config: &'a HomaConfig,
    pub now_ns: u64,
}

/// One 1 ms tick: resend probes, timeouts, NEED_ACKs, and opportunistic
/// reaping. Returns the packets the caller should hand to `IpSend`.
pub fn tick(ctx: &TimerContext) -> Vec<OutboundPacket> {
    let mut out = Vec::new();

    for id in ctx.rpcs.client_ids() {
        if let Some(handle) = ctx.rpcs.find_client(id) {
            tick_rpc(ctx, &handle, &mut out);
        }
    }
    for key in ctx.rpcs.server_keys() {
        if let Some(handle) = ctx.rpcs.find_server(key.0, key.1) {
            tick_rpc(ctx, &handle, &mut out);
        }
    }

    reap(ctx);
    out
}

/// If expected data has not progressed in `resend_ticks` ticks, sends a
/// RESEND at `resend_interval` spacing; after `timeout_resends` unanswered
/// RESENDs, aborts the RPC with a timeout error and marks the peer suspect.
/// Also covers the per-peer NEED_ACK rule for server-role RPCs.
fn tick_rpc(ctx: &TimerContext, handle: &crate::rpc::RpcHandle, out: &mut Vec<OutboundPacket>) {
    let mut rpc = handle.lock().unwrap();
    if rpc.is_dead() {
        return;
    }

    rpc.ticks_since_progress += 1;
    // A client that has finished sending its request but hasn't seen a
    // single byte of the response back is just as stalled as one sitting on
    // a half-sent message — `incoming` stays `None` until the first DATA of
    // the response lands, so the two-field match below can't see it alone.
    let awaiting_response = rpc.is_client && rpc.state == RpcState::Incoming;
    let stalled = match (&rpc.incoming, &rpc.outgoing) {
        (Some(incoming), _) => !incoming.is_complete(),
        (None, Some(outgoing)) => !outgoing.is_complete() || awaiting_response,
        (None, None) => false,
    };

    if stalled
        && rpc.ticks_since_progress >= ctx.config.resend_ticks
        && (rpc.ticks_since_progress - ctx.config.resend_ticks) % ctx.config.resend_interval == 0
    {
        if rpc.resends_sent >= ctx.config.timeout_resends {
            let id = rpc.id;
            let peer = rpc.peer.clone();
            let is_client = rpc.is_client;
            let server_key = if is_client { None } else { Some((peer.key, id)) };
            rpc.abort(crate::error::Error::TimedOut(id));
            peer.mark_suspect();
            ctx.rpcs.schedule_reap(is_client, id, server_key);
            return;
        }

        rpc.resends_sent += 1;
        let common = CommonHeader {
            sender_id: rpc.id,
            src_port: ctx.local_port,
            dst_port: rpc.remote_port,
            kind: PacketKind::Resend,
        };
        let ranges = rpc.incoming.as_ref().map(|r| r.missing_ranges()).unwrap_or_default();
        if ranges.is_empty() {
            // Outgoing side stalled waiting on a grant: ask the peer to
            // re-send its own state rather than naming a byte range.
            out.push(OutboundPacket {
                peer: rpc.peer.clone(),
                dest_port: rpc.remote_port,
                packet: Packet::Resend(ResendHeader {
                    common,
                    offset: 0,
                    length: 0,
                    priority: rpc.scheduled_priority,
                }),
            });
        } else {
            for (offset, length) in ranges {
                out.push(OutboundPacket {
                    peer: rpc.peer.clone(),
                    dest_port: rpc.remote_port,
                    packet: Packet::Resend(ResendHeader {
                        common: common.clone(),
                        offset,
                        length,
                        priority: rpc.scheduled_priority,
                    }),
                });
            }
        }
    }

    if !rpc.is_client
        && rpc.state == RpcState::InService
        && rpc.ticks_since_progress >= ctx.config.request_ack_ticks
    {
        out.push(OutboundPacket {
            peer: rpc.peer.clone(),
            dest_port: rpc.remote_port,
            packet: Packet::NeedAck(NeedAckHeader {
                common: CommonHeader {
                    sender_id: rpc.id,
                    src_port: ctx.local_port,
                    dst_port: rpc.remote_port,
                    kind: PacketKind::NeedAck,
                },
            }),
        });
        rpc.ticks_since_progress = 0;
    }
}

/// Opportunistically reaps dead RPCs up to `reap_limit` bpages per
/// invocation; escalates when the dead-buffer count exceeds
/// `dead_buffs_limit`.
fn reap(ctx: &TimerContext) {
    let freed = ctx.rpcs.reap(ctx.config.reap_limit);
    if !freed.is_empty() {
        ctx.pool.release(&freed);
        crate::incoming::retry_waiting(ctx.rpcs, ctx.pool, 0, ctx.now_ns);
    }
    let dead = ctx.rpcs.dead_count();
    if dead > ctx.config.dead_buffs_limit {
        tracing::warn!(dead, limit = ctx.config.dead_buffs_limit, "dead rpc backlog exceeds limit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outgoing::OutgoingMessage;
    use crate::peer::PeerTable;
    use bytes::Bytes;

    fn ctx<'a>(
        rpcs: &'a RpcTable,
        pool: &'a BufferPool,
        config: &'a HomaConfig,
        now_ns: u64,
    ) -> TimerContext<'a> {
        TimerContext { local_port: 100, rpcs, pool, config, now_ns }
    }

    fn cfg() -> HomaConfig {
        let mut c = HomaConfig::default();
        c.resend_ticks = 2;
        c.resend_interval = 1;
        c.timeout_resends = 2;
        c.request_ack_ticks = 3;
        c.reap_limit = 10;
        c
    }

    #[test]
    fn stalled_outgoing_rpc_gets_resent_then_times_out() {
        let config = cfg();
        let rpcs = RpcTable::new(8);
        let pool = BufferPool::new(4096, &config);
        let peers = PeerTable::new(&config);
        let peer = peers.find_or_create(0, "10.0.0.1".parse().unwrap(), 0);

        let handle = rpcs.alloc_client(peer.clone(), 200, 0);
        {
            let mut rpc = handle.lock().unwrap();
            rpc.outgoing = Some(OutgoingMessage::new(Bytes::from(vec![0u8; 100]), 0));
        }

        // Ticks 1: below resend_ticks, nothing sent.
        let t1 = tick(&ctx(&rpcs, &pool, &config, 0));
        assert!(t1.is_empty());

        // Tick 2: resend_ticks reached, first RESEND.
        let t2 = tick(&ctx(&rpcs, &pool, &config, 0));
        assert_eq!(t2.len(), 1);
        assert!(matches!(t2[0].packet, Packet::Resend(_)));

        // Tick 3: resend_interval spacing, second RESEND — now at
        // timeout_resends, so the following tick aborts instead.
        let t3 = tick(&ctx(&rpcs, &pool, &config, 0));
        assert_eq!(t3.len(), 1);

        let t4 = tick(&ctx(&rpcs, &pool, &config, 0));
        assert!(t4.is_empty());
        assert!(handle.lock().unwrap().is_dead());
        assert!(peer.is_suspect());
    }

    #[test]
    fn client_awaiting_response_with_no_incoming_bytes_times_out() {
        let config = cfg();
        let rpcs = RpcTable::new(8);
        let pool = BufferPool::new(4096, &config);
        let peers = PeerTable::new(&config);
        let peer = peers.find_or_create(0, "10.0.0.6".parse().unwrap(), 0);

        let handle = rpcs.alloc_client(peer.clone(), 200, 0);
        {
            let mut rpc = handle.lock().unwrap();
            rpc.outgoing = Some(OutgoingMessage::new(Bytes::from(vec![0u8; 50]), 50));
            rpc.outgoing.as_mut().unwrap().next_segments(50);
            rpc.state = RpcState::Incoming;
        }
        assert!(handle.lock().unwrap().incoming.is_none());

        let t1 = tick(&ctx(&rpcs, &pool, &config, 0));
        assert!(t1.is_empty());
        let t2 = tick(&ctx(&rpcs, &pool, &config, 0));
        assert!(matches!(t2.first().map(|p| &p.packet), Some(Packet::Resend(_))));
        let _t3 = tick(&ctx(&rpcs, &pool, &config, 0));
        let _t4 = tick(&ctx(&rpcs, &pool, &config, 0));
        assert!(handle.lock().unwrap().is_dead());
        assert!(peer.is_suspect());
    }

    #[test]
    fn progressing_rpc_is_left_alone() {
        let config = cfg();
        let rpcs = RpcTable::new(8);
        let pool = BufferPool::new(4096, &config);
        let peers = PeerTable::new(&config);
        let peer = peers.find_or_create(0, "10.0.0.2".parse().unwrap(), 0);
        let handle = rpcs.alloc_client(peer, 200, 0);
        handle.lock().unwrap().outgoing = Some(OutgoingMessage::new(Bytes::from(vec![0u8; 10]), 10));
        // Message has no unsent bytes and no incoming half: not "stalled" by
        // this tick's definition once outgoing is fully granted and sent.
        {
            let mut rpc = handle.lock().unwrap();
            rpc.outgoing.as_mut().unwrap().next_segments(10);
        }
        for _ in 0..5 {
            let out = tick(&ctx(&rpcs, &pool, &config, 0));
            assert!(out.is_empty());
        }
    }

    #[test]
    fn in_service_server_rpc_requests_ack_after_idle() {
        let config = cfg();
        let rpcs = RpcTable::new(8);
        let pool = BufferPool::new(4096, &config);
        let peers = PeerTable::new(&config);
        let peer = peers.find_or_create(0, "10.0.0.3".parse().unwrap(), 0);
        let (handle, _) = rpcs.find_or_create_server(peer, 200, 2, 0);
        {
            let mut rpc = handle.lock().unwrap();
            rpc.state = RpcState::InService;
        }
        let mut saw_need_ack = false;
        for _ in 0..4 {
            let out = tick(&ctx(&rpcs, &pool, &config, 0));
            if out.iter().any(|p| matches!(p.packet, Packet::NeedAck(_))) {
                saw_need_ack = true;
            }
        }
        assert!(saw_need_ack);
    }

    #[test]
    fn dead_rpcs_are_reaped_and_bpages_released() {
        let config = cfg();
        let rpcs = RpcTable::new(8);
        let pool = BufferPool::new(4096, &config);
        let peers = PeerTable::new(&config);
        let peer = peers.find_or_create(0, "10.0.0.4".parse().unwrap(), 0);
        let handle = rpcs.alloc_client(peer, 200, 0);
        let id;
        {
            let mut rpc = handle.lock().unwrap();
            id = rpc.id;
            rpc.bpages = pool.alloc(1, 0, 0).unwrap();
            rpc.end();
        }
        rpcs.schedule_reap(true, id, None);
        assert_eq!(pool.free_count(), pool.total_bpages() - 1);
        tick(&ctx(&rpcs, &pool, &config, 0));
        assert_eq!(pool.free_count(), pool.total_bpages());
        assert!(rpcs.find_client(id).is_none());
    }
}
