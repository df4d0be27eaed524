//! Pacer.
//!
//! Approximates the NIC's transmit queue with a single nanosecond counter
//! instead of reading real hardware occupancy: every packet pushed adds its
//! serialization time, every tick subtracts elapsed real time. Packets that
//! would make the estimated queue too deep are deferred to a throttled list
//! ranked by remaining bytes (SRPT), with a small deterministic fraction
//! routed FIFO so a steady stream of short messages can't starve whichever
//! message has been waiting the longest — the same "reserve a slice for the
//! oldest" shape `grant.rs` uses for its own scheduling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::HomaConfig;
use crate::peer::PeerKey;

#[derive(Debug, Clone, Copy)]
pub struct ThrottledPacket {
    pub rpc_id: u64,
    pub peer: PeerKey,
    pub offset: u32,
    pub length: u32,
    pub remaining_after: u32,
    pub arrival_ns: u64,
}

struct QueueState {
    queue_ns: i64,
    last_update_ns: u64,
}

pub struct Pacer {
    link_mbps: u64,
    max_nic_queue_ns: i64,
    throttle_min_bytes: u32,
    pacer_fifo_fraction: u32,
    queue: Mutex<QueueState>,
    fifo_accum: AtomicU64,
    throttled: Mutex<Vec<ThrottledPacket>>,
}

impl Pacer {
    pub fn new(config: &HomaConfig) -> Self {
        Self {
            link_mbps: config.link_mbps.max(1),
            max_nic_queue_ns: config.max_nic_queue_ns as i64,
            throttle_min_bytes: config.throttle_min_bytes,
            pacer_fifo_fraction: config.pacer_fifo_fraction,
            queue: Mutex::new(QueueState { queue_ns: 0, last_update_ns: 0 }),
            fifo_accum: AtomicU64::new(0),
            throttled: Mutex::new(Vec::new()),
        }
    }

    /// Decay the estimate by real elapsed time and clamp at zero — an idle
    /// link never owes negative queue time to a future burst.
    fn decay_locked(state: &mut QueueState, now_ns: u64) -> i64 {
        let elapsed = now_ns.saturating_sub(state.last_update_ns) as i64;
        state.last_update_ns = now_ns;
        state.queue_ns = (state.queue_ns - elapsed).max(0);
        state.queue_ns
    }

    /// Nanoseconds to serialize `packet_bytes` at `link_mbps`.
    fn transmit_ns(&self, packet_bytes: u32) -> i64 {
        (packet_bytes as u64 * 8 * 1000 / self.link_mbps) as i64
    }

    /// Decide whether `packet_bytes` may go out right now, updating the
    /// estimated queue occupancy either way (a sent packet always adds its
    /// own transmit time to the running total).
    pub fn admit(&self, packet_bytes: u32, dont_throttle: bool, now_ns: u64) -> bool {
        let mut state = self.queue.lock().unwrap();
        let queue = Self::decay_locked(&mut state, now_ns);
        let immediate =
            queue <= self.max_nic_queue_ns || packet_bytes < self.throttle_min_bytes || dont_throttle;
        if immediate {
            state.queue_ns += self.transmit_ns(packet_bytes);
        }
        immediate
    }

    pub fn on_sent(&self, packet_bytes: u32) {
        self.queue.lock().unwrap().queue_ns += self.transmit_ns(packet_bytes);
    }

    pub fn enqueue_throttled(&self, packet: ThrottledPacket) {
        self.throttled.lock().unwrap().push(packet);
    }

    /// Pop the next throttled packet to release. Every `pacer_fifo_fraction`
    /// (parts per thousand) of calls return the oldest-arrived packet
    /// instead of the shortest-remaining one, guaranteeing forward progress
    /// for long messages under a constant stream of short ones.
    pub fn pop_next(&self) -> Option<ThrottledPacket> {
        let mut throttled = self.throttled.lock().unwrap();
        if throttled.is_empty() {
            return None;
        }
        let accum = self.fifo_accum.fetch_add(self.pacer_fifo_fraction as u64, Ordering::AcqRel)
            + self.pacer_fifo_fraction as u64;
        let idx = if accum >= 1000 {
            self.fifo_accum.fetch_sub(1000, Ordering::AcqRel);
            throttled
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.arrival_ns)
                .map(|(i, _)| i)
        } else {
            throttled
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.remaining_after)
                .map(|(i, _)| i)
        };
        idx.map(|i| throttled.remove(i))
    }

    pub fn throttled_len(&self) -> usize {
        self.throttled.lock().unwrap().len()
    }

    pub fn queue_ns(&self, now_ns: u64) -> i64 {
        let mut state = self.queue.lock().unwrap();
        Self::decay_locked(&mut state, now_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HomaConfig {
        let mut c = HomaConfig::default();
        c.link_mbps = 1_000;
        c.max_nic_queue_ns = 1_000;
        c.throttle_min_bytes = 100;
        c.pacer_fifo_fraction = 0;
        c
    }

    fn peer(n: u16) -> PeerKey {
        PeerKey { namespace: 0, addr: std::net::Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, n) }
    }

    #[test]
    fn small_packets_bypass_throttling() {
        let pacer = Pacer::new(&cfg());
        assert!(pacer.admit(10, false, 0));
    }

    #[test]
    fn large_backlog_forces_throttling() {
        let pacer = Pacer::new(&cfg());
        // Fill the queue past max_nic_queue_ns with one big packet.
        assert!(pacer.admit(10_000, false, 0));
        assert!(!pacer.admit(5_000, false, 0));
    }

    #[test]
    fn dont_throttle_flag_always_admits() {
        let pacer = Pacer::new(&cfg());
        pacer.admit(10_000, false, 0);
        assert!(pacer.admit(5_000, true, 0));
    }

    #[test]
    fn queue_decays_with_elapsed_time() {
        let pacer = Pacer::new(&cfg());
        pacer.admit(10_000, false, 0);
        let at_1ns = pacer.queue_ns(1);
        let at_10us = pacer.queue_ns(10_000);
        assert!(at_10us < at_1ns);
        assert_eq!(pacer.queue_ns(10_000_000), 0);
    }

    #[test]
    fn shortest_remaining_is_released_first_without_fifo_reserve() {
        let pacer = Pacer::new(&cfg());
        pacer.enqueue_throttled(ThrottledPacket {
            rpc_id: 1,
            peer: peer(1),
            offset: 0,
            length: 1000,
            remaining_after: 50_000,
            arrival_ns: 0,
        });
        pacer.enqueue_throttled(ThrottledPacket {
            rpc_id: 2,
            peer: peer(2),
            offset: 0,
            length: 1000,
            remaining_after: 500,
            arrival_ns: 1,
        });
        let next = pacer.pop_next().unwrap();
        assert_eq!(next.rpc_id, 2);
    }

    #[test]
    fn fifo_reserve_eventually_releases_oldest() {
        let mut config = cfg();
        config.pacer_fifo_fraction = 1000;
        let pacer = Pacer::new(&config);
        pacer.enqueue_throttled(ThrottledPacket {
            rpc_id: 1,
            peer: peer(1),
            offset: 0,
            length: 1000,
            remaining_after: 50_000,
            arrival_ns: 0,
        });
        pacer.enqueue_throttled(ThrottledPacket {
            rpc_id: 2,
            peer: peer(2),
            offset: 0,
            length: 1000,
            remaining_after: 500,
            arrival_ns: 1,
        });
        let next = pacer.pop_next().unwrap();
        assert_eq!(next.rpc_id, 1);
    }
}
