//! Receive-buffer pool.
//!
//! One pool per socket, carved out of a user-supplied region of `L` bytes
//! into fixed-size, power-of-two bpages. A bpage is leased to a CPU core for
//! `bpage_lease_usecs` to avoid cross-core cache ping-pong on the hot
//! allocate/free path; another core may steal a bpage only once its lease
//! has expired. A message needing `ceil(len / bpage_size)` pages that cannot
//! find enough free ones has its first DATA segment dropped, and its id and
//! message length are recorded on `waiting_for_bufs`. The incoming engine
//! drains that list on every bpage release and re-attempts allocation for
//! each; a retry only pre-stakes the pages and reassembly shell, though —
//! the dropped segment's bytes are gone, so the sender's own timer still has
//! to resend before the message actually makes progress.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::HomaConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Free,
    /// Backing a live message; released back to `Free` when the application
    /// returns the bpage via a later `recvmsg`.
    Message,
}

#[derive(Debug, Clone, Copy)]
struct BpageSlot {
    owner: Owner,
    /// Core this page is leased to for allocation purposes; `None` once the
    /// lease has lapsed and any core may claim it.
    leased_core: Option<u32>,
    lease_deadline_ns: u64,
}

impl BpageSlot {
    fn free() -> Self {
        Self { owner: Owner::Free, leased_core: None, lease_deadline_ns: 0 }
    }
}

pub struct BufferPool {
    bpage_size: usize,
    lease_ns: u64,
    slots: Vec<Mutex<BpageSlot>>,
    waiting_for_bufs: Mutex<VecDeque<(u64, u32)>>,
}

impl BufferPool {
    /// `region_len` is the size of the user-supplied region in bytes
    /// (`SO_HOMA_RCVBUF`'s `length`); it is divided evenly into bpages.
    pub fn new(region_len: usize, config: &HomaConfig) -> Self {
        let bpage_size = config.bpage_size.max(1);
        let num_bpages = (region_len / bpage_size).max(1);
        Self {
            bpage_size,
            lease_ns: config.bpage_lease_usecs * 1_000,
            slots: (0..num_bpages).map(|_| Mutex::new(BpageSlot::free())).collect(),
            waiting_for_bufs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn bpage_size(&self) -> usize {
        self.bpage_size
    }

    pub fn bpages_needed(&self, message_len: usize) -> usize {
        (message_len + self.bpage_size - 1) / self.bpage_size
    }

    /// Try to reserve `count` bpages for an arriving message, preferring the
    /// lowest-numbered page that is free and not held under another core's
    /// live lease. Returns `None` (rather than a partial allocation) if
    /// fewer than `count` pages are currently available.
    pub fn alloc(&self, count: usize, core: u32, now_ns: u64) -> Option<Vec<usize>> {
        let mut claimed = Vec::with_capacity(count);
        for (idx, slot) in self.slots.iter().enumerate() {
            if claimed.len() == count {
                break;
            }
            let mut slot = slot.lock().unwrap();
            if slot.owner != Owner::Free {
                continue;
            }
            let leased_elsewhere = matches!(slot.leased_core, Some(c) if c != core)
                && slot.lease_deadline_ns > now_ns;
            if leased_elsewhere {
                continue;
            }
            slot.owner = Owner::Message;
            slot.leased_core = Some(core);
            slot.lease_deadline_ns = now_ns + self.lease_ns;
            claimed.push(idx);
        }
        if claimed.len() < count {
            // Roll back: an all-or-nothing allocation keeps accounting
            // simple for the caller (a message either has all its bpages
            // or none of them).
            for idx in claimed {
                let mut slot = self.slots[idx].lock().unwrap();
                slot.owner = Owner::Free;
            }
            return None;
        }
        Some(claimed)
    }

    /// Return bpages to the pool; called once the application has consumed
    /// them and handed the offsets back on a subsequent `recvmsg`.
    pub fn release(&self, indices: &[usize]) {
        for &idx in indices {
            if let Some(slot) = self.slots.get(idx) {
                let mut slot = slot.lock().unwrap();
                slot.owner = Owner::Free;
            }
        }
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().unwrap().owner == Owner::Free).count()
    }

    pub fn total_bpages(&self) -> usize {
        self.slots.len()
    }

    pub fn park_waiting(&self, rpc_id: u64, message_length: u32) {
        let mut waiting = self.waiting_for_bufs.lock().unwrap();
        if !waiting.iter().any(|(id, _)| *id == rpc_id) {
            waiting.push_back((rpc_id, message_length));
        }
    }

    /// Drain the list of RPCs parked on buffer exhaustion, paired with the
    /// message length their allocation needs; called whenever bpages become
    /// available so the incoming engine can retry them.
    pub fn take_waiting(&self) -> Vec<(u64, u32)> {
        self.waiting_for_bufs.lock().unwrap().drain(..).collect()
    }
}
