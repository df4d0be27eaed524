//! RPC identity.
//!
//! The low bit of a 64-bit id names the role: 0 on the originating
//! (client) side, 1 on the same RPC's server-side mirror. An id is never
//! reused by a client while it might still be referenced by a peer.

use std::sync::atomic::{AtomicU64, Ordering};

/// An id allocated above this floor can never collide with a small hand-
/// picked id used in tests or examples.
pub const ID_FLOOR: u64 = 1 << 8;

#[inline]
pub fn is_client_id(id: u64) -> bool {
    id & 1 == 0
}

#[inline]
pub fn is_server_id(id: u64) -> bool {
    !is_client_id(id)
}

/// The id this host would see if it were on the other side of this RPC.
#[inline]
pub fn mirror(id: u64) -> u64 {
    id ^ 1
}

/// Per-host monotonic client-id generator. Every id it produces has its low
/// bit clear (client role); the bit is set only when the id crosses onto the
/// responder's host as that RPC's server-side mirror.
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        // Start above the floor and make sure the first allocated id is even.
        let start = ID_FLOOR & !1;
        Self { next: AtomicU64::new(start) }
    }

    /// Atomically reserve the next client id. Ids increase strictly
    /// monotonically for the lifetime of this allocator.
    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_even_and_monotonic() {
        let alloc = IdAllocator::new();
        let mut prev = None;
        for _ in 0..100 {
            let id = alloc.alloc();
            assert!(is_client_id(id));
            if let Some(p) = prev {
                assert!(id > p);
            }
            prev = Some(id);
        }
    }

    #[test]
    fn mirror_round_trips() {
        let id = 42u64;
        assert!(is_client_id(id));
        let m = mirror(id);
        assert!(is_server_id(m));
        assert_eq!(mirror(m), id);
    }
}
