//! Per-message reassembly.
//!
//! A message is a set of byte ranges indexed by offset. Segments can arrive
//! out of order or be retransmitted; `insert` deduplicates by offset so a
//! repeated `DATA` segment at the same offset is a no-op. `received` counts
//! distinct bytes seen so far,
//! which is what the grant scheduler budgets against — it does not imply
//! the bytes are readable by the application yet, only that they have
//! landed; `is_complete` is what gates handoff to the application.

use std::collections::BTreeMap;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    New,
    Duplicate,
}

#[derive(Debug)]
pub struct Reassembly {
    length: u32,
    segments: BTreeMap<u32, Bytes>,
    received: u32,
}

impl Reassembly {
    pub fn new(length: u32) -> Self {
        Self { length, segments: BTreeMap::new(), received: 0 }
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn remaining(&self) -> u32 {
        self.length.saturating_sub(self.received)
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.length
    }

    /// Insert a segment at `offset`. A segment already present at that exact
    /// offset is treated as a duplicate and dropped, regardless of its
    /// content — retransmissions of the same range always carry the same
    /// bytes by construction of the sender's segmentation.
    pub fn insert(&mut self, offset: u32, data: Bytes) -> Insert {
        if self.segments.contains_key(&offset) {
            return Insert::Duplicate;
        }
        self.received = self.received.saturating_add(data.len() as u32);
        self.segments.insert(offset, data);
        Insert::New
    }

    /// Concatenate every segment in offset order. Only meaningful once
    /// `is_complete()` — callers should check first. Gaps (if `length` was
    /// wrong or segments overlapped) are silently skipped, not zero-filled,
    /// since correctly-formed input never produces them.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length as usize);
        for segment in self.segments.values() {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Offsets still missing below `length`, used to build RESEND ranges.
    pub fn missing_ranges(&self) -> Vec<(u32, u32)> {
        let mut ranges = Vec::new();
        let mut cursor = 0u32;
        for (&offset, data) in &self.segments {
            if offset > cursor {
                ranges.push((cursor, offset - cursor));
            }
            cursor = cursor.max(offset + data.len() as u32);
        }
        if cursor < self.length {
            ranges.push((cursor, self.length - cursor));
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_segment_is_ignored() {
        let mut r = Reassembly::new(10);
        assert_eq!(r.insert(0, Bytes::from_static(b"0123456789")), Insert::New);
        assert!(r.is_complete());
        assert_eq!(r.insert(0, Bytes::from_static(b"0123456789")), Insert::Duplicate);
        assert_eq!(r.received(), 10);
    }

    #[test]
    fn out_of_order_segments_complete_and_assemble() {
        let mut r = Reassembly::new(6);
        r.insert(3, Bytes::from_static(b"def"));
        assert!(!r.is_complete());
        r.insert(0, Bytes::from_static(b"abc"));
        assert!(r.is_complete());
        assert_eq!(r.assemble(), b"abcdef".to_vec());
    }

    #[test]
    fn missing_ranges_reports_gaps() {
        let mut r = Reassembly::new(100);
        r.insert(0, Bytes::from(vec![0u8; 20]));
        r.insert(60, Bytes::from(vec![0u8; 20]));
        assert_eq!(r.missing_ranges(), vec![(20, 40), (80, 20)]);
    }
}
