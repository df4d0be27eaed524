//! Outgoing engine.
//!
//! `OutgoingMessage` tracks how much of a message has been handed to the
//! pacer (`sent`) versus how much the peer currently permits (`granted`,
//! seeded with the unscheduled prefix and advanced by incoming `GRANT`
//! packets). `next_segments` turns that bookkeeping into the list of byte
//! ranges that may be transmitted right now, retransmission ranges first.

use bytes::Bytes;

pub struct OutgoingMessage {
    pub data: Bytes,
    pub length: u32,
    pub sent: u32,
    pub granted: u32,
    pub unsched_bytes: u32,
    /// Ranges a peer's RESEND asked for, serviced before new segments —
    /// retransmission ranges are prioritized over the next scheduled
    /// release.
    retransmit_ranges: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub length: u32,
    pub retransmit: bool,
}

impl OutgoingMessage {
    pub fn new(data: Bytes, unsched_bytes: u32) -> Self {
        let length = data.len() as u32;
        let unsched_bytes = unsched_bytes.min(length);
        Self { data, length, sent: 0, granted: unsched_bytes, unsched_bytes, retransmit_ranges: Vec::new() }
    }

    pub fn is_complete(&self) -> bool {
        self.sent >= self.length
    }

    /// Advances `granted` monotonically; regressions are ignored.
    pub fn update_grant(&mut self, offset: u32) {
        let offset = offset.min(self.length);
        if offset > self.granted {
            self.granted = offset;
        }
    }

    pub fn mark_retransmit(&mut self, offset: u32, length: u32) {
        let length = length.min(self.length.saturating_sub(offset));
        if length > 0 {
            self.retransmit_ranges.push((offset, length));
        }
    }

    /// Rebuild unsent state from offset 0, as directed on receipt of
    /// RPC_UNKNOWN from the client side: the peer has forgotten this RPC,
    /// so every byte must be considered unacknowledged again.
    pub fn restart(&mut self) {
        self.sent = 0;
        self.granted = self.unsched_bytes;
        self.retransmit_ranges.clear();
    }

    /// Bytes this RPC may push right now, one `Segment` at a time, each no
    /// larger than `max_gso_size`. Retransmit ranges are drained first;
    /// normal forward progress resumes once they're exhausted.
    pub fn next_segments(&mut self, max_gso_size: u32) -> Vec<Segment> {
        let mut out = Vec::new();
        while let Some((offset, len)) = self.retransmit_ranges.pop() {
            let chunk = len.min(max_gso_size.max(1));
            out.push(Segment { offset, length: chunk, retransmit: true });
            if chunk < len {
                self.retransmit_ranges.push((offset + chunk, len - chunk));
            }
        }
        while self.sent < self.granted {
            let remaining = self.granted - self.sent;
            let chunk = remaining.min(max_gso_size.max(1));
            out.push(Segment { offset: self.sent, length: chunk, retransmit: false });
            self.sent += chunk;
        }
        out
    }

    pub fn segment_bytes(&self, offset: u32, length: u32) -> Bytes {
        let start = offset.min(self.length) as usize;
        let end = (offset + length).min(self.length) as usize;
        self.data.slice(start..end)
    }
}

/// Whether a `send(id, ...)` call is valid given the RPC's current state
/// and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSendOutcome {
    Ok,
    /// id doesn't belong to an `IN_SERVICE` RPC on this socket.
    Invalid,
    /// The RPC no longer exists; the client may have abandoned it. Not an
    /// error — `send` should succeed as a no-op.
    NoOp,
}

pub fn validate_response_send(found: Option<bool>) -> ResponseSendOutcome {
    match found {
        None => ResponseSendOutcome::NoOp,
        Some(true) => ResponseSendOutcome::Ok,
        Some(false) => ResponseSendOutcome::Invalid,
    }
}
