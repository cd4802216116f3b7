//! Per-sniffer staging ring for newly captured packets, consumed by the
//! batch merge (spec.md section 4.3, "Ingest and merging").

use std::collections::VecDeque;

use crate::packet::{OwnedPacket, Timestamp};

pub struct PpBuf {
    capacity: usize,
    queue: VecDeque<OwnedPacket>,
    /// Packets dropped because the ring was already full when the sniffer
    /// tried to push (spec.md section 7: "may drop (drop count attributed
    /// to the sniffer)").
    pub drops: u64,
}

impl PpBuf {
    pub fn new(capacity: usize) -> PpBuf {
        assert!(capacity > 0);
        PpBuf { capacity, queue: VecDeque::with_capacity(capacity), drops: 0 }
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn push(&mut self, pkt: OwnedPacket) {
        if self.is_full() {
            self.drops += 1;
            return;
        }
        self.queue.push_back(pkt);
    }

    pub fn peek_head_ts(&self) -> Option<Timestamp> {
        self.queue.front().map(|p| p.header.ts)
    }

    pub fn peek_last_ts(&self) -> Option<Timestamp> {
        self.queue.back().map(|p| p.header.ts)
    }

    pub fn pop(&mut self) -> Option<OwnedPacket> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketHeader;

    fn pkt(secs: u32) -> OwnedPacket {
        OwnedPacket::new(PacketHeader::new(Timestamp::new(secs, 0), 64, 64), vec![0u8; 8])
    }

    #[test]
    fn push_past_capacity_counts_as_a_drop() {
        let mut buf = PpBuf::new(2);
        buf.push(pkt(1));
        buf.push(pkt(2));
        buf.push(pkt(3));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.drops, 1);
    }

    #[test]
    fn pop_returns_fifo_order() {
        let mut buf = PpBuf::new(4);
        buf.push(pkt(1));
        buf.push(pkt(2));
        assert_eq!(buf.pop().unwrap().header.ts, Timestamp::new(1, 0));
        assert_eq!(buf.pop().unwrap().header.ts, Timestamp::new(2, 0));
        assert!(buf.pop().is_none());
    }
}
