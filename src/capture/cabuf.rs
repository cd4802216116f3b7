//! Process-wide ring of captured packets (spec.md glossary, "cabuf").
//! Generalized here to own the decoded packets directly rather than raw
//! pointers into an external arena: nothing about a captured packet's
//! bytes crosses a process boundary in this crate (only export records
//! do, via FLUSH), so there's no pointer/offset hazard to design around.

use crate::packet::OwnedPacket;

/// One capture iteration's merged output: a contiguous run starting at
/// `start`, plus the possible wrap-around split described in spec.md
/// section 4.3 ("exposes it as (pkts0, len0) and optional (pkts1, len1)
/// for wrap").
#[derive(Debug, Clone, Copy, Default)]
pub struct Batch {
    pub start: usize,
    pub len0: usize,
    pub len1: usize,
}

impl Batch {
    pub fn total(&self) -> usize {
        self.len0 + self.len1
    }
}

pub struct CaBuf {
    slots: Vec<Option<OwnedPacket>>,
    write: usize,
}

impl CaBuf {
    pub fn new(capacity: usize) -> CaBuf {
        assert!(capacity > 0);
        CaBuf { slots: (0..capacity).map(|_| None).collect(), write: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Writes `pkts` starting at the current write cursor, wrapping as
    /// needed, and returns the batch descriptor covering them.
    pub fn push_batch(&mut self, pkts: Vec<OwnedPacket>) -> Batch {
        let cap = self.capacity();
        assert!(pkts.len() <= cap, "batch larger than cabuf capacity");
        let start = self.write;
        let first = (cap - start).min(pkts.len());
        let mut iter = pkts.into_iter();
        for i in 0..first {
            self.slots[start + i] = Some(iter.next().unwrap());
        }
        let rest = iter.len();
        for i in 0..rest {
            self.slots[i] = Some(iter.next().unwrap());
        }
        self.write = (start + first + rest) % cap;
        Batch { start, len0: first, len1: rest }
    }

    /// The two contiguous runs making up `batch`, in logical order.
    fn view(&self, batch: Batch) -> (&[Option<OwnedPacket>], &[Option<OwnedPacket>]) {
        let run0 = &self.slots[batch.start..batch.start + batch.len0];
        let run1 = if batch.len1 > 0 { &self.slots[..batch.len1] } else { &[] };
        (run0, run1)
    }

    pub fn iter_batch(&self, batch: Batch) -> impl Iterator<Item = &OwnedPacket> {
        let (a, b) = self.view(batch);
        a.iter().chain(b.iter()).filter_map(|p| p.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketHeader, Timestamp};

    fn pkt(secs: u32) -> OwnedPacket {
        OwnedPacket::new(PacketHeader::new(Timestamp::new(secs, 0), 64, 64), vec![])
    }

    #[test]
    fn wrap_around_batch_sums_to_total_and_stays_ordered() {
        let mut cabuf = CaBuf::new(8);
        let first = cabuf.push_batch((1..=5).map(pkt).collect());
        assert_eq!(first.total(), 5);
        assert_eq!((first.len0, first.len1), (5, 0));

        let second = cabuf.push_batch((6..=9).map(pkt).collect());
        assert_eq!(second.total(), 4);
        assert_eq!(second.len0 + second.len1, 4);
        assert!(second.len1 > 0, "second batch should wrap given cabuf size 8");

        let ts: Vec<u32> = cabuf.iter_batch(second).map(|p| p.header.ts.secs).collect();
        let mut sorted = ts.clone();
        sorted.sort_unstable();
        assert_eq!(ts, sorted, "wrapped batch must stay timestamp-ordered");
    }
}
