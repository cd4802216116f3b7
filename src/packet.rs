//! Packet records and the NTP-like timestamp used throughout the pipeline.

use std::cmp::Ordering;
use std::fmt;

/// A 64-bit NTP-like timestamp: high 32 bits are whole seconds, low 32 bits
/// are the fractional part of a second (in units of 1/2^32 s).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub secs: u32,
    pub frac: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, frac: 0 };

    pub fn new(secs: u32, frac: u32) -> Self {
        Timestamp { secs, frac }
    }

    /// Build a timestamp from a whole number of microseconds since the
    /// epoch (a convenience used heavily by tests and the reference
    /// sniffer, where fractional precision beyond microseconds is unused).
    pub fn from_micros(us: u64) -> Self {
        let secs = (us / 1_000_000) as u32;
        let rem_us = us % 1_000_000;
        // frac = rem_us / 1e6 * 2^32
        let frac = ((rem_us << 32) / 1_000_000) as u32;
        Timestamp { secs, frac }
    }

    pub fn is_zero(&self) -> bool {
        self.secs == 0 && self.frac == 0
    }

    /// Packs into the single `u64` used for comparisons and wire encoding.
    pub fn as_u64(&self) -> u64 {
        ((self.secs as u64) << 32) | self.frac as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Timestamp {
            secs: (v >> 32) as u32,
            frac: v as u32,
        }
    }

    /// Floor this timestamp to the start of the `ivl`-second interval it
    /// falls in: `ts - (ts mod ivl)`, operating on whole seconds as the
    /// source does (sub-second flush intervals are not supported).
    pub fn floor_to_interval(&self, ivl_secs: u32) -> Timestamp {
        if ivl_secs == 0 {
            return *self;
        }
        Timestamp::new(self.secs - (self.secs % ivl_secs), 0)
    }

    pub fn checked_add_secs(&self, secs: u32) -> Option<Timestamp> {
        self.secs.checked_add(secs).map(|s| Timestamp::new(s, self.frac))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_u64().cmp(&other.as_u64())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, (self.frac as u64 * 1_000_000) >> 32)
    }
}

/// Coarse CoMo-level type tag, set by the sniffer at ingest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ComoType {
    None = 0,
    Link = 1,
    NetFlow = 2,
    SFlow = 3,
    Radio = 4,
}

/// L2/L3/L4 protocol tags. Values deliberately small; modules only ever
/// compare them, never interpret them as an exhaustive enum.
pub type L2Type = u16;
pub type L3Type = u16;
pub type L4Type = u16;

/// Fixed metadata header carried by every packet record, as per spec.md
/// section 3 ("Packet record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub ts: Timestamp,
    pub wire_len: u32,
    pub caplen: u32,
    pub como_type: ComoType,
    pub l2_type: L2Type,
    pub l3_type: L3Type,
    pub l4_type: L4Type,
    pub l2_off: u16,
    pub l3_off: u16,
    pub l4_off: u16,
    pub l7_off: u16,
}

impl PacketHeader {
    pub fn new(ts: Timestamp, wire_len: u32, caplen: u32) -> Self {
        PacketHeader {
            ts,
            wire_len,
            caplen,
            como_type: ComoType::Link,
            l2_type: 0,
            l3_type: 0,
            l4_type: 0,
            l2_off: 0,
            l3_off: 0,
            l4_off: 0,
            l7_off: 0,
        }
    }
}

/// An owned packet: the header plus captured bytes. Used for packets that
/// outlive the capture ring (replay, on-demand query synthesis, tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl OwnedPacket {
    pub fn new(header: PacketHeader, payload: Vec<u8>) -> Self {
        OwnedPacket { header, payload }
    }

    pub fn as_view(&self) -> PacketView<'_> {
        PacketView {
            header: self.header,
            payload: &self.payload,
        }
    }
}

/// A borrowed view into a packet living in the capture ring (`cabuf`).
/// This is what filter evaluation and module callbacks actually see during
/// a capture iteration: zero-copy into the ring.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn ts(&self) -> Timestamp {
        self.header.ts
    }

    pub fn to_owned(&self) -> OwnedPacket {
        OwnedPacket::new(self.header, self.payload.to_vec())
    }
}

impl OwnedPacket {
    /// Minimal self-delimiting wire form for the `como` query output format
    /// (spec.md section 4.5): big-endian timestamp, wire length, payload
    /// length, then the payload itself. Nothing upstream specifies a grammar
    /// for this stream, so this is the crate's own.
    pub fn encode_como(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header.ts.as_u64().to_be_bytes());
        out.extend_from_slice(&self.header.wire_len.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering_matches_packed_u64() {
        let a = Timestamp::new(10, 5);
        let b = Timestamp::new(10, 6);
        let c = Timestamp::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, Timestamp::from_u64(a.as_u64()));
    }

    #[test]
    fn floor_to_interval_brackets_timestamp() {
        let ts = Timestamp::new(125, 4242);
        let floored = ts.floor_to_interval(60);
        assert_eq!(floored.secs, 120);
        assert!(floored <= ts);
        assert!(floored.checked_add_secs(60).unwrap() > ts);
    }

    #[test]
    fn from_micros_round_trips_seconds() {
        let ts = Timestamp::from_micros(1_700_000_000_500_000);
        assert_eq!(ts.secs, 1_700_000_000);
    }
}
