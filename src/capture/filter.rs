//! The packet filter boundary (spec.md section 4.3, "Filter evaluation").
//! Filter *compilation* is out of scope (spec.md section 1); this module
//! only defines the trait a compiled filter tree must satisfy, plus two
//! trivial reference implementations so the pipeline is exercisable
//! without one.

use crate::packet::PacketView;

pub trait Filter: Send + Sync {
    fn matches(&self, pkt: &PacketView<'_>) -> bool;
}

/// Matches every packet. The module loader's default filter, and this
/// crate's stand-in wherever no real compiled filter is wired in.
pub struct PassAll;

impl Filter for PassAll {
    fn matches(&self, _pkt: &PacketView<'_>) -> bool {
        true
    }
}

/// Wraps an arbitrary predicate. Useful for tests and for modules whose
/// filter is simple enough not to need a compiled expression tree.
pub struct PredicateFilter<F>(pub F)
where
    F: Fn(&PacketView<'_>) -> bool + Send + Sync;

impl<F> Filter for PredicateFilter<F>
where
    F: Fn(&PacketView<'_>) -> bool + Send + Sync,
{
    fn matches(&self, pkt: &PacketView<'_>) -> bool {
        (self.0)(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketHeader, Timestamp};

    fn view(wire_len: u32) -> PacketView<'static> {
        PacketView {
            header: PacketHeader::new(Timestamp::ZERO, wire_len, wire_len),
            payload: &[],
        }
    }

    #[test]
    fn pass_all_matches_everything() {
        assert!(PassAll.matches(&view(64)));
    }

    #[test]
    fn predicate_filter_delegates() {
        let f = PredicateFilter(|pkt: &PacketView<'_>| pkt.header.wire_len > 100);
        assert!(!f.matches(&view(64)));
        assert!(f.matches(&view(200)));
    }
}
