//! The bitmask returned by a module's `action` callback, used both for the
//! table-level policy check (`action(None, ts, 0)`) and the per-record
//! sweep decision (`action(Some(rec), ts, i)`), per spec.md section 4.4.

bitflags! {
    #[derive(Default)]
    pub struct ActionFlags: u32 {
        /// Persist the record via `store`.
        const STORE = 0b0000_0001;
        /// Like `STORE`, but more `store` calls are pending for this record
        /// before it is considered fully written (drives the retry loop).
        const STORE_BATCH = 0b0000_0010;
        /// Drop the record without persisting it; compact it out of the
        /// earray.
        const DISCARD = 0b0000_0100;
        /// Abort the sweep immediately.
        const STOP = 0b0000_1000;
        /// Table-level reply meaning "proceed with the sweep" (only valid
        /// as the return of `action(None, ts, 0)`).
        const GO = 0b0001_0000;
    }
}

/// `STORE_BATCH`'s wire encoding per spec.md section 4.4: the `store`
/// return value is offset by this constant to signal "more batches
/// pending" without needing a second out-of-band channel.
pub const ACT_STORE_BATCH: isize = 1 << 24;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_batch_is_distinguishable_from_store() {
        assert!(ActionFlags::STORE_BATCH != ActionFlags::STORE);
        assert!((ActionFlags::STORE | ActionFlags::STOP).contains(ActionFlags::STOP));
    }
}
