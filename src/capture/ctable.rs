//! The capture hash table (spec.md glossary, "ctable"; section 4.3 "Per-
//! module processing"). Bucket-chained, keyed by the module-supplied
//! `hash()`, with `first_full`/`last_full` bookkeeping so a flush can walk
//! only the full-bucket subset without scanning every slot.

use crate::module::{ModuleOps, ModuleRecord};
use crate::packet::{PacketView, Timestamp};

struct Entry {
    hash: u32,
    full: bool,
    /// Chains to the next-older entry sharing this bucket, if any. A
    /// bucket's first_full/last_full fields (below) give the ends.
    next_in_bucket: Option<usize>,
    record: Box<dyn ModuleRecord>,
}

pub struct CaptureTable {
    buckets: Vec<Option<usize>>,
    entries: Vec<Entry>,
    records: usize,
    live_buckets: usize,
    /// Index of a full entry, threaded across buckets in allocation order,
    /// so a flush can walk "all full records" without scanning every bucket.
    first_full: Option<usize>,
    last_full: Option<usize>,
    full_chain: Vec<Option<usize>>,
    ivl: Timestamp,
    ts: Timestamp,
    flexible: bool,
}

impl CaptureTable {
    pub fn new(table_size: usize, ivl: Timestamp) -> CaptureTable {
        let size = table_size.next_power_of_two().max(1);
        CaptureTable {
            buckets: vec![None; size],
            entries: Vec::new(),
            records: 0,
            live_buckets: 0,
            first_full: None,
            last_full: None,
            full_chain: Vec::new(),
            ivl,
            ts: Timestamp::ZERO,
            flexible: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn ivl(&self) -> Timestamp {
        self.ivl
    }

    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    pub fn set_ts(&mut self, ts: Timestamp) {
        self.ts = ts;
    }

    pub fn flexible(&self) -> bool {
        self.flexible
    }

    pub fn set_flexible(&mut self, flexible: bool) {
        self.flexible = flexible;
    }

    fn bucket_index(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn link_full(&mut self, idx: usize) {
        self.full_chain[idx] = None;
        match self.last_full {
            Some(last) => self.full_chain[last] = Some(idx),
            None => self.first_full = Some(idx),
        }
        self.last_full = Some(idx);
    }

    /// Runs one packet through check/hash/bucket-walk/match/update, per the
    /// state machine in spec.md section 4.3. Returns whether the module's
    /// `check` accepted the packet at all (a `false` here means the module
    /// never saw it, distinct from "saw it, record already full").
    pub fn process(&mut self, pkt: &PacketView<'_>, ops: &dyn ModuleOps) -> bool {
        if !ops.check(pkt) {
            return false;
        }
        let hash = ops.hash(pkt);
        let bucket = self.bucket_index(hash);

        let mut walk = self.buckets[bucket];
        let mut first_non_full: Option<usize> = None;
        let mut matched_full = false;
        while let Some(idx) = walk {
            let matched = ops.match_record(pkt, self.entries[idx].record.as_ref());
            if matched {
                if self.entries[idx].full {
                    matched_full = true;
                } else {
                    first_non_full = Some(idx);
                }
                break;
            }
            walk = self.entries[idx].next_in_bucket;
        }

        if let Some(idx) = first_non_full {
            let full = ops.update(pkt, self.entries[idx].record.as_mut(), false);
            if full {
                self.entries[idx].full = true;
                self.link_full(idx);
            }
            return true;
        }

        // Either a full match (chain a fresh record for the same key
        // without counting it as a new distinct record) or a truly
        // absent key (allocate and count it). Either way the new entry
        // becomes the bucket head, chained onto whatever was there.
        let was_empty = self.buckets[bucket].is_none();
        let mut record = ops.new_record();
        let full = ops.update(pkt, record.as_mut(), true);
        let idx = self.entries.len();
        self.entries.push(Entry { hash, full, next_in_bucket: self.buckets[bucket], record });
        self.full_chain.push(None);
        self.buckets[bucket] = Some(idx);
        if !matched_full {
            self.records += 1;
        }
        if was_empty {
            self.live_buckets += 1;
        }
        if full {
            self.link_full(idx);
        }
        true
    }

    /// Drains every record, paired with the hash it was filed under so the
    /// export stage can reuse it as its own bucket key (spec.md section 3
    /// documents the 32-bit hash as part of the record header, so this
    /// reuses rather than invents a secondary key).
    pub fn drain_records(&mut self) -> Vec<(u32, Box<dyn ModuleRecord>)> {
        let entries = std::mem::take(&mut self.entries);
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.full_chain.clear();
        self.first_full = None;
        self.last_full = None;
        self.records = 0;
        self.live_buckets = 0;
        entries.into_iter().map(|e| (e.hash, e.record)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketHeader;

    struct SumMod;

    impl ModuleOps for SumMod {
        fn name(&self) -> &str {
            "sum"
        }
        fn new_record(&self) -> Box<dyn ModuleRecord> {
            Box::new(0u64)
        }
        fn hash(&self, pkt: &PacketView<'_>) -> u32 {
            pkt.header.wire_len % 4
        }
        fn update(&self, pkt: &PacketView<'_>, rec: &mut dyn ModuleRecord, _is_new: bool) -> bool {
            let v = rec.as_any_mut().downcast_mut::<u64>().unwrap();
            *v += pkt.header.wire_len as u64;
            *v >= 100
        }
        fn action(&self, _rec: Option<&dyn ModuleRecord>, _ts: Timestamp, _count: usize) -> crate::export::action::ActionFlags {
            crate::export::action::ActionFlags::GO
        }
        fn store(&self, _rec: &dyn ModuleRecord, _buf: &mut [u8]) -> isize {
            0
        }
        fn load(&self, _buf: &[u8]) -> Option<(usize, Timestamp)> {
            None
        }
    }

    fn view(wire_len: u32) -> PacketView<'static> {
        PacketView { header: PacketHeader::new(Timestamp::ZERO, wire_len, wire_len), payload: &[] }
    }

    #[test]
    fn same_hash_bucket_accumulates_into_one_record() {
        let mut table = CaptureTable::new(8, Timestamp::new(60, 0));
        let ops = SumMod;
        table.process(&view(4), &ops);
        table.process(&view(8), &ops);
        assert_eq!(table.records(), 1);
        let recs = table.drain_records();
        assert_eq!(recs.len(), 1);
        let (hash, rec) = &recs[0];
        assert_eq!(*hash, 0);
        assert_eq!(*rec.as_any().downcast_ref::<u64>().unwrap(), 12);
    }

    #[test]
    fn a_full_record_gets_chained_not_overwritten() {
        let mut table = CaptureTable::new(8, Timestamp::new(60, 0));
        let ops = SumMod;
        table.process(&view(100), &ops); // fills immediately
        table.process(&view(4), &ops); // same bucket (hash 0), must not match full
        assert_eq!(table.records(), 2);
    }

    #[test]
    fn drain_resets_table_to_empty() {
        let mut table = CaptureTable::new(8, Timestamp::new(60, 0));
        let ops = SumMod;
        table.process(&view(4), &ops);
        assert!(!table.is_empty());
        let _ = table.drain_records();
        assert!(table.is_empty());
        assert_eq!(table.live_buckets, 0);
    }
}
