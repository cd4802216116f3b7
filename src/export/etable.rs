//! The export hash table (spec.md glossary, "etable"): a bucket index over
//! `ExportArray` slots, keyed by the same hash the capture side filed a
//! record under. Holds only indices, never a second copy of the record
//! (module records aren't `Clone`, and a dense array already owns them).

use crate::export::earray::ExportArray;
use crate::module::{ModuleOps, ModuleRecord};

struct Entry {
    next_in_bucket: Option<usize>,
    array_index: usize,
}

pub struct ExportTable {
    buckets: Vec<Option<usize>>,
    entries: Vec<Entry>,
}

impl ExportTable {
    pub fn new(table_size: usize) -> ExportTable {
        let size = table_size.next_power_of_two().max(1);
        ExportTable { buckets: vec![None; size], entries: Vec::new() }
    }

    fn bucket_index(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Walks the bucket chain for `hash` calling `ops.ematch` against each
    /// candidate, returning the matching earray index if any (spec.md
    /// section 4.4, "aggregated export path").
    pub fn find(
        &self,
        hash: u32,
        capture_rec: &dyn ModuleRecord,
        ops: &dyn ModuleOps,
        array: &ExportArray,
    ) -> Option<usize> {
        let bucket = self.bucket_index(hash);
        let mut walk = self.buckets[bucket];
        while let Some(idx) = walk {
            let entry = &self.entries[idx];
            if ops.ematch(array.get(entry.array_index), capture_rec) {
                return Some(entry.array_index);
            }
            walk = entry.next_in_bucket;
        }
        None
    }

    pub fn insert(&mut self, hash: u32, array_index: usize) {
        let bucket = self.bucket_index(hash);
        let idx = self.entries.len();
        self.entries.push(Entry { next_in_bucket: self.buckets[bucket], array_index });
        self.buckets[bucket] = Some(idx);
    }

    /// Rebuilds the whole bucket index from `array`. Cheaper and simpler to
    /// reason about than patching chains after `ExportArray::discard`'s
    /// swap-remove invalidates indices; called once per `store_records`
    /// sweep, after all discards for that sweep are done.
    pub fn rebuild(&mut self, array: &ExportArray) {
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.entries.clear();
        for (i, (hash, _)) in array.raw_iter().enumerate() {
            self.insert(*hash, i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::action::ActionFlags;
    use crate::packet::{PacketView, Timestamp};

    struct EqMod;

    impl ModuleOps for EqMod {
        fn name(&self) -> &str {
            "eq"
        }
        fn new_record(&self) -> Box<dyn ModuleRecord> {
            Box::new(0u64)
        }
        fn update(&self, _pkt: &PacketView<'_>, _rec: &mut dyn ModuleRecord, _is_new: bool) -> bool {
            false
        }
        fn ematch(&self, export_rec: &dyn ModuleRecord, capture_rec: &dyn ModuleRecord) -> bool {
            export_rec.as_any().downcast_ref::<u64>() == capture_rec.as_any().downcast_ref::<u64>()
        }
        fn action(&self, _rec: Option<&dyn ModuleRecord>, _ts: Timestamp, _count: usize) -> ActionFlags {
            ActionFlags::GO
        }
        fn store(&self, _rec: &dyn ModuleRecord, _buf: &mut [u8]) -> isize {
            0
        }
        fn load(&self, _buf: &[u8]) -> Option<(usize, Timestamp)> {
            None
        }
    }

    #[test]
    fn find_walks_bucket_chain_to_a_matching_record() {
        let mut array = ExportArray::new();
        array.push(5, Box::new(10u64));
        array.push(5, Box::new(20u64));
        let mut table = ExportTable::new(8);
        table.insert(5, 0);
        table.insert(5, 1);

        let ops = EqMod;
        let found = table.find(5, &20u64, &ops, &array);
        assert_eq!(found, Some(1));
        let missing = table.find(5, &99u64, &ops, &array);
        assert_eq!(missing, None);
    }

    #[test]
    fn rebuild_recovers_from_index_shift_after_discard() {
        let mut array = ExportArray::new();
        array.push(1, Box::new(10u64));
        array.push(2, Box::new(20u64));
        let mut table = ExportTable::new(8);
        table.rebuild(&array);
        array.discard(0); // swap_remove: index 1 (hash 2) moves into slot 0
        table.rebuild(&array);
        let ops = EqMod;
        assert_eq!(table.find(2, &20u64, &ops, &array), Some(0));
    }
}
