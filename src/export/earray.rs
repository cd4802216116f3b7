//! The export array (spec.md glossary, "earray"): dense storage for
//! aggregated export records, kept front-compacted by `store_records` so
//! the hottest records stay cheap to scan (spec.md section 4.4).

use crate::module::ModuleRecord;

#[derive(Default)]
pub struct ExportArray {
    records: Vec<(u32, Box<dyn ModuleRecord>)>,
}

impl ExportArray {
    pub fn new() -> ExportArray {
        ExportArray { records: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, hash: u32, rec: Box<dyn ModuleRecord>) -> usize {
        self.records.push((hash, rec));
        self.records.len() - 1
    }

    pub fn get(&self, idx: usize) -> &dyn ModuleRecord {
        self.records[idx].1.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut dyn ModuleRecord {
        self.records[idx].1.as_mut()
    }

    pub fn hash_at(&self, idx: usize) -> u32 {
        self.records[idx].0
    }

    /// Moves the record at `idx` to the front, keeping the rest in order
    /// (spec.md section 4.4: "move it to the front of the earray").
    pub fn move_to_front(&mut self, idx: usize) {
        if idx == 0 {
            return;
        }
        self.records[..=idx].rotate_right(1);
    }

    /// Removes the record at `idx`. Breaks ordering (the last record takes
    /// its slot), which is fine: the etable is rebuilt after every sweep.
    pub fn discard(&mut self, idx: usize) {
        self.records.swap_remove(idx);
    }

    pub fn sort_by<F>(&mut self, mut cmp: F)
    where
        F: FnMut(&dyn ModuleRecord, &dyn ModuleRecord) -> std::cmp::Ordering,
    {
        self.records.sort_by(|a, b| cmp(a.1.as_ref(), b.1.as_ref()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ModuleRecord> {
        self.records.iter().map(|(_, r)| r.as_ref())
    }

    /// Exposes `(hash, record)` pairs so the etable can rebuild its bucket
    /// index from scratch after a sweep.
    pub fn raw_iter(&self) -> impl Iterator<Item = &(u32, Box<dyn ModuleRecord>)> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_keeps_prefix_contiguous() {
        let mut arr = ExportArray::new();
        arr.push(1, Box::new(10u64));
        arr.push(2, Box::new(20u64));
        arr.push(3, Box::new(30u64));
        arr.discard(0);
        assert_eq!(arr.len(), 2);
        let vals: Vec<u64> = arr.iter().map(|r| *r.as_any().downcast_ref::<u64>().unwrap()).collect();
        assert_eq!(vals.len(), 2);
        assert!(vals.contains(&20));
        assert!(vals.contains(&30));
    }

    #[test]
    fn move_to_front_preserves_remaining_order() {
        let mut arr = ExportArray::new();
        arr.push(1, Box::new(10u64));
        arr.push(2, Box::new(20u64));
        arr.push(3, Box::new(30u64));
        arr.move_to_front(2);
        let vals: Vec<u64> = arr.iter().map(|r| *r.as_any().downcast_ref::<u64>().unwrap()).collect();
        assert_eq!(vals, vec![30, 10, 20]);
    }
}
