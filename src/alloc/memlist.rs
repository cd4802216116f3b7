//! `MemList`: a per-module (or global) allocator scope. Entry 0 is a
//! catch-all overflow list; entries `1..first_free` are exact-size free
//! lists, per spec.md section 3 ("Shared map / memlist").
//!
//! The free-list links themselves are kept in ordinary process memory
//! (a `Vec<u64>` of free offsets per size class) rather than threaded
//! through in-slab headers, since spec.md already places *all* bookkeeping
//! metadata outside the slab.

struct SizeClass {
    size: usize,
    free: Vec<u64>,
}

pub struct MemList {
    /// `None` = global/reallocable map: the indexed slot array grows
    /// without a fixed ceiling (mirroring `Vec`'s own doubling growth).
    /// `Some(n)` = bounded map: at most `n` distinct dedicated size
    /// classes; anything beyond that overflows into the catch-all list.
    bounded_capacity: Option<usize>,
    slots: Vec<SizeClass>,
    /// Slot 0: catch-all overflow, mixed sizes.
    overflow: Vec<(u64, usize)>,
}

impl MemList {
    pub fn new(bounded_capacity: Option<usize>) -> MemList {
        MemList {
            bounded_capacity,
            slots: Vec::new(),
            overflow: Vec::new(),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded_capacity.is_some()
    }

    /// Exact-size match, the first preference in spec.md's `alloc` walk.
    pub fn take_exact(&mut self, size: usize) -> Option<u64> {
        let idx = self.slots.iter().position(|s| s.size == size)?;
        self.take_from_slot(idx)
    }

    /// Smallest indexed block strictly larger than `size` ("best-fit among
    /// indexed slots").
    pub fn take_best_fit(&mut self, size: usize) -> Option<u64> {
        let idx = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.size > size && !s.free.is_empty())
            .min_by_key(|(_, s)| s.size)
            .map(|(i, _)| i)?;
        self.take_from_slot(idx)
    }

    /// Falls back to the overflow list for anything big enough, first-fit,
    /// since overflow blocks carry no size-class index to best-fit within.
    pub fn take_from_overflow(&mut self, size: usize) -> Option<u64> {
        let idx = self.overflow.iter().position(|(_, s)| *s >= size)?;
        let (offset, _) = self.overflow.swap_remove(idx);
        Some(offset)
    }

    fn take_from_slot(&mut self, idx: usize) -> Option<u64> {
        let offset = self.slots[idx].free.pop()?;
        if self.slots[idx].free.is_empty() {
            // "if a slot empties, swap it with the last slot"
            self.slots.swap_remove(idx);
        }
        Some(offset)
    }

    /// Inserts a freed block back into the map, per spec.md's "Map
    /// insertion" rule.
    pub fn insert_free(&mut self, offset: u64, size: usize) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.size == size) {
            slot.free.push(offset);
            return;
        }

        let at_capacity = self
            .bounded_capacity
            .map(|cap| self.slots.len() >= cap)
            .unwrap_or(false);

        if at_capacity {
            self.overflow.push((offset, size));
        } else {
            self.slots.push(SizeClass {
                size,
                free: vec![offset],
            });
        }
    }

    /// Concatenates `src`'s free lists into `self` by size class, falling
    /// back to per-block insertion for anything that doesn't line up
    /// (overflow entries, or size classes that don't already exist in
    /// `self` and would exceed a bounded capacity). Returns total bytes
    /// recovered.
    pub fn merge_from(&mut self, src: &mut MemList) -> usize {
        let mut recovered = 0usize;

        for slot in src.slots.drain(..) {
            recovered += slot.size * slot.free.len();
            if let Some(existing) = self.slots.iter_mut().find(|s| s.size == slot.size) {
                existing.free.extend(slot.free);
            } else {
                for offset in slot.free {
                    self.insert_free(offset, slot.size);
                }
            }
        }

        for (offset, size) in src.overflow.drain(..) {
            recovered += size;
            self.insert_free(offset, size);
        }

        recovered
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_map_overflows_past_capacity() {
        let mut map = MemList::new(Some(2));
        map.insert_free(0, 64);
        map.insert_free(100, 128);
        assert_eq!(map.slot_count(), 2);
        map.insert_free(300, 256);
        // Third distinct size class overflows rather than growing past cap.
        assert_eq!(map.slot_count(), 2);
        assert!(map.take_from_overflow(200).is_some());
    }

    #[test]
    fn exact_match_preferred_over_best_fit() {
        let mut map = MemList::new(None);
        map.insert_free(0, 64);
        map.insert_free(100, 128);
        assert_eq!(map.take_exact(64), Some(0));
        assert_eq!(map.take_best_fit(64), Some(100));
    }

    #[test]
    fn emptied_slot_is_swap_removed() {
        let mut map = MemList::new(None);
        map.insert_free(0, 64);
        map.insert_free(100, 128);
        assert_eq!(map.slot_count(), 2);
        map.take_exact(64);
        assert_eq!(map.slot_count(), 1);
    }
}
