//! The shared allocator (spec.md section 4.1): a single process-wide
//! mmap-backed slab hosting all cross-process sharing, with size-indexed
//! free lists (`MemList`) scoped per module ("map").
//!
//! Bookkeeping metadata (block size, in-use flag, free-list links) lives
//! outside the slab in ordinary process memory, exactly as spec.md directs
//! ("Bookkeeping metadata lives outside the slab; block data lives
//! inside"); only the user bytes live in the mmap region. Offsets into the
//! slab, not pointers, are what cross an IPC boundary (design note in
//! spec.md section 9), which is why `alloc`/`free` operate on `u64`
//! offsets rather than raw pointers.

mod memlist;
mod slab;

pub use memlist::MemList;
pub use slab::Slab;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Sentinel meaning "no block" in a free-list link or slot head.
pub const NONE: u64 = u64::MAX;

/// Below this many spare bytes, a candidate block is handed out whole
/// rather than split (matches the "`MIN_SIZE + header`" threshold in
/// spec.md section 4.1, with `header` sized to this allocator's external
/// bookkeeping entry).
pub const MIN_SIZE: usize = 16;

/// Process-wide allocator state: the slab plus usage/peak counters. There
/// is exactly one of these per process; capture and export each hold a
/// handle constructed over the same backing mmap region (conceptually --
/// within a single OS process this crate models both sides with the same
/// `SharedAllocator`, since the crate cannot literally fork two processes
/// sharing one mapping and stay portable for tests).
pub struct SharedAllocator {
    slab: Mutex<Slab>,
    peak: AtomicUsize,
}

impl SharedAllocator {
    /// `memory_init(mb)`: reserves `mb` mebibytes of shared slab.
    pub fn memory_init(mb: usize) -> std::io::Result<Self> {
        let slab = Slab::new(mb * 1024 * 1024)?;
        Ok(SharedAllocator {
            slab: Mutex::new(slab),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn new_memlist(&self, bounded_capacity: Option<usize>) -> MemList {
        MemList::new(bounded_capacity)
    }

    pub fn alloc(&self, map: &mut MemList, size: usize) -> Option<u64> {
        let mut slab = self.slab.lock().unwrap();
        let result = slab.alloc(map, size);
        if result.is_some() {
            let used = slab.used();
            self.peak.fetch_max(used, Ordering::Relaxed);
        }
        result
    }

    pub fn free(&self, map: &mut MemList, offset: u64) {
        let mut slab = self.slab.lock().unwrap();
        slab.free(map, offset);
    }

    /// `merge_maps(dst, src) -> bytes_recovered`: returns free lists from
    /// `src` into `dst`, emptying `src`.
    pub fn merge_maps(&self, dst: &mut MemList, src: &mut MemList) -> usize {
        let slab = self.slab.lock().unwrap();
        slab.merge_maps(dst, src)
    }

    pub fn memory_usage(&self) -> usize {
        self.slab.lock().unwrap().used()
    }

    pub fn memory_peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.slab.lock().unwrap().capacity()
    }

    /// Reads the user bytes of an in-use block (for tests and `store`'s
    /// retry-on-grow path, which must copy already-written bytes forward
    /// into a newly (re)mapped window).
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        self.slab.lock().unwrap().read(offset, len)
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        self.slab.lock().unwrap().write(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_alloc_may_reuse_same_offset() {
        let alc = SharedAllocator::memory_init(1).unwrap();
        let mut map = alc.new_memlist(None);

        let a = alc.alloc(&mut map, 64).unwrap();
        alc.free(&mut map, a);
        let b = alc.alloc(&mut map, 64).unwrap();
        // May coincide; must not panic and must not alias anything else.
        let c = alc.alloc(&mut map, 64).unwrap();
        assert_ne!(b, c);
        let _ = a;
    }

    #[test]
    fn memory_usage_tracks_outstanding_allocations() {
        let alc = SharedAllocator::memory_init(1).unwrap();
        let mut map = alc.new_memlist(None);
        let before = alc.memory_usage();
        let p = alc.alloc(&mut map, 4096).unwrap();
        assert!(alc.memory_usage() >= before + 4096);
        alc.free(&mut map, p);
    }

    #[test]
    fn merge_maps_recovers_all_bytes_individually_inserted_would() {
        let alc = SharedAllocator::memory_init(1).unwrap();
        let mut dst = alc.new_memlist(None);
        let mut src = alc.new_memlist(None);

        let mut offsets = Vec::new();
        for _ in 0..8 {
            offsets.push(alc.alloc(&mut src, 128).unwrap());
        }
        for o in &offsets {
            alc.free(&mut src, *o);
        }

        let recovered = alc.merge_maps(&mut dst, &mut src);
        assert_eq!(recovered, 8 * 128);

        // dst can now satisfy the same allocations src used to serve.
        for _ in 0..8 {
            assert!(alc.alloc(&mut dst, 128).is_some());
        }
    }

    #[test]
    fn exhaustion_returns_none_without_panicking() {
        let alc = SharedAllocator::memory_init(1).unwrap();
        let mut map = alc.new_memlist(None);
        let mut got_none = false;
        for _ in 0..100_000 {
            if alc.alloc(&mut map, 4096).is_none() {
                got_none = true;
                break;
            }
        }
        assert!(got_none, "expected exhaustion on a 1 MiB slab");
    }
}
