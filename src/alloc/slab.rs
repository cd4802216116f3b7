//! The process-wide mmap-backed byte pool and its out-of-band block
//! bookkeeping, per spec.md section 4.1.

use std::collections::HashMap;
use std::io;

use super::memlist::MemList;
use super::MIN_SIZE;

#[derive(Clone, Copy)]
struct BlockHeader {
    size: usize,
    in_use: bool,
}

pub struct Slab {
    base: *mut libc::c_void,
    len: usize,
    /// Bump pointer into never-before-carved space.
    top: u64,
    /// Offset -> header, for every block ever carved (free or in-use).
    /// Lives in ordinary process memory, not inside the mmap region.
    blocks: HashMap<u64, BlockHeader>,
    used: usize,
}

// The slab is only ever accessed behind `SharedAllocator`'s mutex.
unsafe impl Send for Slab {}

impl Slab {
    pub fn new(len: usize) -> io::Result<Slab> {
        let len = len.max(page_size::get());
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Slab {
            base,
            len,
            top: 0,
            blocks: HashMap::new(),
            used: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn carve(&mut self, size: usize) -> Option<u64> {
        let offset = self.top;
        if offset as usize + size > self.len {
            return None;
        }
        self.top += size as u64;
        self.blocks.insert(offset, BlockHeader { size, in_use: false });
        Some(offset)
    }

    /// `alloc(map, size)`: best-fit among `map`'s indexed free lists,
    /// splitting the remainder back into the map when it is worth keeping.
    pub fn alloc(&mut self, map: &mut MemList, size: usize) -> Option<u64> {
        let size = size.max(1);

        let chosen = map
            .take_exact(size)
            .or_else(|| map.take_best_fit(size))
            .or_else(|| map.take_from_overflow(size))
            .or_else(|| self.carve(size.max(MIN_SIZE)));

        let offset = chosen?;
        let block_size = self.blocks[&offset].size;

        let remainder = block_size.saturating_sub(size);
        if remainder >= MIN_SIZE + 8 {
            // Split: shrink the chosen block to exactly `size` and carve a
            // fresh free block out of the tail, reinserted into the map.
            let tail_offset = offset + size as u64;
            self.blocks.get_mut(&offset).unwrap().size = size;
            self.blocks.insert(
                tail_offset,
                BlockHeader {
                    size: remainder,
                    in_use: false,
                },
            );
            map.insert_free(tail_offset, remainder);
        }

        let hdr = self.blocks.get_mut(&offset).unwrap();
        hdr.in_use = true;
        self.used += hdr.size;
        self.zero(offset, hdr.size);
        Some(offset)
    }

    /// `free(map, offset)`: validates the pointer, flips it back to free
    /// and reinserts it into `map`.
    pub fn free(&mut self, map: &mut MemList, offset: u64) {
        let hdr = match self.blocks.get_mut(&offset) {
            Some(h) if h.in_use => h,
            _ => {
                // Pointer validation failure is fatal per spec.md section
                // 4.1; the crate surfaces this as a panic rather than
                // silently continuing, since the caller handed us a
                // corrupt or already-freed offset.
                panic!("free() on an offset that is not a live, in-use block: {}", offset);
            }
        };
        hdr.in_use = false;
        let size = hdr.size;
        self.used -= size;
        self.zero(offset, size);
        map.insert_free(offset, size);
    }

    pub fn merge_maps(&self, dst: &mut MemList, src: &mut MemList) -> usize {
        dst.merge_from(src)
    }

    fn zero(&mut self, offset: u64, len: usize) {
        unsafe {
            let ptr = (self.base as *mut u8).add(offset as usize);
            std::ptr::write_bytes(ptr, 0, len);
        }
    }

    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        unsafe {
            let ptr = (self.base as *const u8).add(offset as usize);
            std::slice::from_raw_parts(ptr, len).to_vec()
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        unsafe {
            let ptr = (self.base as *mut u8).add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}
