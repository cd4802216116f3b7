//! A mmap window inside one file of one bytestream (spec.md section 3,
//! "Region"). Mirrors the teacher crate's `Drop`-based munmap discipline
//! for its perf ring buffer mapping, generalized to page-aligned,
//! variably-sized windows.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

pub struct Region {
    base: *mut libc::c_void,
    map_len: usize,
    /// Offset within the mapped window where the caller's requested bytes
    /// actually start (mmap requires page-aligned offsets; this is the
    /// sub-page remainder).
    pub data_offset: usize,
    pub data_len: usize,
    pub writable: bool,
}

// A region is only ever owned by one client/the scheduler at a time, and
// its raw pointer is never read concurrently.
unsafe impl Send for Region {}

impl Region {
    /// Maps `len` bytes of `file` starting at `file_offset`, clipped to
    /// the file's current length for read-only regions.
    pub fn map(file: &File, file_offset: u64, len: usize, writable: bool) -> io::Result<Region> {
        let page = page_size::get() as u64;
        let aligned_start = (file_offset / page) * page;
        let data_offset = (file_offset - aligned_start) as usize;
        let map_len = data_offset + len;

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                aligned_start as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Region {
            base,
            map_len,
            data_offset,
            data_len: len,
            writable,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts((self.base as *const u8).add(self.data_offset), self.data_len)
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert!(self.writable);
        unsafe {
            std::slice::from_raw_parts_mut((self.base as *mut u8).add(self.data_offset), self.data_len)
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempfile;

    #[test]
    fn reader_region_sees_writer_bytes() {
        let mut file = tempfile().unwrap();
        file.write_all(&[0u8; 4096]).unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();

        let region = Region::map(&file, 4096, 5, false).unwrap();
        assert_eq!(region.as_slice(), b"hello");
    }

    #[test]
    fn writable_region_round_trips_writes() {
        let file = tempfile().unwrap();
        file.set_len(4096).unwrap();
        let mut region = Region::map(&file, 0, 16, true).unwrap();
        region.as_mut_slice().copy_from_slice(b"0123456789abcdef");
        assert_eq!(region.as_slice(), b"0123456789abcdef");
    }
}
