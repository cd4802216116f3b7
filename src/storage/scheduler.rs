//! The storage scheduler (spec.md section 4.2): runs on an idle tick and
//! on any state-changing operation. Step 1 (closing/truncating a file the
//! writer has rolled past) happens inline in
//! `Bytestream::writer_region`'s rollover path, since that's the only
//! point a file is ever "finished with" on the write side; this module
//! covers the remaining three duties plus the deferred munmap of regions
//! the write path has released.

use super::engine::StorageEngine;
use super::region::Region;

/// Regions queued for unmap on the next tick rather than synchronously on
/// the hot write path (the "mmap lifecycle" design note in spec.md section
/// 9). Dropping a `Region` unmaps it, so draining this is just clearing
/// the vec.
#[derive(Default)]
pub struct WriteBuffer {
    pending: Vec<Region>,
}

impl WriteBuffer {
    pub fn new() -> WriteBuffer {
        WriteBuffer::default()
    }

    pub fn queue(&mut self, region: Region) {
        self.pending.push(region);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// One scheduler sweep: drains queued write regions (step 1's munmap
    /// half), then drives the engine's size-bound eviction and idle-client
    /// reap (steps 2-4). Returns the client ids reaped for idle timeout so
    /// the transport layer can drop their connections.
    pub fn tick(&mut self, engine: &mut StorageEngine) -> Vec<u32> {
        self.pending.clear();
        engine.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempfile;

    #[test]
    fn queued_region_is_dropped_on_tick() {
        let mut file = tempfile().unwrap();
        file.set_len(4096).unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        let region = Region::map(&file, 0, 16, true).unwrap();

        let mut wb = WriteBuffer::new();
        wb.queue(region);
        assert_eq!(wb.pending_count(), 1);

        let mut engine = StorageEngine::new(std::env::temp_dir());
        wb.tick(&mut engine);
        assert_eq!(wb.pending_count(), 0);
    }
}
