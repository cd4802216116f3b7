//! The export process's per-module sweep (spec.md section 4.4): absorb a
//! capture table's expired records (direct store, or aggregated match/
//! update into the earray/etable), then sweep the earray under each
//! record's `action` verdict, persisting via the storage service.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use crate::capture::ExpiredMap;
use crate::export::action::{ActionFlags, ACT_STORE_BATCH};
use crate::export::earray::ExportArray;
use crate::export::etable::ExportTable;
use crate::module::{ModuleDescriptor, ModuleOps, ModuleRecord};
use crate::packet::Timestamp;
use crate::storage::StorageClient;

/// Initial `store` scratch buffer size; doubled on a too-small signal.
const INITIAL_STORE_BUF: usize = 256;
/// Bound on buffer doublings, so a misbehaving module can't loop forever.
const MAX_STORE_DOUBLINGS: u32 = 16;

pub struct ExportModuleState {
    descriptor: Arc<ModuleDescriptor>,
    array: ExportArray,
    table: ExportTable,
    writer: Option<StorageClient>,
    offset: u64,
}

impl ExportModuleState {
    pub fn new(descriptor: Arc<ModuleDescriptor>, writer: Option<StorageClient>, start_offset: u64) -> Self {
        let table_size = descriptor.ex_table_size;
        ExportModuleState { descriptor, array: ExportArray::new(), table: ExportTable::new(table_size), writer, offset: start_offset }
    }

    /// Feeds expired capture records into the earray, via the aggregated
    /// match/update path if the module declares `export`, else directly to
    /// storage/stdout (spec.md section 4.4).
    pub fn absorb(&mut self, records: Vec<(u32, Box<dyn ModuleRecord>)>, inline: bool, stdout: &mut impl Write) {
        let ops = Arc::clone(&self.descriptor.ops);
        if ops.has_export() {
            for (hash, capture_rec) in records {
                match self.table.find(hash, capture_rec.as_ref(), ops.as_ref(), &self.array) {
                    Some(idx) => {
                        ops.export(self.array.get_mut(idx), capture_rec.as_ref(), false);
                        self.array.move_to_front(idx);
                    }
                    None => {
                        let mut export_rec = ops.new_record();
                        ops.export(export_rec.as_mut(), capture_rec.as_ref(), true);
                        let idx = self.array.push(hash, export_rec);
                        self.table.insert(hash, idx);
                    }
                }
            }
        } else {
            for (_, rec) in records {
                if inline {
                    print_inline(rec.as_ref(), ops.as_ref(), stdout);
                } else {
                    write_record(&mut self.writer, &mut self.offset, rec.as_ref(), ops.as_ref());
                }
            }
        }
    }

    /// Sweeps the earray under the module's `action` verdicts, persisting
    /// or discarding each record, then rebuilds the etable now that indices
    /// may have shifted (spec.md section 4.4, "store_records").
    pub fn store_records(&mut self, ts: Timestamp, inline: bool, stdout: &mut impl Write) {
        let ops = Arc::clone(&self.descriptor.ops);
        let table_verdict = ops.action(None, ts, 0);
        if !table_verdict.contains(ActionFlags::GO) {
            return;
        }

        if ops.has_compare() {
            self.array.sort_by(|a, b| {
                ops.compare(a, b).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let mut i = 0;
        while i < self.array.len() {
            let verdict = ops.action(Some(self.array.get(i)), ts, i);
            if verdict.contains(ActionFlags::STOP) {
                break;
            }
            if verdict.contains(ActionFlags::DISCARD) {
                self.array.discard(i);
                continue;
            }
            if verdict.contains(ActionFlags::STORE) || verdict.contains(ActionFlags::STORE_BATCH) {
                if inline {
                    print_inline(self.array.get(i), ops.as_ref(), stdout);
                } else {
                    write_record(&mut self.writer, &mut self.offset, self.array.get(i), ops.as_ref());
                }
            }
            i += 1;
        }
        self.table.rebuild(&self.array);
    }
}

/// Persists one record to storage, honoring `store`'s two out-of-band
/// signals in its return value: a size exceeding `buf.len()` asks for a
/// bigger scratch buffer (retry same batch), while a return offset by
/// `ACT_STORE_BATCH` announces more batches still pending for this record
/// (spec.md section 4.4). A free function rather than a method: `rec` is
/// borrowed from the array while `writer`/`offset` need disjoint mutable
/// access, which a single `&mut self` can't express here.
fn write_record(writer: &mut Option<StorageClient>, offset: &mut u64, rec: &dyn ModuleRecord, ops: &dyn ModuleOps) -> bool {
    let writer = match writer {
        Some(w) => w,
        None => return false,
    };

    let mut buf = vec![0u8; INITIAL_STORE_BUF];
    let mut more_batches = true;
    while more_batches {
        let raw = ops.store(rec, &mut buf);
        let (batch_pending, plain_size) = if raw >= ACT_STORE_BATCH {
            (true, raw - ACT_STORE_BATCH)
        } else {
            (false, raw)
        };

        if plain_size < 0 {
            return false;
        }
        let plain_size = plain_size as usize;
        if plain_size > buf.len() {
            let mut grown = false;
            for _ in 0..MAX_STORE_DOUBLINGS {
                buf.resize(buf.len() * 2, 0);
                if plain_size <= buf.len() {
                    grown = true;
                    break;
                }
            }
            if !grown {
                return false;
            }
            continue;
        }

        if let Ok(Some(mut region)) = writer.region(*offset, plain_size as u32) {
            region.as_mut_slice().copy_from_slice(&buf[..plain_size]);
            drop(region);
            *offset += plain_size as u64;
            let _ = writer.inform(*offset);
        }
        more_batches = batch_pending;
    }
    true
}

fn print_inline(rec: &dyn ModuleRecord, ops: &dyn ModuleOps, stdout: &mut impl Write) {
    let mut buf = vec![0u8; INITIAL_STORE_BUF];
    let mut more_batches = true;
    while more_batches {
        let raw = ops.store(rec, &mut buf);
        let (batch_pending, plain_size) = if raw >= ACT_STORE_BATCH {
            (true, raw - ACT_STORE_BATCH)
        } else {
            (false, raw)
        };
        if plain_size < 0 {
            return;
        }
        let plain_size = plain_size as usize;
        if plain_size > buf.len() {
            let mut grown = false;
            for _ in 0..MAX_STORE_DOUBLINGS {
                buf.resize(buf.len() * 2, 0);
                if plain_size <= buf.len() {
                    grown = true;
                    break;
                }
            }
            if !grown {
                return;
            }
            continue;
        }
        let _ = stdout.write_all(&buf[..plain_size]);
        more_batches = batch_pending;
    }
}

#[derive(Default)]
pub struct ExportStage {
    modules: HashMap<usize, ExportModuleState>,
}

impl ExportStage {
    pub fn new() -> ExportStage {
        ExportStage::default()
    }

    pub fn register_module(&mut self, module_index: usize, state: ExportModuleState) {
        self.modules.insert(module_index, state);
    }

    /// Absorbs and sweeps one capture table handoff, then returns the
    /// now-emptied map so capture can reclaim it (spec.md section 9,
    /// "Ownership of expired maps").
    pub fn handle_flush(&mut self, mut expired: ExpiredMap, inline: bool, stdout: &mut impl Write) -> ExpiredMap {
        if let Some(state) = self.modules.get_mut(&expired.module_index) {
            let records = std::mem::take(&mut expired.records);
            state.absorb(records, inline, stdout);
            state.store_records(expired.ivl, inline, stdout);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::filter::PassAll;
    use crate::packet::PacketView;

    struct DirectMod;

    impl ModuleOps for DirectMod {
        fn name(&self) -> &str {
            "direct"
        }
        fn new_record(&self) -> Box<dyn ModuleRecord> {
            Box::new(0u64)
        }
        fn update(&self, _pkt: &PacketView<'_>, _rec: &mut dyn ModuleRecord, _is_new: bool) -> bool {
            false
        }
        fn action(&self, rec: Option<&dyn ModuleRecord>, _ts: Timestamp, _count: usize) -> ActionFlags {
            match rec {
                None => ActionFlags::GO,
                Some(_) => ActionFlags::GO | ActionFlags::STORE,
            }
        }
        fn store(&self, rec: &dyn ModuleRecord, buf: &mut [u8]) -> isize {
            let v = rec.as_any().downcast_ref::<u64>().unwrap();
            buf[..8].copy_from_slice(&v.to_be_bytes());
            8
        }
        fn load(&self, buf: &[u8]) -> Option<(usize, Timestamp)> {
            if buf.len() < 8 {
                return None;
            }
            Some((8, Timestamp::ZERO))
        }
    }

    #[test]
    fn direct_path_prints_inline_when_no_writer_present() {
        let descriptor = Arc::new(ModuleDescriptor::new("direct", Arc::new(PassAll), "direct_stream", Arc::new(DirectMod)));
        let mut state = ExportModuleState::new(descriptor, None, 0);
        let mut out = Vec::new();
        state.absorb(vec![(0, Box::new(42u64))], true, &mut out);
        assert_eq!(out, 42u64.to_be_bytes());
    }

    #[test]
    fn aggregated_path_requires_export_before_store_records_does_anything() {
        // DirectMod has no `export`, so absorb goes straight to the direct
        // path and store_records sees an always-empty earray.
        let descriptor = Arc::new(ModuleDescriptor::new("direct", Arc::new(PassAll), "direct_stream", Arc::new(DirectMod)));
        let mut state = ExportModuleState::new(descriptor, None, 0);
        let mut out = Vec::new();
        state.store_records(Timestamp::ZERO, true, &mut out);
        assert!(out.is_empty());
    }
}
