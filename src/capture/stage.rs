//! The capture process's per-iteration drive loop (spec.md section 4.3):
//! ingest from every active sniffer, merge into timestamp order, feed each
//! active module's filter and table, and seal/slide tables on their flush
//! interval or under memory pressure.

use std::sync::Arc;

use crate::alloc::SharedAllocator;
use crate::capture::cabuf::CaBuf;
use crate::capture::ctable::CaptureTable;
use crate::capture::ppbuf::PpBuf;
use crate::capture::sniffer::Sniffer;
use crate::module::{ModuleDescriptor, ModuleRecord};
use crate::packet::Timestamp;

/// A sniffer is declared dead to the merge once its head packet is older
/// than the live sniffers' clock by this many seconds (spec.md section 4.3,
/// "Ingest and merging": "a sniffer that hasn't produced in a while is not
/// allowed to stall the merge indefinitely").
const LIVENESS_THRESHOLD_SECS: u32 = 2;

/// Fraction of the shared allocator's capacity at which a flexible flush is
/// forced regardless of interval (spec.md section 4.3, "Memory pressure").
const MEMORY_PRESSURE_FRACTION: f64 = 0.75;

struct SnifferSlot {
    sniffer: Box<dyn Sniffer>,
    ppbuf: PpBuf,
}

struct ModuleState {
    module_index: usize,
    descriptor: Arc<ModuleDescriptor>,
    table: CaptureTable,
}

/// A sealed table handed off to export, still owning its records until
/// export absorbs and returns it (spec.md section 9, "Ownership of expired
/// maps"): exactly one stage owns the records at any moment, the move
/// itself standing in for an explicit lock.
pub struct ExpiredMap {
    pub module_index: usize,
    pub ivl: Timestamp,
    pub flexible: bool,
    pub records: Vec<(u32, Box<dyn ModuleRecord>)>,
}

pub struct CaptureStage {
    sniffers: Vec<SnifferSlot>,
    cabuf: CaBuf,
    modules: Vec<ModuleState>,
    ppbuf_capacity: usize,
    pending_flush: Vec<ExpiredMap>,
}

impl CaptureStage {
    pub fn new(cabuf_capacity: usize, ppbuf_capacity: usize) -> CaptureStage {
        CaptureStage {
            sniffers: Vec::new(),
            cabuf: CaBuf::new(cabuf_capacity),
            modules: Vec::new(),
            ppbuf_capacity,
            pending_flush: Vec::new(),
        }
    }

    pub fn add_sniffer(&mut self, sniffer: Box<dyn Sniffer>) {
        self.sniffers.push(SnifferSlot { sniffer, ppbuf: PpBuf::new(self.ppbuf_capacity) });
    }

    pub fn add_module(&mut self, descriptor: Arc<ModuleDescriptor>) {
        let ivl = Timestamp::new(descriptor.flush_ivl_secs.max(1), 0);
        let table = CaptureTable::new(descriptor.ca_table_size, ivl);
        let module_index = self.modules.len();
        self.modules.push(ModuleState { module_index, descriptor, table });
    }

    /// One full ingest/merge/process iteration. Returns how many packets
    /// were fed into at least one module's table.
    pub fn run_once(&mut self) -> usize {
        for slot in &mut self.sniffers {
            if slot.sniffer.is_active() && !slot.sniffer.frozen() {
                let _ = slot.sniffer.next(&mut slot.ppbuf);
            }
        }

        let merged = match self.merge_batch() {
            Some(pkts) => pkts,
            None => return 0,
        };
        if merged.is_empty() {
            return 0;
        }
        let batch = self.cabuf.push_batch(merged);

        let mut processed = 0;
        for i in 0..self.modules.len() {
            if !self.modules[i].descriptor.is_active() {
                continue;
            }
            let descriptor = Arc::clone(&self.modules[i].descriptor);
            let ops = Arc::clone(&descriptor.ops);
            let filter = Arc::clone(&descriptor.filter);

            // Flush is evaluated on every packet, before it's processed,
            // not once for the batch: a batch straddling an interval
            // boundary must seal on the *earlier* interval's last packet
            // and start feeding the new table only once a later packet's
            // own timestamp crosses the boundary (spec.md section 4.3).
            // `self.cabuf.iter_batch` borrows only the `cabuf` field, so
            // the per-packet calls below reach into `self.modules`/
            // `self.pending_flush` through explicit field borrows rather
            // than `&mut self` methods, keeping the two borrows disjoint.
            for pkt in self.cabuf.iter_batch(batch) {
                if pkt.header.ts.is_zero() {
                    continue;
                }
                Self::flush_if_due_table(&mut self.modules[i], &mut self.pending_flush, pkt.header.ts);
                let view = pkt.as_view();
                if !filter.matches(&view) {
                    continue;
                }
                if self.modules[i].table.process(&view, ops.as_ref()) {
                    processed += 1;
                }
            }
        }
        processed
    }

    /// Merges every sniffer's head-of-ppbuf into one timestamp-ordered
    /// batch, dropping from the merge (not discarding) a sniffer whose head
    /// lags the others past `LIVENESS_THRESHOLD_SECS` so it can't stall
    /// delivery indefinitely (spec.md section 4.3).
    fn merge_batch(&mut self) -> Option<Vec<crate::packet::OwnedPacket>> {
        if self.sniffers.iter().all(|s| s.ppbuf.is_empty()) {
            return None;
        }
        let newest = self
            .sniffers
            .iter()
            .filter_map(|s| s.ppbuf.peek_last_ts())
            .max()?;

        let mut merged = Vec::new();
        loop {
            let mut best: Option<(usize, Timestamp)> = None;
            for (i, slot) in self.sniffers.iter().enumerate() {
                if let Some(ts) = slot.ppbuf.peek_head_ts() {
                    let lagging = newest.secs.saturating_sub(ts.secs) > LIVENESS_THRESHOLD_SECS;
                    if lagging {
                        continue;
                    }
                    if best.map_or(true, |(_, best_ts)| ts < best_ts) {
                        best = Some((i, ts));
                    }
                }
            }
            match best {
                Some((i, _)) => merged.push(self.sniffers[i].ppbuf.pop().unwrap()),
                None => break,
            }
        }
        Some(merged)
    }

    /// Seals `state`'s table if its flush interval has elapsed for `ts`,
    /// moving its records into `pending_flush` and starting a fresh table,
    /// per the seal/slide/lazy-init algorithm in spec.md section 4.3. Takes
    /// the module and the flush queue as explicit, disjoint parameters
    /// (rather than `&mut self`) so it can be called from within a loop
    /// that's also holding a live borrow of `self.cabuf`.
    fn flush_if_due_table(state: &mut ModuleState, pending_flush: &mut Vec<ExpiredMap>, ts: Timestamp) {
        let ivl = state.table.ivl();
        let floored = ts.floor_to_interval(ivl.secs);
        let current_ts = state.table.ts();

        if current_ts.is_zero() {
            state.table.set_ts(floored);
            return;
        }
        if floored <= current_ts {
            return;
        }
        Self::seal_and_flush_table(state, pending_flush, floored, false);
    }

    fn seal_and_flush_table(state: &mut ModuleState, pending_flush: &mut Vec<ExpiredMap>, new_ts: Timestamp, flexible: bool) {
        let sealed_ts = state.table.ts();
        if !state.table.is_empty() {
            let records = state.table.drain_records();
            pending_flush.push(ExpiredMap { module_index: state.module_index, ivl: sealed_ts, flexible, records });
        }
        state.table.set_ts(new_ts);
        // New table's flexible flag tracks whether *this* flush was forced
        // by memory pressure (spec.md section 4.3, "Memory pressure"), not
        // unconditionally false: a pressure-driven flush must leave the
        // replacement table eligible for another flexible flush.
        state.table.set_flexible(flexible);
    }

    /// Forces a flexible flush of every non-empty table when the shared
    /// allocator is over `MEMORY_PRESSURE_FRACTION` full (spec.md section
    /// 4.3, "Memory pressure").
    pub fn check_memory_pressure(&mut self, alloc: &SharedAllocator) {
        let capacity = alloc.capacity();
        if capacity == 0 {
            return;
        }
        let fraction = alloc.memory_usage() as f64 / capacity as f64;
        if fraction < MEMORY_PRESSURE_FRACTION {
            return;
        }
        for i in 0..self.modules.len() {
            if self.modules[i].descriptor.ops.has_flexible_flush() && !self.modules[i].table.is_empty() {
                let ts = self.modules[i].table.ts();
                Self::seal_and_flush_table(&mut self.modules[i], &mut self.pending_flush, ts, true);
            }
        }
    }

    pub fn take_pending_flush(&mut self) -> Vec<ExpiredMap> {
        std::mem::take(&mut self.pending_flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::filter::PassAll;
    use crate::capture::sniffer::VecSniffer;
    use crate::export::action::ActionFlags;
    use crate::module::{ModuleDescriptor, ModuleOps, ModuleRecord};
    use crate::packet::{PacketHeader, PacketView};
    use std::sync::Arc;

    struct CountMod;

    impl ModuleOps for CountMod {
        fn name(&self) -> &str {
            "count"
        }
        fn new_record(&self) -> Box<dyn ModuleRecord> {
            Box::new(0u64)
        }
        fn update(&self, _pkt: &PacketView<'_>, rec: &mut dyn ModuleRecord, _is_new: bool) -> bool {
            *rec.as_any_mut().downcast_mut::<u64>().unwrap() += 1;
            false
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

    fn pkt(secs: u32) -> crate::packet::OwnedPacket {
        crate::packet::OwnedPacket::new(PacketHeader::new(Timestamp::new(secs, 0), 64, 64), vec![])
    }

    #[test]
    fn run_once_feeds_active_modules_and_merges_sniffers() {
        let mut stage = CaptureStage::new(64, 16);
        stage.add_sniffer(Box::new(VecSniffer::new(vec![pkt(1), pkt(3)])));
        stage.add_sniffer(Box::new(VecSniffer::new(vec![pkt(2), pkt(4)])));
        let desc = Arc::new(ModuleDescriptor::new("count", Arc::new(PassAll), "count_stream", Arc::new(CountMod)));
        stage.add_module(desc);

        let fed = stage.run_once();
        assert_eq!(fed, 4);
    }

    #[test]
    fn flush_seals_table_past_its_interval() {
        let mut stage = CaptureStage::new(64, 16);
        stage.add_sniffer(Box::new(VecSniffer::new(vec![pkt(1)])));
        let mut desc = ModuleDescriptor::new("count", Arc::new(PassAll), "count_stream", Arc::new(CountMod));
        desc.flush_ivl_secs = 1;
        stage.add_module(Arc::new(desc));
        stage.run_once();
        assert!(stage.take_pending_flush().is_empty(), "first iteration only primes ts");

        stage.add_sniffer(Box::new(VecSniffer::new(vec![pkt(5)])));
        stage.run_once();
        let flushed = stage.take_pending_flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].records.len(), 1);
    }
}
