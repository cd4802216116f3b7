//! Module descriptor and the polymorphic module callback ABI.
//!
//! Per the design notes in spec.md section 9, the "export vs. direct" and
//! "sorted vs. insertion-order" switches are presence tests resolved once
//! at module-load time, not re-checked per record. Rust's `Option` already
//! gives us null-free optional behavior, so the ABI itself is a trait with
//! default-provided optional methods; `ModuleKind::of` computes the
//! load-time variant a single time, mirroring the enum the design note
//! describes for ABI-less languages.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::capture::filter::Filter;
use crate::export::action::ActionFlags;
use crate::packet::{OwnedPacket, PacketView, Timestamp};

/// Lifecycle status of a module, per spec.md section 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleStatus {
    Unused = 0,
    Incompatible = 1,
    Active = 2,
    Passive = 3,
    Frozen = 4,
}

impl ModuleStatus {
    fn from_u8(v: u8) -> ModuleStatus {
        match v {
            0 => ModuleStatus::Unused,
            1 => ModuleStatus::Incompatible,
            2 => ModuleStatus::Active,
            3 => ModuleStatus::Passive,
            _ => ModuleStatus::Frozen,
        }
    }
}

/// Whether a module runs continuously over the live/captured stream, or is
/// only instantiated transiently to serve an on-demand query (spec.md
/// section 4.5, "source=" queries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    OnDemand,
}

/// Opaque per-record state a module keeps in a capture or export table.
/// The core never interprets the bytes; it only ever moves, hashes and
/// drops the handle. Modules downcast via `as_any`/`as_any_mut` inside
/// their own callback implementations.
pub trait ModuleRecord: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> ModuleRecord for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Context passed to a module's `flush` callback: the sealed interval
/// start and whether the replacement table is flexible (memory-pressure
/// flush, spec.md section 4.3).
#[derive(Debug, Clone, Copy)]
pub struct FlushContext {
    pub ivl: Timestamp,
    pub flexible: bool,
}

/// The module behavior set (spec.md section 6, "Module callbacks").
///
/// Required operations are plain trait methods; optional ones have default
/// implementations matching the source's documented defaults (`check`
/// always true, `hash` always 0, `match` always "first record in bucket",
/// no export/compare/flush/print/replay).
pub trait ModuleOps: Send + Sync {
    fn name(&self) -> &str;

    /// Allocates a fresh, zeroed record for this module's table.
    fn new_record(&self) -> Box<dyn ModuleRecord>;

    fn check(&self, _pkt: &PacketView<'_>) -> bool {
        true
    }

    fn hash(&self, _pkt: &PacketView<'_>) -> u32 {
        0
    }

    /// Default: the first record walked in the bucket always matches.
    fn match_record(&self, _pkt: &PacketView<'_>, _rec: &dyn ModuleRecord) -> bool {
        true
    }

    /// Required: update `rec` for `pkt`, returning the new "full" bit.
    fn update(&self, pkt: &PacketView<'_>, rec: &mut dyn ModuleRecord, is_new: bool) -> bool;

    fn has_flexible_flush(&self) -> bool {
        false
    }

    fn flush(&self, _ctx: &FlushContext) -> Option<Box<dyn Any + Send>> {
        None
    }

    /// Presence of a real `export` implementation selects the aggregated
    /// export path over the direct one (spec.md section 4.4).
    fn has_export(&self) -> bool {
        false
    }

    fn ematch(&self, _export_rec: &dyn ModuleRecord, _capture_rec: &dyn ModuleRecord) -> bool {
        true
    }

    fn export(&self, _export_rec: &mut dyn ModuleRecord, _capture_rec: &dyn ModuleRecord, _is_new: bool) {
    }

    /// Presence of a real `compare` selects the sorted sweep over
    /// insertion-order iteration of the earray.
    fn has_compare(&self) -> bool {
        false
    }

    fn compare(&self, _a: &dyn ModuleRecord, _b: &dyn ModuleRecord) -> Option<Ordering> {
        None
    }

    /// Required: table-level policy (`rec = None`) and per-record sweep
    /// decision (`rec = Some`).
    fn action(&self, rec: Option<&dyn ModuleRecord>, ts: Timestamp, count: usize) -> ActionFlags;

    /// Required: serialize `rec` into `buf`, returning the number of bytes
    /// written, or a request for a larger buffer via a value exceeding
    /// `buf.len()` (spec.md section 4.4, "store" retry-on-grow).
    fn store(&self, rec: &dyn ModuleRecord, buf: &mut [u8]) -> isize;

    /// Required: deserialize one record from the front of `buf`, returning
    /// its on-disk size and timestamp.
    fn load(&self, buf: &[u8]) -> Option<(usize, Timestamp)>;

    /// Query-side formatting: unlike every other callback, this operates on
    /// raw on-disk bytes rather than a live `ModuleRecord` handle, since the
    /// query stage only ever has what `load` can see (spec.md section 4.5).
    fn print(&self, _fmt_id: usize, _buf: &[u8], _state: &mut dyn Any) -> Option<Vec<u8>> {
        None
    }

    /// Reconstitutes packets from a stored record for the `como` output
    /// format (spec.md section 4.5). Same raw-bytes rationale as `print`.
    fn replay(&self, _buf: &[u8], _out: &mut Vec<OwnedPacket>, _state: &mut dyn Any) -> Option<usize> {
        None
    }

    fn init_format(&self, _fmt_id: usize, _args: &str) -> Box<dyn Any + Send> {
        Box::new(())
    }

    fn finish_format(&self, _fmt_id: usize, _state: Box<dyn Any + Send>) {}

    /// Named output formats this module declares, beyond the built-in
    /// `raw`/`como` (spec.md section 4.5).
    fn formats(&self) -> &[&str] {
        &[]
    }
}

/// The load-time dispatch variant computed from presence tests, per the
/// design note in spec.md section 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Direct,
    Aggregated,
    Sorted,
}

impl ModuleKind {
    pub fn of(ops: &dyn ModuleOps) -> ModuleKind {
        if ops.has_compare() {
            ModuleKind::Sorted
        } else if ops.has_export() {
            ModuleKind::Aggregated
        } else {
            ModuleKind::Direct
        }
    }
}

/// Static module configuration plus runtime lifecycle state, per spec.md
/// section 3 ("Module descriptor").
pub struct ModuleDescriptor {
    pub name: String,
    pub filter: Arc<dyn Filter>,
    pub output_stream: String,
    pub size_limit: u64,
    pub ca_table_size: usize,
    pub ex_table_size: usize,
    pub flush_ivl_secs: u32,
    pub priority: i32,
    pub run_mode: RunMode,
    pub ops: Arc<dyn ModuleOps>,
    status: AtomicU8,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        filter: Arc<dyn Filter>,
        output_stream: impl Into<String>,
        ops: Arc<dyn ModuleOps>,
    ) -> Self {
        ModuleDescriptor {
            name: name.into(),
            filter,
            output_stream: output_stream.into(),
            size_limit: 16 * 1024 * 1024,
            ca_table_size: 1024,
            ex_table_size: 1024,
            flush_ivl_secs: 60,
            priority: 0,
            run_mode: RunMode::Normal,
            ops,
            status: AtomicU8::new(ModuleStatus::Active as u8),
        }
    }

    pub fn status(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.status.load(AtomicOrdering::Acquire))
    }

    pub fn set_status(&self, status: ModuleStatus) {
        self.status.store(status as u8, AtomicOrdering::Release);
    }

    pub fn kind(&self) -> ModuleKind {
        ModuleKind::of(self.ops.as_ref())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status(), ModuleStatus::Active)
    }

    /// Called on module callback failure, per spec.md section 7: "Module
    /// is disabled (status <- passive/incompatible); other modules
    /// continue."
    pub fn disable(&self, incompatible: bool) {
        self.set_status(if incompatible {
            ModuleStatus::Incompatible
        } else {
            ModuleStatus::Passive
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::filter::PassAll;

    struct CountBytes;

    impl ModuleOps for CountBytes {
        fn name(&self) -> &str {
            "count_bytes"
        }

        fn new_record(&self) -> Box<dyn ModuleRecord> {
            Box::new(0u64)
        }

        fn update(&self, pkt: &PacketView<'_>, rec: &mut dyn ModuleRecord, _is_new: bool) -> bool {
            let count = rec.as_any_mut().downcast_mut::<u64>().unwrap();
            *count += pkt.header.wire_len as u64;
            false
        }

        fn action(&self, _rec: Option<&dyn ModuleRecord>, _ts: Timestamp, _count: usize) -> ActionFlags {
            ActionFlags::GO | ActionFlags::STORE
        }

        fn store(&self, rec: &dyn ModuleRecord, buf: &mut [u8]) -> isize {
            let count = rec.as_any().downcast_ref::<u64>().unwrap();
            buf[..8].copy_from_slice(&count.to_be_bytes());
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
    fn kind_defaults_to_direct() {
        let desc = ModuleDescriptor::new(
            "m",
            Arc::new(PassAll),
            "m_stream",
            Arc::new(CountBytes),
        );
        assert_eq!(desc.kind(), ModuleKind::Direct);
        assert!(desc.is_active());
    }

    #[test]
    fn disable_sets_passive_or_incompatible() {
        let desc = ModuleDescriptor::new(
            "m",
            Arc::new(PassAll),
            "m_stream",
            Arc::new(CountBytes),
        );
        desc.disable(false);
        assert_eq!(desc.status(), ModuleStatus::Passive);
        desc.disable(true);
        assert_eq!(desc.status(), ModuleStatus::Incompatible);
    }
}
