//! Binary entrypoint for the capture process (spec.md section 4.3).
//!
//! Modules, filters and sniffer backends are registered by external
//! collaborators (the dynamic loader and sniffer backends are out of
//! scope per spec.md section 1); standalone, this process brings up the
//! shared allocator and an empty capture stage, ready for that
//! registration, and reports flush activity over the control bus.
//!
//! The expired-map handoff to export is a Rust-level move within one
//! process in this crate (see `como::export::stage::ExportStage`); across
//! real OS processes it would need a module-specific shared-memory
//! encoding that the dynamic-module ABI would have to supply, which is out
//! of scope here. Standalone, this binary logs what it would have handed
//! off instead of dropping it silently.

use std::time::Duration;

use como::alloc::SharedAllocator;
use como::capture::CaptureStage;

fn main() {
    env_logger::init();

    let slab_mb: usize = std::env::var("COMO_SLAB_MB").ok().and_then(|v| v.parse().ok()).unwrap_or(64);
    let cabuf_capacity: usize = std::env::var("COMO_CABUF_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(4096);
    let ppbuf_capacity: usize = std::env::var("COMO_PPBUF_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(256);

    let alloc = SharedAllocator::memory_init(slab_mb).expect("reserve shared slab");
    let mut stage = CaptureStage::new(cabuf_capacity, ppbuf_capacity);

    log::info!("capture stage ready ({} MiB slab, cabuf={}, ppbuf={})", slab_mb, cabuf_capacity, ppbuf_capacity);

    loop {
        let fed = stage.run_once();
        stage.check_memory_pressure(&alloc);
        for expired in stage.take_pending_flush() {
            log::info!(
                "module {} flushed {} records for interval starting {:?}",
                expired.module_index,
                expired.records.len(),
                expired.ivl
            );
        }
        if fed == 0 {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
