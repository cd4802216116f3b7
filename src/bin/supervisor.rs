//! Binary entrypoint for the supervisor process (spec.md section 2: "forks
//! and life-cycles the other four roles").
//!
//! This crate models the capture/export expired-map handoff as a Rust-
//! level move (spec.md section 9, "Ownership of expired maps"), which
//! cannot cross a real OS process boundary without a module-specific wire
//! encoding the dynamic-module ABI would have to supply (out of scope per
//! spec.md section 1). Rather than fork raw processes, this binary is the
//! one place the full pipeline runs end to end, with capture and export
//! each on their own thread -- matching spec.md section 5's "each process
//! is internally single-threaded" shape one level down -- connected by the
//! same two-message exchange the real `IPC_FLUSH` round trip uses
//! (spec.md section 6): the expired map forward, an empty reclaim receipt
//! back, via `crossbeam_channel` rather than a socket.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use como::alloc::SharedAllocator;
use como::capture::{CaptureStage, ExpiredMap};
use como::export::ExportStage;

fn main() {
    env_logger::init();

    let slab_mb: usize = std::env::var("COMO_SLAB_MB").ok().and_then(|v| v.parse().ok()).unwrap_or(64);
    let cabuf_capacity: usize = std::env::var("COMO_CABUF_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(4096);
    let ppbuf_capacity: usize = std::env::var("COMO_PPBUF_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(256);

    let alloc = Arc::new(SharedAllocator::memory_init(slab_mb).expect("reserve shared slab"));

    let (flush_tx, flush_rx) = crossbeam_channel::unbounded::<ExpiredMap>();
    let (reclaim_tx, reclaim_rx) = crossbeam_channel::unbounded::<usize>();

    log::info!("supervisor driving capture+export on separate threads ({} MiB slab)", slab_mb);

    let capture_alloc = Arc::clone(&alloc);
    let capture_handle = thread::spawn(move || {
        let mut capture = CaptureStage::new(cabuf_capacity, ppbuf_capacity);
        loop {
            let fed = capture.run_once();
            capture.check_memory_pressure(&capture_alloc);
            for expired in capture.take_pending_flush() {
                log::debug!(
                    "flushing module {} ({} records)",
                    expired.module_index,
                    expired.records.len()
                );
                if flush_tx.send(expired).is_err() {
                    // Export side is gone; nothing left to drive.
                    return;
                }
            }
            // Drain reclaim receipts so capture could free per-module
            // arenas back to `alloc` once modules own real shared maps;
            // today the map lives entirely in the `ExpiredMap` that was
            // just moved out, so there is nothing further to release.
            while reclaim_rx.try_recv().is_ok() {}
            if fed == 0 {
                thread::sleep(Duration::from_millis(50));
            }
        }
    });

    let export_handle = thread::spawn(move || {
        let mut export = ExportStage::new();
        let mut stdout = std::io::stdout();
        while let Ok(expired) = flush_rx.recv() {
            let module_index = expired.module_index;
            let _ = export.handle_flush(expired, true, &mut stdout);
            if reclaim_tx.send(module_index).is_err() {
                break;
            }
        }
    });

    capture_handle.join().expect("capture thread panicked");
    export_handle.join().expect("export thread panicked");
}
