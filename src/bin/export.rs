//! Binary entrypoint for the export process (spec.md section 4.4).
//!
//! Standalone, this process brings up an empty export stage and a storage
//! client connection, ready for modules to be registered and for expired
//! maps to arrive over the real IPC control bus once a module-aware
//! transport exists (see the note in `capture.rs`).

use std::time::Duration;

use como::export::ExportStage;

fn main() {
    env_logger::init();

    let storage_socket = std::env::var("COMO_STORAGE_SOCKET").unwrap_or_else(|_| "/tmp/como-storage.sock".into());
    let stage = ExportStage::new();

    log::info!("export stage ready, storage at {}", storage_socket);

    // Idle loop: in this reference deployment, capture and export are
    // exercised together in-process by `como-supervisor`. Standalone, this
    // process is a no-op placeholder for once module registration and a
    // module-aware IPC transport exist.
    let _ = &stage;
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}
