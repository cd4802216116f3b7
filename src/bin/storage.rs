//! Binary entrypoint for the storage process (spec.md section 4.2).
//!
//! Socket path and stream directory come from the environment, per the
//! ambient-config rule: configuration file grammar and CLI parsing are out
//! of scope (spec.md section 1), so the only knobs a process needs to wire
//! itself up are read straight from `std::env`.

use std::path::PathBuf;
use std::time::Duration;

use como::storage::StorageService;

fn main() {
    env_logger::init();

    let socket_path = std::env::var("COMO_STORAGE_SOCKET").unwrap_or_else(|_| "/tmp/como-storage.sock".into());
    let streams_dir: PathBuf = std::env::var("COMO_STORAGE_DIR").unwrap_or_else(|_| "/tmp/como-streams".into()).into();

    std::fs::create_dir_all(&streams_dir).expect("create storage streams directory");

    let mut service = StorageService::bind(&socket_path, streams_dir).expect("bind storage socket");
    log::info!("storage listening on {}", socket_path);

    loop {
        if let Err(e) = service.run_for(Duration::from_secs(3600)) {
            log::error!("storage event loop error: {}", e);
        }
    }
}
