//! Binary entrypoint for the query process (spec.md section 4.5).
//!
//! Modules are registered by the external dynamic loader (out of scope
//! per spec.md section 1); this process brings up the HTTP surface and
//! the storage client wiring ready for that registration to happen.

use como::query::QueryStage;

fn main() {
    env_logger::init();

    let listen_addr = std::env::var("COMO_QUERY_ADDR").unwrap_or_else(|_| "127.0.0.1:44444".into());
    let storage_socket = std::env::var("COMO_STORAGE_SOCKET").unwrap_or_else(|_| "/tmp/como-storage.sock".into());

    let stage = QueryStage::bind(&listen_addr, storage_socket).expect("bind query listener");
    log::info!("query stage listening on {}", listen_addr);

    loop {
        if let Err(e) = stage.serve_one() {
            log::warn!("query request failed: {}", e);
        }
    }
}
