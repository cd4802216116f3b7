//! Crate-level error type, used only *within* a process (spec.md section 7:
//! "errors crossing IPC boundaries are always typed and never carry
//! process-internal pointers"). IPC replies use the typed
//! `storage::protocol::ErrorCode` / `ipc::IpcMessage::Error` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("storage protocol error: {0:?}")]
    StorageProtocol(crate::storage::protocol::ErrorCode),

    #[error("shared allocator exhausted")]
    AllocExhausted,

    #[error("module callback failed for '{module}': {reason}")]
    ModuleCallback { module: String, reason: String },

    #[error("query validation failed: {0}")]
    QueryValidation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
