//! The storage process (spec.md section 4.2): append-only bytestream files
//! on disk, served to the other four processes over `AF_UNIX` sockets.

pub mod bytestream;
pub mod client;
pub mod engine;
pub mod protocol;
pub mod region;
pub mod scheduler;
pub mod service;

pub use client::StorageClient;
pub use engine::{RegionOutcome, StorageEngine};
pub use protocol::{ErrorCode, OpenMode, Reply, Request, SeekTarget};
pub use region::Region;
pub use service::StorageService;
