//! CoMo: passive network monitoring core.
//!
//! Five cooperating components (spec.md section 2): the shared allocator
//! (`alloc`), the storage service (`storage`), the capture stage
//! (`capture`), the export stage (`export`) and the query stage (`query`).
//! `packet`, `module` and `ipc` are shared data types and wire formats used
//! across all five.

pub mod alloc;
pub mod capture;
pub mod error;
pub mod export;
pub mod ipc;
pub mod module;
pub mod packet;
pub mod query;
pub mod storage;

pub use error::{Error, Result};
