//! The export process (spec.md section 4.4): absorbs capture tables handed
//! off on flush, aggregates or stores records directly, and sweeps the
//! earray under each module's `action` verdict before persisting to the
//! storage service.

pub mod action;
pub mod earray;
pub mod etable;
pub mod stage;

pub use earray::ExportArray;
pub use etable::ExportTable;
pub use stage::{ExportModuleState, ExportStage};
