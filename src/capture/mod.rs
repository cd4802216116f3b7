//! The capture process (spec.md section 4.3): sniffers feed a shared ring,
//! each active module's filter and hash table see every matching packet,
//! and sealed tables hand off to export on their flush interval or under
//! memory pressure.

pub mod cabuf;
pub mod ctable;
pub mod filter;
pub mod ppbuf;
pub mod sniffer;
pub mod stage;

pub use cabuf::{Batch, CaBuf};
pub use ctable::CaptureTable;
pub use filter::{Filter, PassAll, PredicateFilter};
pub use ppbuf::PpBuf;
pub use sniffer::{Sniffer, SnifferKind, VecSniffer};
pub use stage::{CaptureStage, ExpiredMap};
