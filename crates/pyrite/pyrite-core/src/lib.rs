//! Reassembly bookkeeping shared by the F- and X-engine ingest stages.
//!
//! Both stages follow the same contract: packets are classified by the
//! signed distance of their counter from the current block anchor, each
//! expected packet position may be written exactly once, and too many
//! out-of-sequence packets force a resync.  This crate holds the pieces of
//! that contract that do not depend on the stream geometry.

mod claim;
mod classify;

pub use claim::{BlockCounters, ClaimMap};
pub use classify::{PacketClass, classify};
