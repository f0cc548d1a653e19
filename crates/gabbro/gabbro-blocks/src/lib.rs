//! Shared data model of the catcher pipeline: wire packet headers, ring
//! block headers, stream geometry, and counter-to-time conversions.
//!
//! Everything that crosses a ring boundary is plain-old-data (`Copy`,
//! `#[repr(C)]`) so it can live in shared memory and be read by another
//! stage without serialization.

pub mod block;
pub mod frame;
pub mod geom;
pub mod time;
pub mod wire;

pub use block::{
    AutocorrHeader, FBlockHeader, MAX_ANTS_TOTAL, MAX_BASELINES_PER_BLOCK, RawFrameHeader,
    XBlockHeader,
};
pub use frame::{FRAME_HDR_OFF, FRAME_PAYLOAD_OFF, frame_slot_size};
pub use geom::{FGeom, GeomError, XGeom};
pub use time::TimeBase;
pub use wire::{FPacketHeader, X_WIRE_HEADER_LEN, XPacketHeader};
