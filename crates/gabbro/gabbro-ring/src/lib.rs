//! `gabbro-ring`: the shared-memory block ring connecting pipeline stages.
//!
//! A ring is a fixed number of large slots in a file-backed mmap region.
//! Each slot carries a typed header plus an opaque payload, and a state word
//! in `{FREE, FILLING, FILLED}`.  A producer claims a `FREE` slot
//! (`busywait_free` + `set_filling`), fills it, and hands it downstream with
//! `set_filled`; the consumer blocks in `wait_filled`, drains the slot, and
//! returns it with `set_free`.
//!
//! Waits return [`Wait::TimedOut`] periodically so stage loops can poll the
//! process run flag; a timeout is an expected event, not an error.
//!
//! # Discipline
//!
//! - At most one producer and one consumer per ring.  Each advances its slot
//!   index monotonically modulo the slot count.
//! - The producer may hold at most two adjacent slots in `FILLING` at once.
//! - A producer that skips slots must still mark them `FILLED` (with the
//!   block header flagged as bad data) so the consumer never stalls on a
//!   hole.
//!
//! Stages attach to the same ring file independently, one handle per stage,
//! so the ring works identically for threads within one process and for
//! separate processes sharing the file.

mod layout;
mod ring;

pub use layout::{RING_MAGIC, RING_VERSION, RingHeader, align64};
pub use ring::{BlockRing, FILLED, FILLING, FREE, RingConfig, RingError, Wait};
