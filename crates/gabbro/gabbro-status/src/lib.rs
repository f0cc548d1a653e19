//! Process-local status surface shared by all pipeline stages.
//!
//! Stages publish named scalars (counters, rates, state strings) and read
//! operator-written control values (`TRIGGER`, `NFILES`, ...).  The store is
//! a single map under one lock; callers take the lock, do their batch of
//! gets/puts, and release it — never holding it across I/O or ring waits.

mod keys;
mod run;
mod store;
mod throttle;

pub use keys::*;
pub use run::RunFlag;
pub use store::{StatusGuard, StatusStore, Value};
pub use throttle::{Permit, WarnThrottle};
