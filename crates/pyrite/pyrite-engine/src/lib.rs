//! `pyrite-engine`: the ingest stages of the catcher pipeline.
//!
//! Each stage drains padded frames from the raw packet ring, reorders their
//! payloads into the assembled block ring, and publishes blocks downstream
//! in strictly increasing counter order.  Two variants exist:
//!
//! - [`FCatcher`]: F-engine voltage packets, keyed by `mcnt`.
//! - [`XCatcher`]: X-engine visibility packets, keyed by `bcnt`.
//!
//! Data problems (loss, duplication, reorder, sender restart) never abort a
//! stage; they surface as counters, throttled warnings, and blocks flagged
//! `good_data = 0`.  Only ring-format mismatches at startup and shutdown
//! requests end the loop.

mod copy;
mod feng;
mod xeng;

pub use copy::copy_stream;
pub use feng::{FCatcher, FReassembler};
pub use xeng::{XCatcher, XReassembler};

use gabbro_status::{RunFlag, StatusStore};
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Geometry(#[from] gabbro_blocks::GeomError),

    #[error(transparent)]
    Ring(#[from] gabbro_ring::RingError),

    #[error("ring does not match stream geometry: {0}")]
    Mismatch(&'static str),

    #[error("shutdown requested")]
    Shutdown,
}

/// Poll interval of the hold-off loop.
const HOLDOFF_POLL: Duration = Duration::from_millis(250);

/// Hold-off prologue: publish `hold_key = 1` and state `"holding"`, then
/// sleep until an operator clears the key (or shutdown).  On release the
/// key is deleted and the state becomes `"starting"`.
///
/// Returns `false` if shutdown arrived while holding.
pub fn hold_off(status: &StatusStore, run: &RunFlag, hold_key: &str, stat_key: &str) -> bool {
    {
        let mut st = status.lock();
        st.put_i64(hold_key, 1);
        st.put_str(stat_key, "holding");
    }
    info!("setting {hold_key} to 1, waiting for an operator to clear it");

    loop {
        if !run.running() {
            return false;
        }
        std::thread::sleep(HOLDOFF_POLL);
        let holding = status.lock().get_i64(hold_key).unwrap_or(1) != 0;
        if !holding {
            let mut st = status.lock();
            st.del(hold_key);
            st.put_str(stat_key, "starting");
            info!("hold-off released, starting");
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_off_waits_for_the_key() {
        let status = StatusStore::new();
        let run = RunFlag::new();

        let s2 = status.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            s2.lock().put_i64("NETHOLD", 0);
        });

        assert!(hold_off(&status, &run, "NETHOLD", "NETSTAT"));
        let st = status.lock();
        assert!(!st.contains("NETHOLD"), "hold key must be retired");
        assert_eq!(st.get_str("NETSTAT").as_deref(), Some("starting"));
        drop(st);
        releaser.join().unwrap();
    }

    #[test]
    fn hold_off_yields_to_shutdown() {
        let status = StatusStore::new();
        let run = RunFlag::new();
        run.shutdown();
        assert!(!hold_off(&status, &run, "CNETHOLD", "CNETSTAT"));
    }
}
