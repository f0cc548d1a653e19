//! The process-wide run flag.
//!
//! The only process-global piece of state in the pipeline.  Every bounded
//! wait in every stage loop polls it, so a shutdown request propagates
//! within the longest wait timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone)]
pub struct RunFlag {
    flag: Arc<AtomicBool>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Request shutdown.  Idempotent; safe from signal handlers and any
    /// stage thread.
    pub fn shutdown(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_visible_to_clones() {
        let run = RunFlag::new();
        let other = run.clone();
        assert!(other.running());
        run.shutdown();
        assert!(!other.running());
        other.shutdown();
        assert!(!run.running());
    }
}
