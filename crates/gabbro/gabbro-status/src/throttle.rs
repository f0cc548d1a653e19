//! Token-bucket throttle for bursty warnings.
//!
//! Late-packet and out-of-sequence warnings arrive in floods when a sender
//! restarts.  The throttle admits `threshold` messages per burst window and
//! silently counts the rest; the next window opens when the timer elapses.

use std::time::{Duration, Instant};

pub const DEFAULT_BURST_THRESHOLD: u32 = 120;
pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(3600);

/// Verdict for one warning occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Log it.  `closing` is set on the last admitted message of the
    /// window so the caller can announce the suppression that follows.
    Log { closing: bool },
    /// Swallow it; it has been counted.
    Suppressed,
}

pub struct WarnThrottle {
    threshold: u32,
    window: Duration,
    burst_start: Option<Instant>,
    admitted: u32,
    suppressed_total: u64,
}

impl WarnThrottle {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            burst_start: None,
            admitted: 0,
            suppressed_total: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BURST_THRESHOLD, DEFAULT_BURST_WINDOW)
    }

    /// Account one occurrence and decide whether to log it.
    pub fn permit(&mut self) -> Permit {
        let now = Instant::now();
        match self.burst_start {
            Some(start) if now.duration_since(start) <= self.window => {}
            _ => {
                self.burst_start = Some(now);
                self.admitted = 0;
            }
        }

        if self.admitted < self.threshold {
            self.admitted += 1;
            Permit::Log {
                closing: self.admitted == self.threshold,
            }
        } else {
            self.suppressed_total += 1;
            Permit::Suppressed
        }
    }

    /// Seconds left in the current burst window (for the suppression
    /// notice).
    pub fn window_remaining_secs(&self) -> u64 {
        match self.burst_start {
            Some(start) => self.window.saturating_sub(start.elapsed()).as_secs(),
            None => 0,
        }
    }

    /// Total messages swallowed since creation.
    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_threshold_then_suppresses() {
        let mut th = WarnThrottle::new(3, Duration::from_secs(60));
        assert_eq!(th.permit(), Permit::Log { closing: false });
        assert_eq!(th.permit(), Permit::Log { closing: false });
        assert_eq!(th.permit(), Permit::Log { closing: true });
        assert_eq!(th.permit(), Permit::Suppressed);
        assert_eq!(th.permit(), Permit::Suppressed);
        assert_eq!(th.suppressed_total(), 2);
    }

    #[test]
    fn window_elapse_opens_a_new_burst() {
        let mut th = WarnThrottle::new(1, Duration::from_millis(20));
        assert_eq!(th.permit(), Permit::Log { closing: true });
        assert_eq!(th.permit(), Permit::Suppressed);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(th.permit(), Permit::Log { closing: true });
    }
}
