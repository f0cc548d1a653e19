//! Conversions from spectrum counters to wall time and Julian date.
//!
//! All real time in the pipeline derives from the F-engine sync epoch: the
//! wall time of counter zero plus `mcnt` spectrum periods.  One spectrum
//! period is `2 · n_chan_generated / sample_rate_hz` seconds.

/// Julian date of the UNIX epoch.
const JD_UNIX_EPOCH: f64 = 2440587.5;

const SECS_PER_DAY: f64 = 86400.0;

#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    /// Wall time of spectrum counter zero, in milliseconds.
    pub sync_time_ms: u64,
    /// ADC sample rate of the F-engines, in Hz.
    pub sample_rate_hz: f64,
    /// Channels generated by the F-engines (before any catcher-side
    /// channel summing).
    pub n_chan_generated: u64,
}

impl TimeBase {
    /// Seconds per spectrum.
    #[inline]
    pub fn spectrum_secs(&self) -> f64 {
        2.0 * self.n_chan_generated as f64 / self.sample_rate_hz
    }

    /// UNIX time (seconds, fractional) of a spectrum counter.
    #[inline]
    pub fn mcnt_to_unix(&self, mcnt: u64) -> f64 {
        self.sync_time_ms as f64 / 1000.0 + mcnt as f64 * self.spectrum_secs()
    }

    /// Julian date of a spectrum counter, shifted back by half the
    /// integration so the stamp lands on the integration midpoint.
    #[inline]
    pub fn jd_from_mcnt(&self, mcnt: u64, integration_secs: f64) -> f64 {
        unix_to_jd(self.mcnt_to_unix(mcnt) - integration_secs / 2.0)
    }
}

/// Julian date of a UNIX timestamp.
#[inline]
pub fn unix_to_jd(unix: f64) -> f64 {
    JD_UNIX_EPOCH + unix / SECS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tb() -> TimeBase {
        TimeBase {
            sync_time_ms: 1_500_000_000_000,
            sample_rate_hz: 500e6,
            n_chan_generated: 8192,
        }
    }

    #[test]
    fn epoch_maps_to_julian_date() {
        assert_eq!(unix_to_jd(0.0), 2440587.5);
        assert_eq!(unix_to_jd(86400.0), 2440588.5);
    }

    #[test]
    fn counter_zero_is_the_sync_epoch() {
        let t = tb();
        assert_eq!(t.mcnt_to_unix(0), 1_500_000_000.0);
    }

    #[test]
    fn spectra_advance_time_linearly() {
        let t = tb();
        let dt = t.mcnt_to_unix(1000) - t.mcnt_to_unix(0);
        assert!((dt - 1000.0 * t.spectrum_secs()).abs() < 1e-9);
        // 2 * 8192 / 500e6 = 32.768 us per spectrum
        assert!((t.spectrum_secs() - 32.768e-6).abs() < 1e-12);
    }

    #[test]
    fn jd_uses_the_integration_midpoint() {
        let t = tb();
        let whole = t.jd_from_mcnt(0, 0.0);
        let shifted = t.jd_from_mcnt(0, 2.0);
        // shifting by half of 2 s moves the JD back one second
        let diff_secs = (whole - shifted) * 86400.0;
        assert!((diff_secs - 1.0).abs() < 1e-6);
    }
}
