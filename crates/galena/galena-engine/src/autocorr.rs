//! Autocorrelation side stream.
//!
//! For every assembled block, the even-parity full-stokes spectrum of each
//! autocorrelation baseline (`ant0 == ant1`) is copied into the current
//! side block, indexed by real antenna number via the correlator-to-antenna
//! map.  Once every live antenna has contributed, the side block is
//! published and the next one starts.

use crate::{WriterError, i32_bytes};
use gabbro_blocks::{AutocorrHeader, MAX_ANTS_TOTAL, TimeBase, XBlockHeader, XGeom};
use gabbro_ring::{BlockRing, Wait};
use gabbro_status::RunFlag;
use std::time::Duration;
use tracing::warn;

const WAIT: Duration = Duration::from_millis(500);

pub struct AutocorrFeeder {
    geom: XGeom,
    n_ants_total: usize,
    /// Integration seconds assumed for the side-channel JD stamp.
    integration_secs: f64,
    ring: BlockRing<AutocorrHeader>,
    run: RunFlag,
    cur: usize,
    acquired: bool,
    filled: u32,
    /// mcnt of the last baseline that contributed; the published block's
    /// JD comes from here.
    last_contrib_mcnt: Option<u64>,
}

impl AutocorrFeeder {
    pub fn new(
        geom: XGeom,
        n_ants_total: usize,
        integration_secs: f64,
        ring: BlockRing<AutocorrHeader>,
        run: RunFlag,
    ) -> Result<Self, WriterError> {
        if n_ants_total == 0 || n_ants_total > MAX_ANTS_TOTAL {
            return Err(WriterError::Mismatch(
                "autocorr antenna count out of range",
            ));
        }
        if ring.payload_bytes() != n_ants_total * geom.words_per_parity() * 4 {
            return Err(WriterError::Mismatch(
                "autocorr ring payload does not match antenna spectra",
            ));
        }
        Ok(Self {
            geom,
            n_ants_total,
            integration_secs,
            ring,
            run,
            cur: 0,
            acquired: false,
            filled: 0,
            last_contrib_mcnt: None,
        })
    }

    /// Scan one assembled block for unseen autocorrelations.  Returns
    /// `true` if a side block was published.
    pub fn feed(
        &mut self,
        hdr: &XBlockHeader,
        block: &[i32],
        corr_map: &[i32],
        nants: u32,
        tb: &TimeBase,
    ) -> bool {
        if nants == 0 {
            return false;
        }

        if !self.acquired {
            loop {
                match self.ring.busywait_free(self.cur, WAIT) {
                    Wait::Ready => break,
                    Wait::TimedOut => {
                        if !self.run.running() {
                            return false;
                        }
                    }
                }
            }
            self.ring.set_filling(self.cur);
            self.acquired = true;
        }
        if self.filled == 0 {
            // SAFETY: slot claimed above and held until publication.
            unsafe { *self.ring.header_mut(self.cur) = AutocorrHeader::zeroed() };
        }

        let words = self.geom.words_per_parity();
        for b in 0..self.geom.baselines_per_block {
            if hdr.ant_pair_0[b] != hdr.ant_pair_1[b] {
                continue;
            }
            let corr = hdr.ant_pair_0[b] as usize;
            let ant = corr_map.get(corr).copied().unwrap_or(-1);
            if ant < 0 {
                continue;
            }
            let ant = ant as usize;
            if ant >= self.n_ants_total {
                // Should never happen, so no throttling here.
                warn!(ant, max = self.n_ants_total - 1, "antenna number out of range");
                continue;
            }

            // SAFETY: slot held in FILLING by this feeder.
            let ahdr = unsafe { self.ring.header_mut(self.cur) };
            if ahdr.ant[ant] != 0 {
                continue;
            }
            ahdr.ant[ant] = 1;

            let spectrum = &block[self.geom.bcnt_idx32(b, 0)..][..words];
            // SAFETY: as above.
            let dst = unsafe { self.ring.payload_mut(self.cur) };
            dst[ant * words * 4..(ant + 1) * words * 4].copy_from_slice(i32_bytes(spectrum));

            self.filled += 1;
            self.last_contrib_mcnt = Some(hdr.mcnt[b]);
        }

        if self.filled >= nants {
            // SAFETY: as above.
            let ahdr = unsafe { self.ring.header_mut(self.cur) };
            ahdr.num_ants = nants;
            ahdr.julian_time = tb.jd_from_mcnt(
                self.last_contrib_mcnt.unwrap_or(0),
                self.integration_secs,
            );
            self.ring.set_filled(self.cur);
            self.cur = (self.cur + 1) % self.ring.slots();
            self.acquired = false;
            self.filled = 0;
            self.last_contrib_mcnt = None;
            return true;
        }
        false
    }
}
