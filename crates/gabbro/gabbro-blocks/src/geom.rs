//! Stream geometry: the shapes that size every ring payload and drive
//! deterministic payload placement.
//!
//! The shapes are runtime configuration, validated once at stage
//! construction; a geometry that cannot satisfy the alignment and
//! divisibility rules is a fatal startup error, never a runtime one.

use crate::block::{MAX_ANTS_TOTAL, MAX_BASELINES_PER_BLOCK};
use serde::Deserialize;

/// Time samples carried per X-engine packet; the even/odd parity of a
/// packet is `(mcnt / XPKT_TIME_SAMPLES) % time_demux`.
pub const XPKT_TIME_SAMPLES: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum GeomError {
    #[error("invalid stream geometry: {0}")]
    Invalid(&'static str),
}

/// Shape of the X-engine visibility stream.
///
/// A block holds `baselines_per_block` baseline slices; each slice holds
/// both time parities of the full spectrum, split across the per-time
/// X-engines in channel chunks of `chan_per_packet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct XGeom {
    pub baselines_per_block: usize,
    pub time_demux: usize,
    pub n_xeng_per_time: usize,
    pub n_chan_total: usize,
    pub chan_per_packet: usize,
    pub n_stokes: usize,
}

impl Default for XGeom {
    fn default() -> Self {
        Self {
            baselines_per_block: 256,
            time_demux: 2,
            n_xeng_per_time: 8,
            n_chan_total: 2048,
            chan_per_packet: 128,
            n_stokes: 4,
        }
    }
}

impl XGeom {
    pub fn validate(&self) -> Result<(), GeomError> {
        if self.baselines_per_block == 0 || self.baselines_per_block > MAX_BASELINES_PER_BLOCK {
            return Err(GeomError::Invalid(
                "baselines_per_block out of range for block headers",
            ));
        }
        if self.time_demux == 0
            || self.n_xeng_per_time == 0
            || self.n_stokes == 0
            || self.chan_per_packet == 0
        {
            return Err(GeomError::Invalid("zero-sized geometry dimension"));
        }
        if self.n_chan_total == 0 || self.n_chan_total % self.n_xeng_per_time != 0 {
            return Err(GeomError::Invalid(
                "n_chan_total must divide evenly across the per-time X-engines",
            ));
        }
        if self.n_chan_per_xeng() % self.chan_per_packet != 0 {
            return Err(GeomError::Invalid(
                "per-engine channel range must be a whole number of packets",
            ));
        }
        if self.payload_bytes() % 64 != 0 {
            return Err(GeomError::Invalid("packet payload must be 64-byte aligned"));
        }
        if self.payload_bytes() > u16::MAX as usize {
            return Err(GeomError::Invalid(
                "packet payload exceeds the wire length field",
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn n_chan_per_xeng(&self) -> usize {
        self.n_chan_total / self.n_xeng_per_time
    }

    /// Packets needed to cover one X-engine's channel range.
    #[inline]
    pub fn chunks_per_xeng(&self) -> usize {
        self.n_chan_per_xeng() / self.chan_per_packet
    }

    /// 32-bit words per packet payload (re/im per stokes per channel).
    #[inline]
    pub fn words_per_packet(&self) -> usize {
        self.chan_per_packet * self.n_stokes * 2
    }

    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.words_per_packet() * 4
    }

    /// 32-bit words of one time parity of one baseline slice.
    #[inline]
    pub fn words_per_parity(&self) -> usize {
        self.n_chan_total * self.n_stokes * 2
    }

    #[inline]
    pub fn packets_per_baseline(&self) -> usize {
        self.time_demux * self.n_xeng_per_time * self.chunks_per_xeng()
    }

    #[inline]
    pub fn packets_per_block(&self) -> usize {
        self.baselines_per_block * self.packets_per_baseline()
    }

    /// Packets contributed by a single X-engine per block; used to fold
    /// missing-packet counts into whole-engine gaps.
    #[inline]
    pub fn packets_per_xeng(&self) -> usize {
        self.baselines_per_block * self.time_demux * self.chunks_per_xeng()
    }

    #[inline]
    pub fn block_words(&self) -> usize {
        self.packets_per_block() * self.words_per_packet()
    }

    #[inline]
    pub fn block_bytes(&self) -> usize {
        self.block_words() * 4
    }

    /// Packet slot index within a block for `(baseline, parity, xeng,
    /// chunk)`.  Slots are dense: every expected packet maps to exactly one
    /// index in `[0, packets_per_block)`.
    #[inline]
    pub fn pkt_slot(&self, baseline: usize, parity: usize, xeng: usize, chunk: usize) -> usize {
        ((baseline * self.time_demux + parity) * self.n_xeng_per_time + xeng)
            * self.chunks_per_xeng()
            + chunk
    }

    /// 32-bit word index of the start of one parity of one baseline slice.
    /// The slice is contiguous: `words_per_parity()` words of spectrum.
    #[inline]
    pub fn bcnt_idx32(&self, baseline: usize, parity: usize) -> usize {
        self.pkt_slot(baseline, parity, 0, 0) * self.words_per_packet()
    }

    /// Even/odd parity of a packet's spectrum counter.
    #[inline]
    pub fn time_parity(&self, mcnt: u64) -> usize {
        ((mcnt / XPKT_TIME_SAMPLES) % self.time_demux as u64) as usize
    }

    /// Spectrum counter with the parity offset removed, identical for the
    /// even and odd packets of one dump.
    #[inline]
    pub fn base_mcnt(&self, mcnt: u64) -> u64 {
        mcnt - XPKT_TIME_SAMPLES * self.time_parity(mcnt) as u64
    }
}

/// Shape of the F-engine voltage stream.
///
/// A block covers `time_per_block` spectra of this catcher's time-demux
/// parity for all antennas; packets carry `ants_per_packet` antennas ×
/// `n_chan_per_packet` channels × `n_time_per_packet` time samples at two
/// bytes per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FGeom {
    pub n_ants: usize,
    pub ants_per_packet: usize,
    pub n_chan_per_packet: usize,
    pub n_time_per_packet: usize,
    pub n_chan_per_xeng: usize,
    pub time_per_block: usize,
    pub time_demux: usize,
}

impl Default for FGeom {
    fn default() -> Self {
        Self {
            n_ants: 192,
            ants_per_packet: 3,
            n_chan_per_packet: 384,
            n_time_per_packet: 2,
            n_chan_per_xeng: 384,
            time_per_block: 2048,
            time_demux: 2,
        }
    }
}

impl FGeom {
    pub fn validate(&self) -> Result<(), GeomError> {
        if self.n_ants == 0 || self.n_ants > MAX_ANTS_TOTAL {
            return Err(GeomError::Invalid("antenna count out of range"));
        }
        if self.ants_per_packet == 0 || self.n_ants % self.ants_per_packet != 0 {
            return Err(GeomError::Invalid(
                "antenna count must be a whole number of packet groups",
            ));
        }
        if self.n_chan_per_packet == 0 || self.n_chan_per_xeng % self.n_chan_per_packet != 0 {
            return Err(GeomError::Invalid(
                "channel range must be a whole number of packets",
            ));
        }
        if self.n_time_per_packet == 0 || self.time_per_block % self.n_time_per_packet != 0 {
            return Err(GeomError::Invalid(
                "block time span must be a whole number of packets",
            ));
        }
        if self.time_demux == 0 {
            return Err(GeomError::Invalid("time_demux must be at least 1"));
        }
        if self.copy_bytes_per_ant() % 64 != 0 {
            return Err(GeomError::Invalid(
                "per-antenna packet slice must be 64-byte aligned",
            ));
        }
        Ok(())
    }

    /// Bytes of one antenna's slice of one packet (2 bytes per
    /// channel-time sample).
    #[inline]
    pub fn copy_bytes_per_ant(&self) -> usize {
        2 * self.n_chan_per_packet * self.n_time_per_packet
    }

    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.ants_per_packet * self.copy_bytes_per_ant()
    }

    /// Number of packet time groups (sub-blocks) per block.
    #[inline]
    pub fn m_per_block(&self) -> usize {
        self.time_per_block / self.n_time_per_packet
    }

    #[inline]
    pub fn ant_groups(&self) -> usize {
        self.n_ants / self.ants_per_packet
    }

    #[inline]
    pub fn chan_groups(&self) -> usize {
        self.n_chan_per_xeng / self.n_chan_per_packet
    }

    #[inline]
    pub fn packets_per_block(&self) -> usize {
        self.m_per_block() * self.ant_groups() * self.chan_groups()
    }

    /// Packets contributed by one F-engine board (one antenna group) per
    /// block; used to fold missing-packet counts into whole-engine gaps.
    #[inline]
    pub fn packets_per_feng(&self) -> usize {
        self.m_per_block() * self.chan_groups()
    }

    #[inline]
    pub fn block_bytes(&self) -> usize {
        self.m_per_block() * self.n_ants * self.n_chan_per_xeng * self.n_time_per_packet * 2
    }

    /// Spectrum counters spanned by one block (both parities included).
    #[inline]
    pub fn mcnt_per_block(&self) -> u64 {
        (self.time_per_block * self.time_demux) as u64
    }

    /// Byte offset of `(sub_block, antenna, channel, time)` in a block
    /// payload.
    #[inline]
    pub fn byte_idx(&self, m: usize, ant: usize, chan: usize, time: usize) -> usize {
        (((m * self.n_ants + ant) * self.n_chan_per_xeng + chan) * self.n_time_per_packet + time)
            * 2
    }

    /// Packet slot index within a block for the duplicate bitmap.
    #[inline]
    pub fn pkt_slot(&self, m: usize, ant_group: usize, chan_group: usize) -> usize {
        (m * self.ant_groups() + ant_group) * self.chan_groups() + chan_group
    }

    /// Which time-demux parity a spectrum counter belongs to.
    #[inline]
    pub fn time_index_of(&self, mcnt: u64) -> u64 {
        (mcnt / self.n_time_per_packet as u64) % self.time_demux as u64
    }

    /// Sub-block index of a spectrum counter.
    #[inline]
    pub fn m_of(&self, mcnt: u64) -> usize {
        (((mcnt / self.time_demux as u64) % self.time_per_block as u64)
            / self.n_time_per_packet as u64) as usize
    }

    /// First spectrum counter of the block containing `mcnt`, preserving
    /// the counter's time-demux parity offset.
    #[inline]
    pub fn start_for_mcnt(&self, mcnt: u64) -> u64 {
        mcnt - (mcnt % self.mcnt_per_block())
            + self.time_index_of(mcnt) * self.n_time_per_packet as u64
    }
}
