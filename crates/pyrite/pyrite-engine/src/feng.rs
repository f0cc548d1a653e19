//! F-engine voltage reassembly.
//!
//! Packets are keyed by `mcnt`, the spectrum counter.  Unlike the X-engine
//! variant the anchor starts at this catcher's time-demux offset rather
//! than at the first packet: the F-engines are synchronised to counter
//! zero, so block boundaries are known before any traffic arrives.

use crate::{IngestError, copy_stream, hold_off};
use gabbro_blocks::{FBlockHeader, FGeom, FPacketHeader, FRAME_HDR_OFF, FRAME_PAYLOAD_OFF, RawFrameHeader};
use gabbro_ring::{BlockRing, Wait};
use gabbro_status::{
    BINDPORT, GIT_VER, MISSEDFE, MISSEDPK, NETBKOUT, NETHOLD, NETMCNT, NETSTAT, Permit, RunFlag,
    StatusStore, TIMEIDX, WarnThrottle, XID,
};
use pyrite_core::{BlockCounters, ClaimMap, PacketClass, classify};
use std::time::Duration;
use tracing::{error, info, warn};

const WAIT: Duration = Duration::from_millis(500);

/// Anchor state of the F-engine reassembler.
struct FSeq {
    /// First `mcnt` of the current block (carries the time-demux offset).
    mcnt_start: u64,
    /// Squelch late-packet warnings until the anchor passes this.
    mcnt_log_late: u64,
    /// Ring slot of the current block.
    block_i: usize,
    out_of_seq_cnt: u64,
    last_filled: Option<usize>,
    /// Correlator slice id read back from the status store after each
    /// fill; diagnostic only.
    self_xid: i64,
}

/// The F-engine reassembly core; see [`crate::xeng::XReassembler`] for the
/// split rationale.
pub struct FReassembler {
    geom: FGeom,
    slots: usize,
    time_index: u64,
    late_threshold: i64,
    max_out_of_seq: u64,
    out: BlockRing<FBlockHeader>,
    status: StatusStore,
    run: RunFlag,
    throttle: WarnThrottle,
    seq: FSeq,
    counters: BlockCounters,
    pkt_claims: ClaimMap,
}

impl FReassembler {
    pub fn new(
        geom: FGeom,
        time_index: u64,
        out: BlockRing<FBlockHeader>,
        status: StatusStore,
        run: RunFlag,
    ) -> Result<Self, IngestError> {
        geom.validate()?;
        if out.payload_bytes() != geom.block_bytes() {
            return Err(IngestError::Mismatch(
                "assembled ring payload does not match block size",
            ));
        }
        if time_index >= geom.time_demux as u64 {
            return Err(IngestError::Mismatch(
                "time index exceeds the time-demux factor",
            ));
        }
        let slots = out.slots();
        if slots < 3 {
            return Err(IngestError::Mismatch(
                "assembled ring needs at least three slots",
            ));
        }
        let span = geom.mcnt_per_block();
        // Two full ring traversals of slack for sender restarts and
        // counter rollover.
        let late_threshold = (2 * span * slots as u64) as i64;
        // Two packets in a row from every F-engine may stray before the
        // anchor resyncs.
        let max_out_of_seq = 2 * geom.n_ants as u64;
        let seq = FSeq {
            mcnt_start: time_index,
            mcnt_log_late: span + time_index,
            block_i: 0,
            out_of_seq_cnt: 0,
            last_filled: None,
            self_xid: -1,
        };
        Ok(Self {
            geom,
            slots,
            time_index,
            late_threshold,
            max_out_of_seq,
            out,
            status,
            run,
            throttle: WarnThrottle::with_defaults(),
            seq,
            counters: BlockCounters::new(slots),
            pkt_claims: ClaimMap::new(slots, geom.packets_per_block()),
        })
    }

    pub fn geom(&self) -> &FGeom {
        &self.geom
    }

    fn block_for_mcnt(&self, mcnt: u64) -> usize {
        ((mcnt / self.geom.time_demux as u64) / self.geom.time_per_block as u64) as usize
            % self.slots
    }

    fn warn_throttled(&mut self, msg: &str) {
        match self.throttle.permit() {
            Permit::Log { closing } => {
                warn!("{msg}");
                if closing {
                    warn!(
                        "suppressing further occurrences for {}s",
                        self.throttle.window_remaining_secs()
                    );
                }
            }
            Permit::Suppressed => {}
        }
    }

    fn acquire_slot(&self, idx: usize) -> Result<(), IngestError> {
        loop {
            match self.out.busywait_free(idx, WAIT) {
                Wait::Ready => break,
                Wait::TimedOut => {
                    if !self.run.running() {
                        return Err(IngestError::Shutdown);
                    }
                }
            }
        }
        self.out.set_filling(idx);
        Ok(())
    }

    /// Stamp a freshly acquired block with the block-start counter for
    /// `mcnt`, checking that the packet is ours to demux.
    fn initialize_block(&mut self, mcnt: u64) {
        let got_index = self.geom.time_index_of(mcnt);
        if got_index != self.time_index {
            let expected = self.time_index;
            self.warn_throttled(&format!(
                "expected packets from time index {expected}, got index {got_index}"
            ));
        }
        let idx = self.block_for_mcnt(mcnt);
        let start = self.geom.start_for_mcnt(mcnt);
        // SAFETY: the slot is held in FILLING by this stage.
        let hdr = unsafe { self.out.header_mut(idx) };
        hdr.mcnt = start;
        hdr.good_data = 0;
    }

    /// Claim ring slots 0 and 1 and stamp them with the first two block
    /// anchors of this catcher's parity.
    pub fn acquire_initial_blocks(&mut self) -> Result<(), IngestError> {
        self.acquire_slot(0)?;
        self.acquire_slot(1)?;
        self.initialize_block(self.time_index);
        self.initialize_block(self.geom.mcnt_per_block() + self.time_index);
        Ok(())
    }

    /// Mark the current block filled; returns its first `mcnt`.
    fn set_block_filled(&mut self) -> u64 {
        let block_i = self.block_for_mcnt(self.seq.mcnt_start);

        if let Some(last) = self.seq.last_filled {
            let expected = (last + 1) % self.slots;
            if expected != block_i {
                warn!(block_i, expected, "block marked filled out of ring order");
            }
        }
        if block_i != self.seq.block_i {
            warn!(
                block_i,
                anchor_block = self.seq.block_i,
                "anchor mcnt and anchor block index disagree"
            );
        }

        let count = self.counters.get(block_i);
        let expected_pkts = self.geom.packets_per_block() as u64;
        if count == expected_pkts {
            // SAFETY: the slot is still held in FILLING by this stage.
            unsafe { self.out.header_mut(block_i) }.good_data = 1;
        }
        self.out.set_filled(block_i);
        self.seq.last_filled = Some(block_i);

        let missing = expected_pkts - count;
        let per_feng = self.geom.packets_per_feng() as u64;
        let missed_fengs = self.geom.ants_per_packet as u64 * missing / per_feng;
        let stray = missing % per_feng;

        // Re-read our slice id each fill; operators may reassign it.
        self.seq.self_xid = -1;
        {
            let mut st = self.status.lock();
            st.put_u64(NETBKOUT, block_i as u64);
            st.put_u64(MISSEDFE, missed_fengs);
            if stray != 0 {
                let total = st.get_u64(MISSEDPK).unwrap_or(0) + stray;
                st.put_u64(MISSEDPK, total);
            }
            if let Some(xid) = st.get_i64(XID) {
                self.seq.self_xid = xid;
            }
        }
        tracing::debug!(xid = self.seq.self_xid, block_i, "block filled");
        if stray != 0 {
            warn!(
                mcnt = self.seq.mcnt_start,
                expected = expected_pkts,
                got = count,
                "block published with missing packets"
            );
        }

        self.seq.mcnt_start
    }

    /// Resync after too many out-of-sequence packets.  The new anchor is
    /// the first block-start at or above the packet's counter that maps to
    /// the ring slot already held, preserving buffer locality.
    fn reset_to(&mut self, pkt_mcnt: u64) {
        let span = self.geom.mcnt_per_block();
        let pkt_block = self.block_for_mcnt(pkt_mcnt);
        let mut adjusted = pkt_mcnt;
        if self.seq.block_i > pkt_block {
            adjusted += span * (self.seq.block_i - pkt_block) as u64;
        } else if self.seq.block_i < pkt_block {
            adjusted += span * (self.seq.block_i + self.slots - pkt_block) as u64;
        }
        self.seq.mcnt_start = self.geom.start_for_mcnt(adjusted);
        self.seq.mcnt_log_late = self.seq.mcnt_start + span;
        self.seq.block_i = self.block_for_mcnt(self.seq.mcnt_start);
        self.seq.out_of_seq_cnt = 0;

        warn!(
            mcnt_start = self.seq.mcnt_start,
            block = self.seq.block_i,
            pkt_mcnt,
            "too many out-of-sequence packets, resetting anchor"
        );

        let cur = self.seq.block_i;
        let next = (cur + 1) % self.slots;
        self.counters.reset(cur);
        self.counters.reset(next);
        self.pkt_claims.reset_block(cur);
        self.pkt_claims.reset_block(next);
        self.initialize_block(self.seq.mcnt_start);
        self.initialize_block(self.seq.mcnt_start + span);
    }

    /// Route one padded frame.  Returns the first `mcnt` of a block if
    /// this packet caused one to be marked filled.
    pub fn process_packet(&mut self, frame: &[u8]) -> Result<Option<u64>, IngestError> {
        let Some(hdr) = FPacketHeader::parse(&frame[FRAME_HDR_OFF..]) else {
            self.warn_throttled("dropping truncated frame");
            return Ok(None);
        };
        let nbytes = self.geom.payload_bytes();
        if frame.len() < FRAME_PAYLOAD_OFF + nbytes {
            self.warn_throttled("dropping short frame");
            return Ok(None);
        }

        let span = self.geom.mcnt_per_block() as i64;
        let pkt_block = self.block_for_mcnt(hdr.mcnt);
        let dist = hdr.mcnt as i64 - self.seq.mcnt_start as i64;
        let mut netmcnt = None;

        let class = classify(dist, span, self.late_threshold);
        match class {
            PacketClass::InWindow | PacketClass::Advance => {
                if class == PacketClass::Advance {
                    netmcnt = Some(self.set_block_filled());

                    self.seq.mcnt_start += span as u64;
                    self.seq.block_i = (self.seq.block_i + 1) % self.slots;

                    self.counters.reset(pkt_block);
                    self.pkt_claims.reset_block(pkt_block);
                    self.acquire_slot(pkt_block)?;
                    self.initialize_block(hdr.mcnt);
                }
                self.seq.out_of_seq_cnt = 0;

                if hdr.ant as usize >= self.geom.n_ants {
                    error!(
                        ant = hdr.ant,
                        max = self.geom.n_ants - 1,
                        "packet antenna id out of range"
                    );
                    return Ok(netmcnt);
                }
                let chan = hdr.chan as usize % self.geom.n_chan_per_xeng;
                let m = self.geom.m_of(hdr.mcnt);
                let ant = hdr.ant as usize;

                // Mis-demuxed packets are logged (throttled) but still
                // placed; the parity discipline is the sender's to keep.
                if self.geom.time_index_of(hdr.mcnt) != self.time_index {
                    let expected = self.time_index;
                    let got = self.geom.time_index_of(hdr.mcnt);
                    self.warn_throttled(&format!(
                        "expected packets from time index {expected}, got index {got}"
                    ));
                }

                let slot = self.geom.pkt_slot(
                    m,
                    ant / self.geom.ants_per_packet,
                    chan / self.geom.n_chan_per_packet,
                );
                if !self.pkt_claims.try_claim(pkt_block, slot) {
                    self.warn_throttled(&format!("duplicate packet for mcnt {}", hdr.mcnt));
                    self.seq.out_of_seq_cnt += 1;
                    return Ok(netmcnt);
                }

                // One packet carries ants_per_packet consecutive antennas;
                // each lands in its own stretch of the block.
                let chunk = self.geom.copy_bytes_per_ant();
                for i in 0..self.geom.ants_per_packet {
                    let src_off = FRAME_PAYLOAD_OFF + i * chunk;
                    let dst_off = self.geom.byte_idx(m, ant + i, chan, 0);
                    let src = &frame[src_off..src_off + chunk];
                    // SAFETY: pkt_block is held in FILLING by this stage.
                    let dst =
                        unsafe { &mut self.out.payload_mut(pkt_block)[dst_off..dst_off + chunk] };
                    copy_stream(dst, src);
                }
                self.counters.incr(pkt_block);
            }

            PacketClass::Late => {
                if self.seq.mcnt_start >= self.seq.mcnt_log_late {
                    self.warn_throttled(&format!(
                        "ignoring late packet ({} mcnts late, ant {})",
                        -dist, hdr.ant
                    ));
                }
            }

            PacketClass::OutOfSeq => {
                if self.seq.mcnt_start != self.time_index && self.seq.out_of_seq_cnt == 0 {
                    self.warn_throttled(&format!(
                        "out of seq mcnt {:#014x} from ant {} (expected {:#014x} <= mcnt < {:#014x})",
                        hdr.mcnt,
                        hdr.ant,
                        self.seq.mcnt_start,
                        self.seq.mcnt_start + 3 * span as u64
                    ));
                }
                self.seq.out_of_seq_cnt += 1;
                if self.seq.out_of_seq_cnt > self.max_out_of_seq {
                    self.reset_to(hdr.mcnt);
                }
            }
        }

        Ok(netmcnt)
    }
}

/// The F-engine ingest stage loop.
pub struct FCatcher {
    input: BlockRing<RawFrameHeader>,
    inner: FReassembler,
    status: StatusStore,
    run: RunFlag,
    in_idx: usize,
}

impl FCatcher {
    pub fn new(input: BlockRing<RawFrameHeader>, inner: FReassembler) -> Self {
        let status = inner.status.clone();
        let run = inner.run.clone();
        Self {
            input,
            inner,
            status,
            run,
            in_idx: 0,
        }
    }

    pub fn run(&mut self) -> Result<(), IngestError> {
        {
            let mut st = self.status.lock();
            st.put_str(GIT_VER, env!("CARGO_PKG_VERSION"));
            st.put_u64(MISSEDFE, 0);
            st.put_u64(MISSEDPK, 0);
            // Echo the packet source's bind port so operators see it even
            // when the source has not published one yet.
            let port = st.get_i64(BINDPORT).unwrap_or(8511);
            st.put_i64(BINDPORT, port);
        }

        if !hold_off(&self.status, &self.run, NETHOLD, NETSTAT) {
            return Ok(());
        }

        // The demux parity may have been (re)assigned during hold-off.
        if let Some(idx) = self.status.lock().get_u64(TIMEIDX) {
            if idx != self.inner.time_index {
                info!(
                    configured = self.inner.time_index,
                    status = idx,
                    "time index updated from status store"
                );
                self.inner.time_index = idx % self.inner.geom.time_demux as u64;
                self.inner.seq.mcnt_start = self.inner.time_index;
                self.inner.seq.mcnt_log_late =
                    self.inner.geom.mcnt_per_block() + self.inner.time_index;
            }
        }

        match self.inner.acquire_initial_blocks() {
            Err(IngestError::Shutdown) => return Ok(()),
            other => other?,
        }
        self.status.lock().put_str(NETSTAT, "running");

        while self.run.running() {
            match self.input.wait_filled(self.in_idx, WAIT) {
                Wait::TimedOut => continue,
                Wait::Ready => {}
            }
            if !self.run.running() {
                self.input.set_free(self.in_idx);
                break;
            }

            let hdr = self.input.header(self.in_idx);
            let slot = hdr.slot_size as usize;
            let n = hdr.n_frames as usize;
            let payload = self.input.payload(self.in_idx);
            if slot == 0 || n * slot > payload.len() {
                warn!(
                    n_frames = n,
                    slot_size = slot,
                    "raw block header does not fit its ring, skipping block"
                );
            } else {
                for f in 0..n {
                    let frame = &payload[f * slot..(f + 1) * slot];
                    match self.inner.process_packet(frame) {
                        Ok(Some(mcnt)) => {
                            self.status.lock().put_u64(NETMCNT, mcnt);
                        }
                        Ok(None) => {}
                        Err(IngestError::Shutdown) => {
                            self.input.set_free(self.in_idx);
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            self.input.set_free(self.in_idx);
            self.in_idx = (self.in_idx + 1) % self.input.slots();
        }
        Ok(())
    }
}
