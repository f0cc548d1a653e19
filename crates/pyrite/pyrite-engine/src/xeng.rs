//! X-engine visibility reassembly.
//!
//! Packets are keyed by `bcnt`, the monotonic baseline-dump counter.  The
//! reassembler keeps two adjacent output blocks in `FILLING`; the arrival
//! of a packet two blocks ahead is what marks the current block complete.

use crate::{IngestError, copy_stream, hold_off};
use gabbro_blocks::{
    FRAME_HDR_OFF, FRAME_PAYLOAD_OFF, RawFrameHeader, XBlockHeader, XGeom, XPacketHeader,
};
use gabbro_ring::{BlockRing, Wait};
use gabbro_status::{
    BINDPORT, CNETHOLD, CNETSTAT, GIT_VER, MISSEDPK, MISSXENG, NETBCNT, NETBKOUT, Permit, RunFlag,
    StatusStore, WarnThrottle,
};
use pyrite_core::{BlockCounters, ClaimMap, PacketClass, classify};
use std::time::Duration;
use tracing::{info, warn};

/// Out-of-sequence packets absorbed before a resync.
const MAX_OUT_OF_SEQ_PKTS: u64 = 4096;

const WAIT: Duration = Duration::from_millis(500);

/// Anchor state of the reassembler (the `binfo` of the stage).
#[derive(Default)]
struct XSeq {
    initialized: bool,
    /// First `bcnt` of the current block.
    bcnt_start: u32,
    /// Virtual `bcnt` of ring slot 0; rewritten on reset so the anchor
    /// keeps mapping to the slots already held.
    first_bcnt: u32,
    /// Squelch late-packet warnings until the anchor passes this.
    bcnt_log_late: u32,
    /// Ring slot of the current block.
    block_i: usize,
    out_of_seq_cnt: u64,
    /// Last slot marked filled, for fill-order validation.
    last_filled: Option<usize>,
}

/// The reassembly core: consumes one parsed frame at a time and owns the
/// assembled-block ring.  Split from [`XCatcher`] so the packet loop can
/// hold the raw ring while this half mutates freely (and so tests can feed
/// frames directly).
pub struct XReassembler {
    geom: XGeom,
    slots: usize,
    late_threshold: i64,
    out: BlockRing<XBlockHeader>,
    status: StatusStore,
    run: RunFlag,
    throttle: WarnThrottle,
    seq: XSeq,
    counters: BlockCounters,
    pkt_claims: ClaimMap,
    bl_claims: ClaimMap,
}

impl XReassembler {
    pub fn new(
        geom: XGeom,
        out: BlockRing<XBlockHeader>,
        status: StatusStore,
        run: RunFlag,
    ) -> Result<Self, IngestError> {
        geom.validate()?;
        if out.payload_bytes() != geom.block_bytes() {
            return Err(IngestError::Mismatch(
                "assembled ring payload does not match block size",
            ));
        }
        let slots = out.slots();
        if slots < 3 {
            return Err(IngestError::Mismatch(
                "assembled ring needs at least three slots",
            ));
        }
        // Two full ring traversals of slack before a revisiting counter is
        // treated as out-of-sequence rather than late.
        let late_threshold = (2 * geom.baselines_per_block * slots) as i64;
        Ok(Self {
            geom,
            slots,
            late_threshold,
            out,
            status,
            run,
            throttle: WarnThrottle::with_defaults(),
            seq: XSeq::default(),
            counters: BlockCounters::new(slots),
            pkt_claims: ClaimMap::new(slots, geom.packets_per_block()),
            bl_claims: ClaimMap::new(slots, geom.baselines_per_block),
        })
    }

    pub fn geom(&self) -> &XGeom {
        &self.geom
    }

    fn block_for_bcnt(&self, bcnt: u32) -> usize {
        let bpb = self.geom.baselines_per_block as u32;
        (bcnt.wrapping_sub(self.seq.first_bcnt) / bpb) as usize % self.slots
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

    /// Spin for a slot to come free, claim it.  Polls the run flag on
    /// every timeout so a stalled consumer cannot pin shutdown.
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

    /// Claim the first two ring slots before any packet arrives.
    pub fn acquire_initial_blocks(&self) -> Result<(), IngestError> {
        self.acquire_slot(0)?;
        self.acquire_slot(1)
    }

    /// Stamp a freshly acquired block with its first `bcnt`.
    fn initialize_block(&self, bcnt: u32) {
        let idx = self.block_for_bcnt(bcnt);
        // SAFETY: the slot is held in FILLING by this stage.
        let hdr = unsafe { self.out.header_mut(idx) };
        hdr.bcnt[0] = bcnt;
        hdr.good_data = 0;
    }

    fn reset_block_state(&mut self, idx: usize) {
        self.counters.reset(idx);
        self.pkt_claims.reset_block(idx);
        self.bl_claims.reset_block(idx);
    }

    fn lazy_init(&mut self, bcnt: u32) {
        let bpb = self.geom.baselines_per_block as u32;
        self.seq.first_bcnt = bcnt - bcnt % bpb;
        self.seq.bcnt_start = self.seq.first_bcnt;
        self.seq.block_i = self.block_for_bcnt(bcnt);
        self.seq.bcnt_log_late = bpb;
        self.seq.out_of_seq_cnt = 0;
        self.seq.initialized = true;
        info!(bcnt, "first packet seen, initializing reassembly anchor");
        self.initialize_block(self.seq.bcnt_start);
        self.initialize_block(self.seq.bcnt_start.wrapping_add(bpb));
    }

    /// Mark the current block filled and publish its statistics.
    /// Returns the first `bcnt` of the block.
    fn set_block_filled(&mut self) -> u32 {
        let block_i = self.block_for_bcnt(self.seq.bcnt_start);

        // Fill-order validation: filled slots must walk the ring.
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
                "anchor bcnt and anchor block index disagree"
            );
        }

        let count = self.counters.get(block_i);
        let expected_pkts = self.geom.packets_per_block() as u64;
        let filled_bcnt;
        {
            // SAFETY: the slot is still held in FILLING by this stage.
            let hdr = unsafe { self.out.header_mut(block_i) };
            if count == expected_pkts {
                hdr.good_data = 1;
            }
            filled_bcnt = hdr.bcnt[0];
        }
        self.out.set_filled(block_i);
        self.seq.last_filled = Some(block_i);

        let missing = expected_pkts - count;
        let missed_xengs = missing / self.geom.packets_per_xeng() as u64;
        let stray = missing % self.geom.packets_per_xeng() as u64;
        {
            let mut st = self.status.lock();
            st.put_u64(NETBKOUT, block_i as u64);
            st.put_u64(MISSXENG, missed_xengs);
            if stray != 0 {
                // Get-then-put so operators can zero the counter.
                let total = st.get_u64(MISSEDPK).unwrap_or(0) + missing;
                st.put_u64(MISSEDPK, total);
            }
        }
        if stray != 0 {
            warn!(
                bcnt = self.seq.bcnt_start,
                expected = expected_pkts,
                got = count,
                "block published with missing packets"
            );
        }
        filled_bcnt
    }

    /// Resync after too many out-of-sequence packets: snap the anchor to
    /// the triggering packet's block, keeping the two held ring slots.
    fn reset_to(&mut self, bcnt: u32) {
        let bpb = self.geom.baselines_per_block as u32;
        self.seq.bcnt_start = bcnt - bcnt % bpb;
        self.seq.first_bcnt = self
            .seq
            .bcnt_start
            .wrapping_sub(self.seq.block_i as u32 * bpb);
        self.seq.bcnt_log_late = self.seq.bcnt_start.wrapping_add(2 * bpb);
        self.seq.out_of_seq_cnt = 0;

        warn!(
            first_bcnt = self.seq.first_bcnt,
            bcnt_start = self.seq.bcnt_start,
            block = self.seq.block_i,
            pkt_bcnt = bcnt,
            "too many out-of-sequence packets, resetting anchor"
        );

        let cur = self.seq.block_i;
        let next = (cur + 1) % self.slots;
        self.reset_block_state(cur);
        self.reset_block_state(next);
        self.initialize_block(self.seq.bcnt_start);
        self.initialize_block(self.seq.bcnt_start.wrapping_add(bpb));
    }

    /// Route one padded frame.  Returns the first `bcnt` of a block if
    /// this packet caused one to be marked filled.
    pub fn process_packet(&mut self, frame: &[u8]) -> Result<Option<u32>, IngestError> {
        let Some(hdr) = XPacketHeader::parse(&frame[FRAME_HDR_OFF..]) else {
            self.warn_throttled("dropping truncated frame");
            return Ok(None);
        };
        let nbytes = self.geom.payload_bytes();
        if hdr.payload_len as usize != nbytes || frame.len() < FRAME_PAYLOAD_OFF + nbytes {
            self.warn_throttled(&format!(
                "dropping frame with bad payload length {}",
                hdr.payload_len
            ));
            return Ok(None);
        }

        if !self.seq.initialized {
            self.lazy_init(hdr.bcnt);
        }

        let bpb = self.geom.baselines_per_block;
        let pkt_block = self.block_for_bcnt(hdr.bcnt);
        let dist = hdr.bcnt.wrapping_sub(self.seq.bcnt_start) as i32 as i64;
        let mut netbcnt = None;

        let class = classify(dist, bpb as i64, self.late_threshold);
        match class {
            PacketClass::InWindow | PacketClass::Advance => {
                if class == PacketClass::Advance {
                    netbcnt = Some(self.set_block_filled());

                    self.seq.bcnt_start = self.seq.bcnt_start.wrapping_add(bpb as u32);
                    self.seq.block_i = (self.seq.block_i + 1) % self.slots;
                    self.seq.out_of_seq_cnt = 0;

                    if pkt_block != (self.seq.block_i + 1) % self.slots {
                        warn!(
                            expected = (self.seq.block_i + 1) % self.slots,
                            got = pkt_block,
                            "packet advancing the anchor lands off the next block"
                        );
                    }

                    self.reset_block_state(pkt_block);
                    self.acquire_slot(pkt_block)?;
                    self.initialize_block(self.seq.bcnt_start.wrapping_add(bpb as u32));

                    self.status.lock().put_str(CNETSTAT, "running");
                }

                let b = (hdr.bcnt % bpb as u32) as usize;
                let parity = self.geom.time_parity(hdr.mcnt);
                let xeng = hdr.xeng_id as usize % self.geom.n_xeng_per_time;
                let chunk = hdr.offset as usize;
                if chunk >= self.geom.chunks_per_xeng() {
                    self.warn_throttled(&format!("dropping frame with bad chunk offset {chunk}"));
                    return Ok(netbcnt);
                }

                let slot = self.geom.pkt_slot(b, parity, xeng, chunk);
                if !self.pkt_claims.try_claim(pkt_block, slot) {
                    self.warn_throttled(&format!("duplicate packet for bcnt {}", hdr.bcnt));
                    self.seq.out_of_seq_cnt += 1;
                    return Ok(netbcnt);
                }

                let src = &frame[FRAME_PAYLOAD_OFF..FRAME_PAYLOAD_OFF + nbytes];
                // SAFETY: pkt_block is held in FILLING by this stage.
                let dst = unsafe {
                    &mut self.out.payload_mut(pkt_block)[slot * nbytes..(slot + 1) * nbytes]
                };
                copy_stream(dst, src);

                // First packet of a baseline promotes its header fields.
                if self.bl_claims.try_claim(pkt_block, b) {
                    // SAFETY: as above.
                    let blk = unsafe { self.out.header_mut(pkt_block) };
                    blk.mcnt[b] = self.geom.base_mcnt(hdr.mcnt);
                    blk.bcnt[b] = hdr.bcnt;
                    blk.ant_pair_0[b] = hdr.ant0;
                    blk.ant_pair_1[b] = hdr.ant1;
                }
                self.counters.incr(pkt_block);
            }

            PacketClass::Late => {
                if self.seq.bcnt_start >= self.seq.bcnt_log_late {
                    self.warn_throttled(&format!("ignoring late packet ({} bcnts late)", -dist));
                }
            }

            PacketClass::OutOfSeq => {
                if self.seq.out_of_seq_cnt == 0 {
                    self.warn_throttled(&format!(
                        "out of seq bcnt {:#010x} (expected {:#010x} <= bcnt < {:#010x})",
                        hdr.bcnt,
                        self.seq.bcnt_start,
                        self.seq.bcnt_start.wrapping_add(3 * bpb as u32)
                    ));
                }
                self.seq.out_of_seq_cnt += 1;
                if self.seq.out_of_seq_cnt > MAX_OUT_OF_SEQ_PKTS {
                    self.reset_to(hdr.bcnt);
                }
            }
        }

        Ok(netbcnt)
    }
}

/// The X-engine ingest stage loop: raw packet ring in, assembled blocks
/// out.
pub struct XCatcher {
    input: BlockRing<RawFrameHeader>,
    inner: XReassembler,
    status: StatusStore,
    run: RunFlag,
    in_idx: usize,
}

impl XCatcher {
    pub fn new(input: BlockRing<RawFrameHeader>, inner: XReassembler) -> Self {
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
            st.put_u64(MISSXENG, 0);
            st.put_u64(MISSEDPK, 0);
            if let Some(port) = st.get_i64(BINDPORT) {
                info!(port, "packet source bind port");
            }
        }

        if !hold_off(&self.status, &self.run, CNETHOLD, CNETSTAT) {
            return Ok(());
        }

        match self.inner.acquire_initial_blocks() {
            Err(IngestError::Shutdown) => return Ok(()),
            other => other?,
        }
        self.status.lock().put_str(CNETSTAT, "running");

        while self.run.running() {
            // Senders pause between dumps; timeouts here are routine and
            // exist to keep the run flag polled.
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
                        Ok(Some(bcnt)) => {
                            self.status.lock().put_u64(NETBCNT, bcnt as u64);
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
