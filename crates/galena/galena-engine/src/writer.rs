//! The disk writer loop and its file-rollover state machine.

use crate::{AutocorrFeeder, WriterError, i32_bytes, payload_i32};
use gabbro_blocks::{MAX_ANTS_TOTAL, TimeBase, XBlockHeader, XGeom, time::unix_to_jd};
use gabbro_control::{ControlError, ControlStore};
use gabbro_mmap::AlignedBuf;
use gabbro_ring::{BlockRing, Wait};
use gabbro_status::{
    BDANANT, DISKBCNT, DISKBKIN, DISKGBPS, DISKMCNT, DISKSTAT, DUMPMS, FILESEC, INTTIME, NBL2SEC,
    NBL4SEC, NBL8SEC, NBL16SEC, NDONEFIL, NFILES, RunFlag, StatusStore, SYNCTIME, TAG, TRIGGER,
};
use galena_core::{FileMeta, FileNames, MetaSink, bcnts_per_file, files, sum_diff};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

const WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DiskWriterConfig {
    /// Adjacent input channels summed per output channel.
    pub chan_sum: usize,
    /// Baselines per kernel stride.
    pub n_bl_per_write: usize,
    /// Whether to emit the difference stream alongside the sum.
    pub write_diff: bool,
    /// Root under which per-JD session directories are created.
    pub out_dir: PathBuf,
    pub sample_rate_hz: f64,
    pub n_chan_generated: u64,
}

impl Default for DiskWriterConfig {
    fn default() -> Self {
        Self {
            chan_sum: 1,
            n_bl_per_write: 32,
            write_diff: true,
            out_dir: PathBuf::from("."),
            sample_rate_hz: 500e6,
            n_chan_generated: 8192,
        }
    }
}

/// Handles and accumulators of the file set currently open.
struct OpenFiles {
    /// First `bcnt` of this file; always a multiple of `bcnts_per_file`.
    file_bcnt: u64,
    sum: File,
    sum_path: PathBuf,
    diff: Option<(File, PathBuf)>,
    meta_path: PathBuf,
    /// UNIX time of the file's first spectrum.
    start_t: f64,
    /// Baseline rows written so far.
    nblts: usize,
}

pub struct DiskWriter {
    geom: XGeom,
    cfg: DiskWriterConfig,
    input: BlockRing<XBlockHeader>,
    autocorr: AutocorrFeeder,
    status: StatusStore,
    control: Box<dyn ControlStore>,
    meta_sink: Box<dyn MetaSink>,
    run: RunFlag,

    buf_sum: AlignedBuf<i32>,
    buf_diff: AlignedBuf<i32>,

    /// Correlator index → real antenna number; -1 until fetched.
    corr_map: Vec<i32>,
    integration_buf: Vec<f64>,
    time_buf: Vec<f64>,
    ant0_buf: Vec<i32>,
    ant1_buf: Vec<i32>,

    open: Option<OpenFiles>,
    session_dir: PathBuf,
    bcnts_per_file: u64,
    file_cnt: u32,
    nfiles: u32,
    tag: String,
    acc_len: u32,
    sync_time_ms: u64,
    idle: bool,
    cur_in: usize,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Fill the per-file metadata rows for one run of baselines.
///
/// Free function (not a method) so callers can hold the open-file handle
/// and these accumulators at the same time.
#[allow(clippy::too_many_arguments)]
fn stamp_rows(
    hdr: &XBlockHeader,
    corr_map: &[i32],
    integration: &[f64],
    time_buf: &mut [f64],
    ant0: &mut [i32],
    ant1: &mut [i32],
    tb: &TimeBase,
    hdr_base: usize,
    file_offset: usize,
    n: usize,
) {
    for b in 0..n {
        let fo = file_offset + b;
        let hb = hdr_base + b;
        if fo >= time_buf.len() || hb >= hdr.bcnt.len() {
            break;
        }
        ant0[fo] = corr_map
            .get(hdr.ant_pair_0[hb] as usize)
            .copied()
            .unwrap_or(-1);
        ant1[fo] = corr_map
            .get(hdr.ant_pair_1[hb] as usize)
            .copied()
            .unwrap_or(-1);
        time_buf[fo] = tb.jd_from_mcnt(hdr.mcnt[hb], integration[fo]);
    }
}

impl DiskWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        geom: XGeom,
        cfg: DiskWriterConfig,
        input: BlockRing<XBlockHeader>,
        autocorr: AutocorrFeeder,
        status: StatusStore,
        control: Box<dyn ControlStore>,
        meta_sink: Box<dyn MetaSink>,
        run: RunFlag,
    ) -> Result<Self, WriterError> {
        geom.validate()?;
        if cfg.chan_sum == 0 || geom.n_chan_total % cfg.chan_sum != 0 {
            return Err(WriterError::Mismatch(
                "chan_sum must divide the channel count exactly",
            ));
        }
        if cfg.n_bl_per_write == 0 || geom.baselines_per_block % cfg.n_bl_per_write != 0 {
            return Err(WriterError::Mismatch(
                "baseline stride must divide the block exactly",
            ));
        }
        if input.payload_bytes() != geom.block_bytes() {
            return Err(WriterError::Mismatch(
                "input ring payload does not match block size",
            ));
        }

        let stride_words =
            cfg.n_bl_per_write * (geom.n_chan_total / cfg.chan_sum) * geom.n_stokes * 2;
        Ok(Self {
            geom,
            input,
            autocorr,
            status,
            control,
            meta_sink,
            run,
            buf_sum: AlignedBuf::zeroed(stride_words),
            buf_diff: AlignedBuf::zeroed(stride_words),
            corr_map: vec![-1; MAX_ANTS_TOTAL],
            integration_buf: vec![0.0; 1],
            time_buf: vec![0.0; 1],
            ant0_buf: vec![0; 1],
            ant1_buf: vec![0; 1],
            open: None,
            session_dir: cfg.out_dir.clone(),
            bcnts_per_file: 0,
            file_cnt: 0,
            nfiles: 1,
            tag: String::new(),
            acc_len: 0,
            sync_time_ms: 0,
            // Idle until the first trigger arrives with a baseline
            // distribution; bcnts_per_file is undefined before that.
            idle: true,
            cur_in: 0,
            cfg,
        })
    }

    fn timebase(&self) -> TimeBase {
        TimeBase {
            sync_time_ms: self.sync_time_ms,
            sample_rate_hz: self.cfg.sample_rate_hz,
            n_chan_generated: self.cfg.n_chan_generated,
        }
    }

    fn control_try(
        &mut self,
        what: &str,
        f: impl FnOnce(&mut dyn ControlStore) -> Result<(), ControlError>,
    ) {
        match f(self.control.as_mut()) {
            Ok(()) => {}
            Err(ControlError::NotConnected) => debug!("control: {what} skipped, not connected"),
            Err(e) => warn!("control: {what} failed: {e}"),
        }
    }

    /// Refetch the correlator-to-antenna map and per-baseline integration
    /// times.  A failed fetch keeps the last-known values.
    fn refresh_map_and_bins(&mut self) {
        match self.control.corr_to_ant_map(MAX_ANTS_TOTAL) {
            Ok(map) => {
                self.corr_map.fill(-1);
                self.corr_map[..map.len()].copy_from_slice(&map);
            }
            Err(e) => warn!("keeping last-known antenna map: {e}"),
        }
        match self.control.integration_bins() {
            Ok(bins) => {
                // The store holds accumulation bins; real seconds are
                // bins × the dump cadence.
                let scale = self.acc_len as f64
                    * self.geom.time_demux as f64
                    * 2.0
                    * self.cfg.n_chan_generated as f64
                    / self.cfg.sample_rate_hz;
                let last = bins.last().copied().unwrap_or(0.0);
                for (i, slot) in self.integration_buf.iter_mut().enumerate() {
                    *slot = bins.get(i).copied().unwrap_or(last) * scale;
                }
            }
            Err(e) => warn!("keeping last-known integration bins: {e}"),
        }
    }

    /// Close the open file set: write its metadata sidecar, close the data
    /// files, and publish the paths.
    fn finalize_file(&mut self, open: OpenFiles, stop_mcnt: u64) -> Result<(), WriterError> {
        let tb = self.timebase();
        let duration = tb.mcnt_to_unix(stop_mcnt) - open.start_t;

        let mut meta = FileMeta {
            t0: self.sync_time_ms,
            mcnt: stop_mcnt,
            nfreq: (self.geom.n_chan_total / self.cfg.chan_sum) as u64,
            nstokes: self.geom.n_stokes as u64,
            corr_ver: env!("CARGO_PKG_VERSION").to_owned(),
            tag: self.tag.clone(),
            ant_0_array: self.ant0_buf[..open.nblts].to_vec(),
            ant_1_array: self.ant1_buf[..open.nblts].to_vec(),
            time_array: self.time_buf[..open.nblts].to_vec(),
            integration_time: self.integration_buf[..open.nblts].to_vec(),
        };
        meta.clamp_strings();
        self.meta_sink.write(&open.meta_path, &meta)?;

        // Dropping the handles closes the data files.
        let sum_path = open.sum_path.display().to_string();
        let diff_path = open.diff.as_ref().map(|(_, p)| p.display().to_string());
        drop(open);

        self.file_cnt += 1;
        info!(file = %sum_path, nblts = meta.ant_0_array.len(), "closed output file");

        self.control_try("publish finished file", |c| c.push_raw_file(&sum_path));
        if let Some(p) = diff_path {
            self.control_try("publish finished file", |c| c.push_raw_file(&p));
        }

        let mut st = self.status.lock();
        st.put_f64(FILESEC, duration);
        st.put_u64(NDONEFIL, self.file_cnt as u64);
        Ok(())
    }

    /// Open a fresh sum/diff/meta file set starting at `break_bcnt`.
    fn open_files(&mut self, break_bcnt: u64, start_t: f64) -> Result<(), WriterError> {
        let jd = unix_to_jd(start_t);
        if self.file_cnt == 0 {
            self.session_dir = files::session_dir(&self.cfg.out_dir, jd);
            info!(dir = %self.session_dir.display(), "creating session directory");
            fs::create_dir_all(&self.session_dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.session_dir, fs::Permissions::from_mode(0o777))?;
            }
        }

        let names = FileNames::at(&self.session_dir, jd);
        info!(file = %names.sum.display(), bcnt = break_bcnt, "opening output file");
        let sum = File::create(&names.sum)?;
        let diff = if self.cfg.write_diff {
            Some((File::create(&names.diff)?, names.diff.clone()))
        } else {
            None
        };

        let now = unix_now();
        let sum_str = names.sum.display().to_string();
        self.control_try("publish current file", |c| c.set_current_file(&sum_str, now));

        self.ant0_buf.fill(0);
        self.ant1_buf.fill(0);
        self.time_buf.fill(0.0);

        self.open = Some(OpenFiles {
            file_bcnt: break_bcnt,
            sum,
            sum_path: names.sum,
            diff,
            meta_path: names.meta,
            start_t,
            nblts: 0,
        });
        Ok(())
    }

    /// Sum/diff and dispatch one assembled block, splitting strides across
    /// file boundaries as needed.
    fn write_block(&mut self, hdr: &XBlockHeader, block: &[i32]) -> Result<(), WriterError> {
        let bpf = self.bcnts_per_file;
        let nbw = self.cfg.n_bl_per_write;
        let words_per_bl = (self.geom.n_chan_total / self.cfg.chan_sum) * self.geom.n_stokes * 2;
        let tb = self.timebase();
        let bpb = self.geom.baselines_per_block;

        let mut bctr = 0;
        while bctr < bpb {
            let strt_bcnt = hdr.bcnt[bctr] as u64;
            let stop_bcnt = hdr.bcnt[bctr + nbw - 1] as u64;

            sum_diff(
                &self.geom,
                self.cfg.chan_sum,
                block,
                bctr,
                nbw,
                &mut self.buf_sum,
                &mut self.buf_diff,
            );

            let same_file = strt_bcnt / bpf == stop_bcnt / bpf && strt_bcnt % bpf != 0;
            if same_file {
                // Whole stride belongs to the file already open (if any;
                // with no file open, data before the first boundary is
                // discarded).
                if let Some(open) = self.open.as_mut() {
                    match strt_bcnt.checked_sub(open.file_bcnt) {
                        Some(off) if off + nbw as u64 <= bpf => {
                            open.sum
                                .write_all(i32_bytes(&self.buf_sum[..nbw * words_per_bl]))?;
                            if let Some((df, _)) = open.diff.as_mut() {
                                df.write_all(i32_bytes(&self.buf_diff[..nbw * words_per_bl]))?;
                            }
                            open.nblts += nbw;
                            stamp_rows(
                                hdr,
                                &self.corr_map,
                                &self.integration_buf,
                                &mut self.time_buf,
                                &mut self.ant0_buf,
                                &mut self.ant1_buf,
                                &tb,
                                bctr,
                                off as usize,
                                nbw,
                            );
                        }
                        _ => {
                            // Counter jump (reassembler reset): the stride
                            // is outside the open file.  Skip; the next
                            // boundary resyncs the rollover.
                            warn!(
                                strt_bcnt,
                                file_bcnt = open.file_bcnt,
                                "stride outside the open file, skipping"
                            );
                        }
                    }
                }
            } else {
                // This stride contains a file boundary, or starts exactly
                // on one.
                let break_bcnt = files::next_boundary(strt_bcnt, bpf);

                if let Some(mut open) = self.open.take() {
                    let nbls = ((break_bcnt - strt_bcnt) as usize).min(nbw);
                    if nbls > 0 {
                        match strt_bcnt.checked_sub(open.file_bcnt) {
                            Some(off) if off + nbls as u64 <= bpf => {
                                open.sum
                                    .write_all(i32_bytes(&self.buf_sum[..nbls * words_per_bl]))?;
                                if let Some((df, _)) = open.diff.as_mut() {
                                    df.write_all(i32_bytes(
                                        &self.buf_diff[..nbls * words_per_bl],
                                    ))?;
                                }
                                open.nblts += nbls;
                                stamp_rows(
                                    hdr,
                                    &self.corr_map,
                                    &self.integration_buf,
                                    &mut self.time_buf,
                                    &mut self.ant0_buf,
                                    &mut self.ant1_buf,
                                    &tb,
                                    bctr,
                                    off as usize,
                                    nbls,
                                );
                            }
                            _ => {
                                warn!(
                                    strt_bcnt,
                                    file_bcnt = open.file_bcnt,
                                    "prefix outside the open file, skipping"
                                );
                            }
                        }
                    }

                    let stop_idx = (bctr + nbls).min(bpb - 1);
                    self.finalize_file(open, hdr.mcnt[stop_idx])?;

                    if self.file_cnt >= self.nfiles {
                        info!(
                            files = self.file_cnt,
                            "wrote all requested files, going idle"
                        );
                        return Ok(());
                    }
                }

                // Open the next file and land the stride's tail in it.
                let block_offset = (bctr + (break_bcnt - strt_bcnt) as usize).min(bpb - 1);
                let start_t = tb.mcnt_to_unix(hdr.mcnt[block_offset]);
                self.open_files(break_bcnt, start_t)?;
                self.refresh_map_and_bins();

                let tail = ((stop_bcnt + 1).saturating_sub(break_bcnt) as usize).min(nbw);
                let buf_off = (break_bcnt - strt_bcnt) as usize;
                if tail > 0 && buf_off < nbw {
                    let open = self.open.as_mut().expect("file set opened above");
                    open.sum.write_all(i32_bytes(
                        &self.buf_sum[buf_off * words_per_bl..(buf_off + tail) * words_per_bl],
                    ))?;
                    if let Some((df, _)) = open.diff.as_mut() {
                        df.write_all(i32_bytes(
                            &self.buf_diff[buf_off * words_per_bl..(buf_off + tail) * words_per_bl],
                        ))?;
                    }
                    open.nblts += tail;
                    stamp_rows(
                        hdr,
                        &self.corr_map,
                        &self.integration_buf,
                        &mut self.time_buf,
                        &mut self.ant0_buf,
                        &mut self.ant1_buf,
                        &tb,
                        block_offset,
                        0,
                        tail,
                    );
                }
            }

            bctr += nbw;
        }
        Ok(())
    }

    /// Stage loop.  Fatal errors publish `DISKSTAT = error` and request
    /// process shutdown before returning.
    pub fn run(&mut self) -> Result<(), WriterError> {
        let res = self.run_inner();
        if let Err(ref e) = res {
            error!("disk writer fatal: {e}");
            self.status.lock().put_str(DISKSTAT, "error");
            self.run.shutdown();
        }
        res
    }

    fn run_inner(&mut self) -> Result<(), WriterError> {
        {
            let mut st = self.status.lock();
            st.put_u64(DISKMCNT, 0);
            st.put_u64(TRIGGER, 0);
            st.put_u64(NDONEFIL, 0);
        }

        let cwd = self.cfg.out_dir.display().to_string();
        let now = unix_now();
        self.control_try("publish catcher cwd", |c| c.set_catcher_cwd(&cwd));
        self.control_try("publish idle state", |c| c.set_taking_data(false, now));
        self.control_try("publish current file", |c| c.set_current_file("NONE", now));

        while self.run.running() {
            self.status
                .lock()
                .put_str(DISKSTAT, if self.idle { "idle" } else { "waiting" });

            // Keep the liveness key fresh; its expiry tells operators the
            // pipeline died.
            self.control_try("refresh taking-data expiry", |c| c.refresh_taking_data());

            match self.input.wait_filled(self.cur_in, WAIT) {
                Wait::TimedOut => {
                    self.status.lock().put_str(DISKSTAT, "blocked_in");
                    continue;
                }
                Wait::Ready => {}
            }
            if !self.run.running() {
                self.input.set_free(self.cur_in);
                break;
            }

            let hdr = self.input.header(self.cur_in);
            // SAFETY: this stage owns the slot from the FILLED observation
            // above until set_free below; detaching the lifetime lets the
            // block be read alongside the writer's own state.
            let block: &[i32] = {
                let p = self.input.payload(self.cur_in);
                let words = payload_i32(p);
                unsafe { std::slice::from_raw_parts(words.as_ptr(), words.len()) }
            };

            let nants;
            {
                let mut st = self.status.lock();
                st.put_str(DISKSTAT, "writing");
                st.put_u64(DISKBKIN, self.cur_in as u64);
                st.put_u64(DISKMCNT, hdr.mcnt[0]);
                st.put_u64(DISKBCNT, hdr.bcnt[0] as u64);
                nants = st.get_u64(BDANANT).unwrap_or(0);
            }

            // Autocorr side stream runs regardless of the trigger state,
            // but only once the antenna map is known.
            if nants > 0 && self.corr_map[0] >= 0 {
                let tb = self.timebase();
                self.autocorr
                    .feed(&hdr, block, &self.corr_map, nants as u32, &tb);
            }

            let trigger;
            {
                let mut st = self.status.lock();
                if let Some(v) = st.get_u64(SYNCTIME) {
                    self.sync_time_ms = v;
                }
                if let Some(v) = st.get_u64(INTTIME) {
                    self.acc_len = v as u32;
                }
                if let Some(v) = st.get_u64(NFILES) {
                    self.nfiles = v as u32;
                }
                st.put_u64(NDONEFIL, self.file_cnt as u64);
                if let Some(t) = st.get_str(TAG) {
                    self.tag = t;
                }
                trigger = st.get_u64(TRIGGER).unwrap_or(0) != 0;
            }

            if trigger {
                info!(nfiles = self.nfiles, "got a new trigger");
                self.file_cnt = 0;

                let dist;
                {
                    let mut st = self.status.lock();
                    st.put_u64(TRIGGER, 0);
                    st.put_u64(NDONEFIL, 0);
                    dist = [
                        st.get_u64(NBL2SEC).unwrap_or(0),
                        st.get_u64(NBL4SEC).unwrap_or(0),
                        st.get_u64(NBL8SEC).unwrap_or(0),
                        st.get_u64(NBL16SEC).unwrap_or(0),
                    ];
                }

                let per_file = bcnts_per_file(dist);
                if per_file == 0 {
                    warn!("trigger with an empty baseline distribution, staying idle");
                    self.idle = true;
                } else {
                    self.bcnts_per_file = per_file;
                    info!(
                        n2 = dist[0],
                        n4 = dist[1],
                        n8 = dist[2],
                        n16 = dist[3],
                        bcnts_per_file = per_file,
                        "baseline distribution per file"
                    );
                    self.integration_buf = vec![0.0; per_file as usize];
                    self.time_buf = vec![0.0; per_file as usize];
                    self.ant0_buf = vec![0; per_file as usize];
                    self.ant1_buf = vec![0; per_file as usize];
                    self.idle = false;

                    let now = unix_now();
                    self.control_try("publish taking-data", |c| c.set_taking_data(true, now));
                }
            } else if self.file_cnt >= self.nfiles || self.idle {
                if !self.idle {
                    let now = unix_now();
                    self.control_try("publish idle state", |c| c.set_taking_data(false, now));
                    self.control_try("notify new session", |c| c.notify_new_session());
                }
                self.idle = true;
                self.input.set_free(self.cur_in);
                self.cur_in = (self.cur_in + 1) % self.input.slots();
                continue;
            }
            if self.idle {
                self.input.set_free(self.cur_in);
                self.cur_in = (self.cur_in + 1) % self.input.slots();
                continue;
            }

            let block_start = Instant::now();
            self.write_block(&hdr, block)?;
            let elapsed = block_start.elapsed();

            {
                let streams = if self.cfg.write_diff { 2u64 } else { 1 };
                let bits = streams
                    * (self.geom.baselines_per_block
                        * (self.geom.n_chan_total / self.cfg.chan_sum)
                        * self.geom.n_stokes
                        * 2
                        * 4) as u64
                    * 8;
                let ns = elapsed.as_nanos().max(1) as f64;
                let mut st = self.status.lock();
                st.put_f64(DISKGBPS, bits as f64 / ns);
                st.put_f64(DUMPMS, ns / 1e6);
            }

            self.input.set_free(self.cur_in);
            self.cur_in = (self.cur_in + 1) % self.input.slots();
        }

        // Idempotent cleanup: close any half-written file set.  No
        // metadata is written for it.
        if let Some(open) = self.open.take() {
            warn!(file = %open.sum_path.display(), "shutdown with an open file, closing");
        }
        Ok(())
    }
}
