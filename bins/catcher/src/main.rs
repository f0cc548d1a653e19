use anyhow::Context;
use gabbro_blocks::{
    AutocorrHeader, FBlockHeader, FGeom, RawFrameHeader, XBlockHeader, XGeom, frame_slot_size,
};
use gabbro_control::{ControlStore, MemoryControl, RedisControl};
use gabbro_ring::{BlockRing, RingConfig};
use gabbro_status::{RunFlag, StatusStore, TIMEIDX};
use galena_config::DiskConfig;
use galena_core::JsonMetaSink;
use galena_engine::{AutocorrFeeder, DiskWriter, DiskWriterConfig};
use pyrite_config::IngestConfig;
use pyrite_engine::{FCatcher, FReassembler, XCatcher, XReassembler};
use serde::Deserialize;
use std::path::PathBuf;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Which packet stream this catcher instance ingests.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Mode {
    /// X-engine visibilities: reassembler + sum/diff disk writer.
    Xengine,
    /// F-engine voltages: reassembler only; the correlator consumes the
    /// assembled ring.
    Fengine,
}

#[derive(Deserialize, Debug)]
#[serde(default)]
struct CatcherConfig {
    mode: Mode,
    xgeom: XGeom,
    fgeom: FGeom,
    ingest: IngestConfig,
    disk: DiskConfig,
}

impl Default for CatcherConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Xengine,
            xgeom: XGeom::default(),
            fgeom: FGeom::default(),
            ingest: IngestConfig::default(),
            disk: DiskConfig::default(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO")),
        )
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "catcher.toml".into());
    let config: CatcherConfig = match std::fs::read_to_string(&config_path) {
        Ok(text) => toml::from_str(&text).with_context(|| format!("parsing {config_path}"))?,
        Err(e) => {
            info!("no config at {config_path} ({e}); using defaults");
            CatcherConfig::default()
        }
    };

    let status = StatusStore::new();
    let run = RunFlag::new();

    status.lock().put_u64(TIMEIDX, config.ingest.time_index);

    {
        let run = run.clone();
        ctrlc::set_handler(move || {
            eprintln!("shutdown requested");
            run.shutdown();
        })
        .context("installing the shutdown handler")?;
    }

    match config.mode {
        Mode::Xengine => run_xengine(config, status, run),
        Mode::Fengine => run_fengine(config, status, run),
    }
}

fn run_xengine(config: CatcherConfig, status: StatusStore, run: RunFlag) -> anyhow::Result<()> {
    let geom = config.xgeom;
    let ingest = &config.ingest;
    let disk = &config.disk;

    info!(
        baselines = geom.baselines_per_block,
        chans = geom.n_chan_total,
        xengs = geom.n_xeng_per_time,
        "CATCHER: X-engine mode"
    );

    // Create the shared rings; every stage then opens its own handle.
    let frame_slot = frame_slot_size(geom.payload_bytes());
    BlockRing::<RawFrameHeader>::create(
        &ingest.raw_ring,
        RingConfig {
            slots: ingest.raw_slots,
            payload_bytes: ingest.frames_per_block * frame_slot,
        },
    )
    .context("creating the raw packet ring")?;
    BlockRing::<XBlockHeader>::create(
        &ingest.blocks_ring,
        RingConfig {
            slots: ingest.ring_slots,
            payload_bytes: geom.block_bytes(),
        },
    )
    .context("creating the assembled block ring")?;
    BlockRing::<AutocorrHeader>::create(
        &disk.autocorr_ring,
        RingConfig {
            slots: disk.autocorr_slots,
            payload_bytes: disk.n_ants_total * geom.words_per_parity() * 4,
        },
    )
    .context("creating the autocorr ring")?;

    let reassembler = XReassembler::new(
        geom,
        BlockRing::open(&ingest.blocks_ring)?,
        status.clone(),
        run.clone(),
    )?;
    let mut net = XCatcher::new(BlockRing::open(&ingest.raw_ring)?, reassembler);

    let control: Box<dyn ControlStore> = match &disk.control_addr {
        Some(addr) => Box::new(RedisControl::new(addr.clone())),
        None => Box::new(MemoryControl::new()),
    };
    let feeder = AutocorrFeeder::new(
        geom,
        disk.n_ants_total,
        disk.autocorr_integration_secs,
        BlockRing::open(&disk.autocorr_ring)?,
        run.clone(),
    )?;
    let mut writer = DiskWriter::new(
        geom,
        DiskWriterConfig {
            chan_sum: disk.chan_sum,
            n_bl_per_write: disk.n_bl_per_write,
            write_diff: disk.write_diff,
            out_dir: PathBuf::from(&disk.out_dir),
            sample_rate_hz: disk.sample_rate_hz,
            n_chan_generated: disk.n_chan_generated,
        },
        BlockRing::open(&ingest.blocks_ring)?,
        feeder,
        status.clone(),
        control,
        Box::new(JsonMetaSink),
        run.clone(),
    )?;

    let net_thread = thread::Builder::new()
        .name("catcher-net".into())
        .spawn(move || net.run())
        .context("spawning the net stage")?;
    let disk_thread = thread::Builder::new()
        .name("catcher-disk".into())
        .spawn(move || writer.run())
        .context("spawning the disk stage")?;

    let net_res = net_thread.join().expect("net stage panicked");
    let disk_res = disk_thread.join().expect("disk stage panicked");
    report("net", net_res.map_err(anyhow::Error::from));
    report("disk", disk_res.map_err(anyhow::Error::from));
    info!("catcher stopped");
    Ok(())
}

fn run_fengine(config: CatcherConfig, status: StatusStore, run: RunFlag) -> anyhow::Result<()> {
    let geom = config.fgeom;
    let ingest = &config.ingest;

    info!(
        ants = geom.n_ants,
        time_index = config.ingest.time_index,
        "CATCHER: F-engine mode"
    );

    let frame_slot = frame_slot_size(geom.payload_bytes());
    BlockRing::<RawFrameHeader>::create(
        &ingest.raw_ring,
        RingConfig {
            slots: ingest.raw_slots,
            payload_bytes: ingest.frames_per_block * frame_slot,
        },
    )
    .context("creating the raw packet ring")?;
    BlockRing::<FBlockHeader>::create(
        &ingest.blocks_ring,
        RingConfig {
            slots: ingest.ring_slots,
            payload_bytes: geom.block_bytes(),
        },
    )
    .context("creating the assembled block ring")?;

    let reassembler = FReassembler::new(
        geom,
        ingest.time_index,
        BlockRing::open(&ingest.blocks_ring)?,
        status.clone(),
        run.clone(),
    )?;
    let mut net = FCatcher::new(BlockRing::open(&ingest.raw_ring)?, reassembler);

    let net_thread = thread::Builder::new()
        .name("catcher-net".into())
        .spawn(move || net.run())
        .context("spawning the net stage")?;

    let net_res = net_thread.join().expect("net stage panicked");
    report("net", net_res.map_err(anyhow::Error::from));
    info!("catcher stopped");
    Ok(())
}

fn report(stage: &str, res: anyhow::Result<()>) {
    match res {
        Ok(()) => info!("{stage} stage exited cleanly"),
        Err(e) => error!("{stage} stage failed: {e:#}"),
    }
}
