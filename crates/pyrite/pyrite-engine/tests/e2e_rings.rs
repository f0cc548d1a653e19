//! End-to-end ingest test: a producer thread plays packet source, the
//! X-engine stage runs its real loop (hold-off included), and a consumer
//! drains the assembled ring — all over mmap-backed rings.

use gabbro_blocks::{
    FRAME_HDR_OFF, FRAME_PAYLOAD_OFF, RawFrameHeader, XBlockHeader, XGeom, XPacketHeader,
    frame_slot_size,
};
use gabbro_ring::{BlockRing, RingConfig, Wait};
use gabbro_status::{CNETHOLD, NETBCNT, RunFlag, StatusStore};
use pyrite_engine::{XCatcher, XReassembler};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn test_path(tag: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("/tmp/pyrite_e2e_{tag}_{}_{ts}", std::process::id())
}

fn geom() -> XGeom {
    XGeom {
        baselines_per_block: 8,
        time_demux: 2,
        n_xeng_per_time: 2,
        n_chan_total: 16,
        chan_per_packet: 4,
        n_stokes: 4,
    }
}

fn x_frame(g: &XGeom, bcnt: u32, parity: usize, xeng: usize, chunk: usize) -> Vec<u8> {
    let hdr = XPacketHeader {
        mcnt: 500_000 + 2 * parity as u64,
        bcnt,
        offset: chunk as u32,
        ant0: 1,
        ant1: 2,
        xeng_id: xeng as u16,
        payload_len: g.payload_bytes() as u16,
    };
    let mut frame = vec![0u8; frame_slot_size(g.payload_bytes())];
    hdr.write_to(&mut frame[FRAME_HDR_OFF..]);
    frame[FRAME_PAYLOAD_OFF..FRAME_PAYLOAD_OFF + 4].copy_from_slice(&bcnt.to_le_bytes());
    frame
}

fn block_frames(g: &XGeom, first_bcnt: u32) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for b in 0..g.baselines_per_block as u32 {
        for parity in 0..g.time_demux {
            for xeng in 0..g.n_xeng_per_time {
                for chunk in 0..g.chunks_per_xeng() {
                    frames.push(x_frame(g, first_bcnt + b, parity, xeng, chunk));
                }
            }
        }
    }
    frames
}

#[test]
fn stage_loop_reassembles_across_threads() {
    let g = geom();
    let raw_path = test_path("raw");
    let blk_path = test_path("blk");

    let frame_slot = frame_slot_size(g.payload_bytes());
    let frames_per_block = g.packets_per_block();
    let _raw_owner = BlockRing::<RawFrameHeader>::create(
        &raw_path,
        RingConfig {
            slots: 4,
            payload_bytes: frames_per_block * frame_slot,
        },
    )
    .unwrap();
    let _blk_owner = BlockRing::<XBlockHeader>::create(
        &blk_path,
        RingConfig {
            slots: 4,
            payload_bytes: g.block_bytes(),
        },
    )
    .unwrap();

    let status = StatusStore::new();
    let run = RunFlag::new();

    let engine = {
        let reass = XReassembler::new(
            g,
            BlockRing::open(&blk_path).unwrap(),
            status.clone(),
            run.clone(),
        )
        .unwrap();
        let mut catcher = XCatcher::new(BlockRing::open(&raw_path).unwrap(), reass);
        std::thread::spawn(move || catcher.run())
    };

    // Play operator: release the hold-off once the stage publishes it.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if status.lock().contains(CNETHOLD) {
            status.lock().put_i64(CNETHOLD, 0);
            break;
        }
        assert!(Instant::now() < deadline, "stage never entered hold-off");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Play packet source: one raw ring block per assembled block, then
    // the two packets that push blocks 0 and 1 out.
    let producer = {
        let raw = BlockRing::<RawFrameHeader>::open(&raw_path).unwrap();
        let g = g;
        std::thread::spawn(move || {
            let batches: [Vec<Vec<u8>>; 3] = [
                block_frames(&g, 0),
                block_frames(&g, 8),
                vec![x_frame(&g, 16, 0, 0, 0), x_frame(&g, 24, 0, 0, 0)],
            ];
            for (i, frames) in batches.iter().enumerate() {
                while raw.wait_free(i, Duration::from_millis(500)) == Wait::TimedOut {}
                raw.set_filling(i);
                // SAFETY: slot claimed above.
                unsafe {
                    *raw.header_mut(i) =
                        RawFrameHeader::new(frames.len() as u32, frame_slot as u32);
                    let payload = raw.payload_mut(i);
                    for (f, frame) in frames.iter().enumerate() {
                        payload[f * frame_slot..f * frame_slot + frame.len()]
                            .copy_from_slice(frame);
                    }
                }
                raw.set_filled(i);
            }
        })
    };

    // Play downstream consumer.
    let view = BlockRing::<XBlockHeader>::open(&blk_path).unwrap();
    for (slot, first) in [(0usize, 0u32), (1, 8)] {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match view.wait_filled(slot, Duration::from_millis(200)) {
                Wait::Ready => break,
                Wait::TimedOut => assert!(Instant::now() < deadline, "block {slot} never filled"),
            }
        }
        let hdr = view.header(slot);
        assert_eq!(hdr.bcnt[0], first);
        assert_eq!(hdr.good_data, 1);
        view.set_free(slot);
    }

    // The stage publishes NETBCNT just after marking the block filled, so
    // give it a moment to catch up.
    let deadline = Instant::now() + Duration::from_secs(5);
    while status.lock().get_u64(NETBCNT) != Some(8) {
        assert!(Instant::now() < deadline, "NETBCNT never reached 8");
        std::thread::sleep(Duration::from_millis(10));
    }

    producer.join().unwrap();
    run.shutdown();
    engine.join().unwrap().unwrap();

    let _ = std::fs::remove_file(&raw_path);
    let _ = std::fs::remove_file(&blk_path);
}
