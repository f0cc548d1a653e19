//! Block ring implementation over a memory-mapped file.

use crate::layout::{RingHeader, RingLayout};
use gabbro_mmap::SharedRegion;
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Slot is owned by nobody; the producer may claim it.
pub const FREE: u32 = 0;
/// Slot is being written by the producer.
pub const FILLING: u32 = 1;
/// Slot carries a complete block; the consumer may drain it.
pub const FILLED: u32 = 2;

/// Spin iterations between deadline checks while waiting on a state word.
const SPIN_ROUNDS: u32 = 4096;

/// Sleep between spin bursts in the non-busy waits.
const WAIT_NAP: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Number of block slots.
    pub slots: usize,
    /// Payload bytes per slot (unpadded; the ring pads the stride to 64).
    pub payload_bytes: usize,
}

/// Outcome of a bounded wait on a slot state.
///
/// `TimedOut` is the normal way for a stage loop to regain control and poll
/// the shutdown flag; callers are expected to loop on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Ready,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("ring i/o failed")]
    Io(#[from] io::Error),

    #[error("invalid ring region: {0}")]
    Format(&'static str),
}

/// One stage's handle on a shared block ring.
///
/// `H` is the per-slot header type; it must be `Copy` plain-old-data since it
/// lives in shared memory and is read by other stages without serialization.
///
/// A handle is `Send + Sync`, but the ring discipline still applies: exactly
/// one stage produces and exactly one consumes.  Slot contents are protected
/// by state-word ownership, not by the borrow checker, which is why the
/// mutable accessors are `unsafe`.
pub struct BlockRing<H: Copy> {
    _region: SharedRegion,
    base: *mut u8,
    layout: RingLayout,
    payload_bytes: usize,
    _pd: PhantomData<H>,
}

// SAFETY: all cross-thread access goes through the per-slot atomic state
// word; header/payload access is gated on slot ownership (see struct docs).
unsafe impl<H: Copy> Send for BlockRing<H> {}
unsafe impl<H: Copy> Sync for BlockRing<H> {}

impl<H: Copy> BlockRing<H> {
    /// Create a new ring file, sized for `cfg`, with every slot `FREE` and
    /// all headers/payloads zeroed.
    pub fn create<P: AsRef<Path>>(path: P, cfg: RingConfig) -> Result<Self, RingError> {
        if cfg.slots == 0 {
            return Err(RingError::Format("ring must have at least one slot"));
        }
        if cfg.payload_bytes == 0 {
            return Err(RingError::Format("ring payload must be non-empty"));
        }
        let layout = RingLayout::compute(cfg.slots, size_of::<H>(), cfg.payload_bytes);
        let mut region = SharedRegion::create(path, layout.total_bytes as u64)?;
        let base = region.base();

        // Freshly created regions read as zeroes, so every state word is
        // already FREE; only the header needs writing.
        unsafe {
            ptr::write(
                base as *mut RingHeader,
                RingHeader::new(
                    cfg.slots as u64,
                    size_of::<H>() as u64,
                    cfg.payload_bytes as u64,
                ),
            );
        }

        Ok(Self {
            _region: region,
            base,
            layout,
            payload_bytes: cfg.payload_bytes,
            _pd: PhantomData,
        })
    }

    /// Attach to an existing ring file created by another stage.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RingError> {
        let mut region = SharedRegion::attach(path)?;
        let base = region.base();

        // SAFETY: region starts with a RingHeader written by `create`;
        // validate() rejects anything else before we trust the shape fields.
        let hdr = unsafe { &*(base as *const RingHeader) };
        hdr.validate::<H>().map_err(RingError::Format)?;

        let payload_bytes = hdr.payload_bytes as usize;
        let layout = RingLayout::compute(hdr.slots as usize, size_of::<H>(), payload_bytes);
        if region.len() < layout.total_bytes {
            return Err(RingError::Format("ring region shorter than its layout"));
        }

        Ok(Self {
            _region: region,
            base,
            layout,
            payload_bytes,
            _pd: PhantomData,
        })
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.layout.slots
    }

    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    #[inline]
    fn state(&self, idx: usize) -> &AtomicU32 {
        assert!(idx < self.layout.slots, "slot index out of range");
        // SAFETY: idx checked; each state word sits at the start of its own
        // 64-byte line inside the mapping.
        unsafe { &*(self.base.add(self.layout.states_off + idx * 64) as *const AtomicU32) }
    }

    /// Current state word of a slot (diagnostics and tests).
    pub fn slot_state(&self, idx: usize) -> u32 {
        self.state(idx).load(Ordering::Acquire)
    }

    fn wait_state(&self, idx: usize, want: u32, timeout: Duration, nap: bool) -> Wait {
        let state = self.state(idx);
        let deadline = Instant::now() + timeout;
        loop {
            for _ in 0..SPIN_ROUNDS {
                if state.load(Ordering::Acquire) == want {
                    return Wait::Ready;
                }
                std::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return Wait::TimedOut;
            }
            if nap {
                std::thread::sleep(WAIT_NAP);
            }
        }
    }

    /// Block until slot `idx` is `FILLED`, or time out.
    pub fn wait_filled(&self, idx: usize, timeout: Duration) -> Wait {
        self.wait_state(idx, FILLED, timeout, true)
    }

    /// Block until slot `idx` is `FREE`, or time out.
    pub fn wait_free(&self, idx: usize, timeout: Duration) -> Wait {
        self.wait_state(idx, FREE, timeout, true)
    }

    /// Spin (no sleeping) until slot `idx` is `FREE`, or time out.
    ///
    /// Used on the reassembler hot path where the slot two blocks ahead is
    /// almost always already free and a sleep would cost more than it saves.
    pub fn busywait_free(&self, idx: usize, timeout: Duration) -> Wait {
        self.wait_state(idx, FREE, timeout, false)
    }

    /// Claim a `FREE` slot for writing.
    pub fn set_filling(&self, idx: usize) {
        let prev = self.state(idx).swap(FILLING, Ordering::AcqRel);
        debug_assert_eq!(prev, FREE, "set_filling on a slot not FREE");
    }

    /// Publish a slot to the consumer.  All header/payload writes made
    /// before this call are visible to a consumer that observes `FILLED`.
    pub fn set_filled(&self, idx: usize) {
        self.state(idx).store(FILLED, Ordering::Release);
    }

    /// Return a drained slot to the producer.
    pub fn set_free(&self, idx: usize) {
        self.state(idx).store(FREE, Ordering::Release);
    }

    #[inline]
    fn header_ptr(&self, idx: usize) -> *mut H {
        assert!(idx < self.layout.slots, "slot index out of range");
        // SAFETY: idx checked; header area laid out by RingLayout.
        unsafe {
            self.base
                .add(self.layout.headers_off + idx * self.layout.header_stride) as *mut H
        }
    }

    #[inline]
    fn payload_ptr(&self, idx: usize) -> *mut u8 {
        assert!(idx < self.layout.slots, "slot index out of range");
        // SAFETY: idx checked; payload area laid out by RingLayout.
        unsafe {
            self.base
                .add(self.layout.payloads_off + idx * self.layout.payload_stride)
        }
    }

    /// Copy out the header of a slot.
    ///
    /// Safe for the stage that currently owns the slot per the state word;
    /// the copy avoids handing out references into shared memory.
    pub fn header(&self, idx: usize) -> H {
        // SAFETY: header region is always initialised (zeroed at create).
        unsafe { ptr::read(self.header_ptr(idx)) }
    }

    /// Mutable access to a slot header.
    ///
    /// # Safety
    /// Caller must own the slot: producer between `set_filling` and
    /// `set_filled`, or consumer between observing `FILLED` and `set_free`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn header_mut(&self, idx: usize) -> &mut H {
        unsafe { &mut *self.header_ptr(idx) }
    }

    /// Read access to a slot payload.
    ///
    /// Callers must only read payloads of slots they own per the state word;
    /// the ring cannot enforce this.
    pub fn payload(&self, idx: usize) -> &[u8] {
        // SAFETY: region is mapped and sized by RingLayout.
        unsafe { std::slice::from_raw_parts(self.payload_ptr(idx), self.payload_bytes) }
    }

    /// Mutable access to a slot payload.
    ///
    /// # Safety
    /// Same ownership contract as [`Self::header_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self, idx: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(idx), self.payload_bytes) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Clone, Copy, Debug, PartialEq)]
    #[repr(C)]
    struct TestHeader {
        seq: u64,
        good_data: u32,
    }

    fn test_path(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/tmp/gabbro_ring_{tag}_{}_{ts}", std::process::id())
    }

    #[test]
    fn slots_start_free_and_transition() {
        let path = test_path("states");
        let ring = BlockRing::<TestHeader>::create(
            &path,
            RingConfig {
                slots: 4,
                payload_bytes: 256,
            },
        )
        .unwrap();

        for i in 0..4 {
            assert_eq!(ring.slot_state(i), FREE);
        }

        ring.set_filling(1);
        assert_eq!(ring.slot_state(1), FILLING);
        ring.set_filled(1);
        assert_eq!(ring.slot_state(1), FILLED);
        ring.set_free(1);
        assert_eq!(ring.slot_state(1), FREE);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn wait_filled_times_out_on_free_slot() {
        let path = test_path("timeout");
        let ring = BlockRing::<TestHeader>::create(
            &path,
            RingConfig {
                slots: 2,
                payload_bytes: 64,
            },
        )
        .unwrap();

        let got = ring.wait_filled(0, Duration::from_millis(20));
        assert_eq!(got, Wait::TimedOut);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn open_validates_header_type() {
        #[derive(Clone, Copy)]
        #[repr(C)]
        struct OtherHeader {
            _a: u64,
            _b: u64,
            _c: u64,
        }

        let path = test_path("validate");
        let _ring = BlockRing::<TestHeader>::create(
            &path,
            RingConfig {
                slots: 2,
                payload_bytes: 64,
            },
        )
        .unwrap();

        assert!(BlockRing::<OtherHeader>::open(&path).is_err());
        assert!(BlockRing::<TestHeader>::open(&path).is_ok());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn producer_consumer_handoff_across_threads() {
        let path = test_path("handoff");
        let _owner = BlockRing::<TestHeader>::create(
            &path,
            RingConfig {
                slots: 4,
                payload_bytes: 1024,
            },
        )
        .unwrap();

        const BLOCKS: u64 = 32;
        let timeout = Duration::from_millis(500);

        let producer_path = path.clone();
        let producer = std::thread::spawn(move || {
            let ring = BlockRing::<TestHeader>::open(&producer_path).unwrap();
            for seq in 0..BLOCKS {
                let idx = (seq % 4) as usize;
                while ring.busywait_free(idx, timeout) == Wait::TimedOut {}
                ring.set_filling(idx);
                // SAFETY: slot claimed above.
                unsafe {
                    *ring.header_mut(idx) = TestHeader { seq, good_data: 1 };
                    ring.payload_mut(idx)[0] = seq as u8;
                }
                ring.set_filled(idx);
            }
        });

        let consumer_path = path.clone();
        let consumer = std::thread::spawn(move || {
            let ring = BlockRing::<TestHeader>::open(&consumer_path).unwrap();
            for seq in 0..BLOCKS {
                let idx = (seq % 4) as usize;
                while ring.wait_filled(idx, timeout) == Wait::TimedOut {}
                let hdr = ring.header(idx);
                assert_eq!(hdr.seq, seq, "blocks must arrive in order");
                assert_eq!(ring.payload(idx)[0], seq as u8);
                ring.set_free(idx);
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();

        let _ = fs::remove_file(&path);
    }
}
