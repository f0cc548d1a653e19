//! Binary layout of a block ring inside its memory-mapped region.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RingHeader (64 B, one cache line)                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ state[0] (AtomicU32, padded to 64 B)                         │
//! │ ...                                                          │
//! │ state[slots-1]                                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ header[0] (H, stride padded to 64 B)                         │
//! │ ...                                                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ payload[0] (payload_bytes, stride padded to 64 B)            │
//! │ ...                                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every subregion starts on a 64-byte boundary (the mapping itself is page
//! aligned), which keeps slot states on private cache lines and payloads
//! usable with aligned 256-bit loads.

use std::mem::size_of;

/// Magic number identifying a valid block-ring file.
///
/// ASCII encoding of "GABBROBU" (Gabbro BUffer):
/// `0x4741_4242_524F_4255`.
pub const RING_MAGIC: u64 = 0x4741_4242_524F_4255;

/// Current block-ring format version.  Readers reject mismatches.
pub const RING_VERSION: u64 = 1;

/// Round `n` up to the next multiple of 64.
#[inline(always)]
pub const fn align64(n: usize) -> usize {
    (n + 63) & !63
}

/// Header stored at offset 0 of every ring region.
///
/// `#[repr(C)]` for a stable cross-process layout; sized to exactly one
/// cache line so it never shares a line with slot state words.
#[repr(C)]
pub struct RingHeader {
    /// Must equal [`RING_MAGIC`].
    pub magic: u64,
    /// Must equal [`RING_VERSION`].
    pub version: u64,
    /// Number of slots in the ring.
    pub slots: u64,
    /// `size_of` of the slot header type the ring was created with.
    pub header_bytes: u64,
    /// Unpadded payload length per slot in bytes.
    pub payload_bytes: u64,
    _pad: [u8; 24],
}

impl RingHeader {
    pub fn new(slots: u64, header_bytes: u64, payload_bytes: u64) -> Self {
        Self {
            magic: RING_MAGIC,
            version: RING_VERSION,
            slots,
            header_bytes,
            payload_bytes,
            _pad: [0; 24],
        }
    }

    /// Validate a mapped header against the expected slot header type `H`.
    pub fn validate<H: Copy>(&self) -> Result<(), &'static str> {
        if self.magic != RING_MAGIC {
            return Err("bad ring magic");
        }
        if self.version != RING_VERSION {
            return Err("ring format version mismatch");
        }
        if self.slots == 0 {
            return Err("ring has zero slots");
        }
        if self.header_bytes as usize != size_of::<H>() {
            return Err("slot header size mismatch");
        }
        Ok(())
    }
}

/// Byte offsets of the ring subregions for a given shape.
#[derive(Debug, Clone, Copy)]
pub struct RingLayout {
    pub slots: usize,
    pub states_off: usize,
    pub headers_off: usize,
    pub header_stride: usize,
    pub payloads_off: usize,
    pub payload_stride: usize,
    pub total_bytes: usize,
}

impl RingLayout {
    pub fn compute(slots: usize, header_bytes: usize, payload_bytes: usize) -> Self {
        let states_off = size_of::<RingHeader>();
        let headers_off = states_off + slots * 64;
        let header_stride = align64(header_bytes);
        let payloads_off = headers_off + slots * header_stride;
        let payload_stride = align64(payload_bytes);
        let total_bytes = payloads_off + slots * payload_stride;
        Self {
            slots,
            states_off,
            headers_off,
            header_stride,
            payloads_off,
            payload_stride,
            total_bytes,
        }
    }
}

const _: () = assert!(size_of::<RingHeader>() == 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subregions_are_cache_line_aligned() {
        let l = RingLayout::compute(4, 24, 4096 + 8);
        assert_eq!(l.states_off % 64, 0);
        assert_eq!(l.headers_off % 64, 0);
        assert_eq!(l.payloads_off % 64, 0);
        assert_eq!(l.header_stride % 64, 0);
        assert_eq!(l.payload_stride % 64, 0);
        assert!(l.payload_stride >= 4096 + 8);
    }

    #[test]
    fn validate_rejects_wrong_header_type() {
        #[derive(Clone, Copy)]
        struct Small(#[allow(dead_code)] u32);

        let h = RingHeader::new(4, 24, 4096);
        assert!(h.validate::<Small>().is_err());
    }
}
