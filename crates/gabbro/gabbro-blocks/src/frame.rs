//! Layout of one raw frame slot in the packet ring.
//!
//! The packet source scatters each received frame into a padded slot so that
//! the regions we touch are 64-byte aligned:
//!
//! ```text
//! [0 .. 64)      link headers (eth/ip/udp), opaque to the pipeline
//! [64 .. 128)    application header (8 B used for F, 24 B for X)
//! [128 .. end)   payload, padded to the next multiple of 64
//! ```

/// Byte offset of the application header within a frame slot.
pub const FRAME_HDR_OFF: usize = 64;

/// Byte offset of the payload within a frame slot.
pub const FRAME_PAYLOAD_OFF: usize = 128;

const fn align64(n: usize) -> usize {
    (n + 63) & !63
}

/// Total slot size for a frame carrying `payload_bytes` of payload.
pub const fn frame_slot_size(payload_bytes: usize) -> usize {
    FRAME_PAYLOAD_OFF + align64(payload_bytes)
}

const _: () = assert!(FRAME_HDR_OFF % 64 == 0);
const _: () = assert!(FRAME_PAYLOAD_OFF % 64 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_sizes_stay_64_aligned() {
        assert_eq!(frame_slot_size(4096), 128 + 4096);
        assert_eq!(frame_slot_size(4608), 128 + 4608);
        assert_eq!(frame_slot_size(100), 128 + 128);
        assert_eq!(frame_slot_size(100) % 64, 0);
    }
}
