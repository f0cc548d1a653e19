//! `galena-engine`: the disk stage of the catcher pipeline.
//!
//! Consumes filled visibility blocks, runs the sum/difference kernel over
//! them in baseline strides, and streams the results into paired binary
//! files with a metadata sidecar per file.  File boundaries fall on
//! `bcnt` multiples that need not align with block boundaries, so a stride
//! may split across a closing and an opening file.  Autocorrelations are
//! copied to a side ring for the external observability stage.
//!
//! Unlike reassembly, I/O failures here are fatal: the stage publishes the
//! error, requests process shutdown, and returns.

mod autocorr;
mod writer;

pub use autocorr::AutocorrFeeder;
pub use writer::{DiskWriter, DiskWriterConfig};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("writer i/o failed")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Meta(#[from] galena_core::MetaError),

    #[error(transparent)]
    Geometry(#[from] gabbro_blocks::GeomError),

    #[error("writer configuration mismatch: {0}")]
    Mismatch(&'static str),
}

/// View a slot payload as 32-bit words.
///
/// Ring payloads are 64-byte aligned by construction, which this leans on.
pub(crate) fn payload_i32(bytes: &[u8]) -> &[i32] {
    debug_assert_eq!(bytes.as_ptr() as usize % 4, 0);
    // SAFETY: alignment checked above; any bit pattern is a valid i32.
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i32, bytes.len() / 4) }
}

/// View 32-bit words as little-endian bytes for file output.
pub(crate) fn i32_bytes(words: &[i32]) -> &[u8] {
    // SAFETY: i32 has no padding; the platform is little-endian on every
    // deployment target, matching the file format.
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 4) }
}
