//! Shared-memory backing for the pipeline's block rings.
//!
//! Every ring lives in one file-backed region so that the producing and
//! consuming stages — threads of one process or separate processes — see
//! the same slots.  The stage that builds the pipeline creates each
//! region; every other stage attaches to it by path.
//!
//! Two kernel guarantees are load-bearing for the ring layout on top:
//!
//! - A freshly created region reads as zeroes, so every slot state word
//!   starts out FREE and headers/payloads start blank without an explicit
//!   clearing pass over gigabytes of mapping.
//! - The mapping base is page-aligned, so the layout can place each state
//!   word, header, and payload on a 64-byte boundary by offset arithmetic
//!   alone.

mod aligned;

pub use aligned::AlignedBuf;

use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// One ring's file-backed, read-write shared memory region.
///
/// Dropping a `SharedRegion` unmaps it but leaves the file behind for the
/// other stages still attached; ring files are reused across restarts and
/// recreated (truncated) only by the pipeline builder.
#[derive(Debug)]
pub struct SharedRegion {
    /// Keeps the backing file open for as long as the mapping lives.
    _file: File,
    map: MmapMut,
}

impl SharedRegion {
    /// Create the region file for a new ring, sized to `bytes`, and map
    /// it read-write.  An existing file at `path` is truncated: creating
    /// a ring invalidates whatever a previous run left in it.
    ///
    /// The returned mapping is all zeroes.
    pub fn create<P: AsRef<Path>>(path: P, bytes: u64) -> io::Result<Self> {
        if bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring region must not be empty",
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(bytes)?;
        // SAFETY: the region is shared on purpose; all cross-stage access
        // above this crate is mediated by the ring's atomic state words.
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug_assert_eq!(map.as_ptr() as usize % 4096, 0);
        Ok(Self { _file: file, map })
    }

    /// Attach to a ring region another stage created.
    ///
    /// A zero-length file is what a creator that died between `open` and
    /// `set_len` leaves behind; attaching to one is refused here rather
    /// than letting the ring layer read a truncated header.
    pub fn attach<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ring region file is empty",
            ));
        }
        // SAFETY: as in `create`; the ring validates the header before
        // trusting any of the mapped contents.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, map })
    }

    /// Base address of the region; page-aligned.
    #[inline]
    pub fn base(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn region_path(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/tmp/gabbro_region_{tag}_{}_{ts}", std::process::id())
    }

    #[test]
    fn created_region_is_sized_zeroed_and_page_aligned() {
        let path = region_path("fresh");
        let mut region = SharedRegion::create(&path, 1 << 16).unwrap();

        assert_eq!(region.len(), 1 << 16);
        assert_eq!(region.base() as usize % 4096, 0);
        let bytes = unsafe { std::slice::from_raw_parts(region.base(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0), "fresh slots must read FREE");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn attached_stages_share_one_region() {
        let path = region_path("shared");
        let mut producer = SharedRegion::create(&path, 4096).unwrap();
        let mut consumer = SharedRegion::attach(&path).unwrap();
        assert_eq!(consumer.len(), 4096);

        // A write through one handle is what the other observes.
        unsafe {
            *producer.base().add(63) = 0xA5;
            assert_eq!(*consumer.base().add(63), 0xA5);
            *consumer.base().add(63) = 0;
            assert_eq!(*producer.base().add(63), 0);
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn attach_rejects_missing_and_truncated_regions() {
        let path = region_path("bad");
        assert!(SharedRegion::attach(&path).is_err());

        fs::File::create(&path).unwrap();
        let err = SharedRegion::attach(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn zero_sized_rings_are_refused() {
        let path = region_path("zero");
        assert!(SharedRegion::create(&path, 0).is_err());
        let _ = fs::remove_file(&path);
    }
}
