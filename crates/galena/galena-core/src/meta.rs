//! Per-file metadata sidecar.
//!
//! Every data file ships with a metadata file holding the §-fixed dataset
//! schema: scalars `{t0, mcnt, nfreq, nstokes, corr_ver, tag}` and
//! per-baseline-row arrays `{ant_0_array, ant_1_array, time_array,
//! integration_time}`.  The HDF5 library that encodes this on the
//! production deployment is an external collaborator behind [`MetaSink`];
//! the in-tree [`JsonMetaSink`] writes the same schema as JSON and is what
//! the tests (and offline runs) use.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Fixed width of the `corr_ver` and `tag` string datasets.
pub const META_STR_BYTES: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("metadata i/o failed")]
    Io(#[from] std::io::Error),

    #[error("metadata encoding failed")]
    Encode(#[from] serde_json::Error),
}

/// Contents of one metadata sidecar.  Array lengths equal the number of
/// baseline rows written to the paired data files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Sync epoch of the F-engines, milliseconds.
    pub t0: u64,
    /// Spectrum counter at which the file was closed.
    pub mcnt: u64,
    /// Channels per row after channel summing.
    pub nfreq: u64,
    pub nstokes: u64,
    pub corr_ver: String,
    pub tag: String,
    pub ant_0_array: Vec<i32>,
    pub ant_1_array: Vec<i32>,
    /// Julian date per row, stamped at the integration midpoint.
    pub time_array: Vec<f64>,
    /// Integration seconds per row.
    pub integration_time: Vec<f64>,
}

impl FileMeta {
    /// Clamp the fixed-width string fields to their dataset size.
    pub fn clamp_strings(&mut self) {
        self.corr_ver.truncate(META_STR_BYTES);
        self.tag.truncate(META_STR_BYTES);
    }
}

/// Destination encoding of a metadata sidecar.
pub trait MetaSink: Send {
    fn write(&self, path: &Path, meta: &FileMeta) -> Result<(), MetaError>;
}

/// JSON encoding of the sidecar schema.
pub struct JsonMetaSink;

impl JsonMetaSink {
    /// Read a sidecar back (tests and offline tooling).
    pub fn read(path: &Path) -> Result<FileMeta, MetaError> {
        let f = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(f))?)
    }
}

impl MetaSink for JsonMetaSink {
    fn write(&self, path: &Path, meta: &FileMeta) -> Result<(), MetaError> {
        let f = File::create(path)?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer(&mut w, meta)?;
        use std::io::Write;
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMeta {
        FileMeta {
            t0: 1_500_000_000_000,
            mcnt: 786_432,
            nfreq: 512,
            nstokes: 4,
            corr_ver: "0.1.0".into(),
            tag: "engineering".into(),
            ant_0_array: vec![0, 0, 1],
            ant_1_array: vec![0, 1, 1],
            time_array: vec![2459123.4166701, 2459123.4166702, 2459123.4166703],
            integration_time: vec![2.0, 4.0, 4.0],
        }
    }

    #[test]
    fn roundtrip_is_bit_exact() {
        let dir = std::env::temp_dir().join(format!(
            "galena_meta_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("zen.2459123.41667.meta.hdf5");

        let meta = sample();
        JsonMetaSink.write(&path, &meta).unwrap();
        let back = JsonMetaSink::read(&path).unwrap();

        assert_eq!(back, meta);
        // doubles must survive exactly, not approximately
        for (a, b) in back.time_array.iter().zip(&meta.time_array) {
            assert_eq!(a.to_bits(), b.to_bits());
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn strings_clamp_to_dataset_width() {
        let mut meta = sample();
        meta.tag = "x".repeat(300);
        meta.clamp_strings();
        assert_eq!(meta.tag.len(), META_STR_BYTES);
        assert_eq!(meta.corr_ver, "0.1.0");
    }
}
