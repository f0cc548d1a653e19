//! Output file naming and the file-boundary arithmetic.
//!
//! A file holds `bcnts_per_file` baseline rows; boundaries fall wherever
//! `bcnt ≡ 0 (mod bcnts_per_file)`, which never needs to coincide with a
//! block boundary.  Files are named by the Julian date of their first
//! baseline and grouped in a directory named by the integer JD of the
//! session's first file.

use std::path::{Path, PathBuf};

/// Baseline rows per file from the baseline-integration distribution
/// `[n_2s, n_4s, n_8s, n_16s]`: over a 16-second cadence the 2-second
/// baselines dump 8 times, the 4-second ones 4 times, and so on.
pub fn bcnts_per_file(dist: [u64; 4]) -> u64 {
    8 * dist[0] + 4 * dist[1] + 2 * dist[2] + dist[3]
}

/// Paths of one output file triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNames {
    pub sum: PathBuf,
    pub diff: PathBuf,
    pub meta: PathBuf,
}

impl FileNames {
    /// Names under `dir` for a file starting at Julian date `jd`.
    pub fn at(dir: &Path, jd: f64) -> Self {
        Self {
            sum: dir.join(format!("zen.{jd:.5}.sum.dat")),
            diff: dir.join(format!("zen.{jd:.5}.diff.dat")),
            meta: dir.join(format!("zen.{jd:.5}.meta.hdf5")),
        }
    }
}

/// Session directory name: the integer part of the Julian date.
pub fn session_dir(root: &Path, jd: f64) -> PathBuf {
    root.join(format!("{}", jd as i64))
}

/// First file boundary at or after `bcnt`.
pub fn next_boundary(bcnt: u64, per_file: u64) -> u64 {
    if bcnt % per_file == 0 {
        bcnt
    } else {
        (bcnt / per_file + 1) * per_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_weights() {
        assert_eq!(bcnts_per_file([0, 0, 0, 256]), 256);
        assert_eq!(bcnts_per_file([10, 20, 30, 40]), 80 + 80 + 60 + 40);
    }

    #[test]
    fn names_carry_five_decimals() {
        let n = FileNames::at(Path::new("2459123"), 2459123.41667);
        assert_eq!(n.sum, Path::new("2459123/zen.2459123.41667.sum.dat"));
        assert_eq!(n.diff, Path::new("2459123/zen.2459123.41667.diff.dat"));
        assert_eq!(n.meta, Path::new("2459123/zen.2459123.41667.meta.hdf5"));
    }

    #[test]
    fn session_dir_is_integer_jd() {
        assert_eq!(
            session_dir(Path::new("/data"), 2459123.99),
            Path::new("/data/2459123")
        );
    }

    #[test]
    fn boundary_snaps_up() {
        assert_eq!(next_boundary(0, 256), 0);
        assert_eq!(next_boundary(1, 256), 256);
        assert_eq!(next_boundary(256, 256), 256);
        assert_eq!(next_boundary(257, 256), 512);
    }
}
