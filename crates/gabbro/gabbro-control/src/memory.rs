//! In-memory control store for tests and offline runs.

use crate::{ControlError, ControlStore, parse_float_lines, parse_int_lines};

/// Control store backed by plain fields.  Configure the two operator
/// blocks as the same newline-delimited ASCII the real store holds, and
/// inspect the published state after a run.
#[derive(Debug, Default)]
pub struct MemoryControl {
    /// `corr corr_to_hera_map` block; `None` reports a missing field.
    pub ant_map: Option<String>,
    /// `corr integration_bin` block.
    pub bins: Option<String>,

    pub taking_data: Option<(bool, u64)>,
    pub taking_data_refreshes: u64,
    pub current_file: Option<(String, u64)>,
    pub raw_files: Vec<String>,
    pub cwd: Option<String>,
    pub new_session_notices: u64,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(mut self, block: &str) -> Self {
        self.ant_map = Some(block.to_owned());
        self
    }

    pub fn with_bins(mut self, block: &str) -> Self {
        self.bins = Some(block.to_owned());
        self
    }
}

impl ControlStore for MemoryControl {
    fn corr_to_ant_map(&mut self, max_ants: usize) -> Result<Vec<i32>, ControlError> {
        let block = self
            .ant_map
            .as_ref()
            .ok_or(ControlError::Missing("corr_to_hera_map"))?;
        parse_int_lines(block, max_ants)
    }

    fn integration_bins(&mut self) -> Result<Vec<f64>, ControlError> {
        let block = self
            .bins
            .as_ref()
            .ok_or(ControlError::Missing("integration_bin"))?;
        parse_float_lines(block)
    }

    fn set_taking_data(&mut self, taking: bool, unix: u64) -> Result<(), ControlError> {
        self.taking_data = Some((taking, unix));
        Ok(())
    }

    fn refresh_taking_data(&mut self) -> Result<(), ControlError> {
        self.taking_data_refreshes += 1;
        Ok(())
    }

    fn set_current_file(&mut self, filename: &str, unix: u64) -> Result<(), ControlError> {
        self.current_file = Some((filename.to_owned(), unix));
        Ok(())
    }

    fn push_raw_file(&mut self, path: &str) -> Result<(), ControlError> {
        self.raw_files.push(path.to_owned());
        Ok(())
    }

    fn set_catcher_cwd(&mut self, cwd: &str) -> Result<(), ControlError> {
        self.cwd = Some(cwd.to_owned());
        Ok(())
    }

    fn notify_new_session(&mut self) -> Result<(), ControlError> {
        self.new_session_notices += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behaves_like_the_operator_blocks() {
        let mut ctl = MemoryControl::new().with_map("3\n1\n4\n").with_bins("2\n16\n");
        assert_eq!(ctl.corr_to_ant_map(8).unwrap(), vec![3, 1, 4]);
        assert_eq!(ctl.integration_bins().unwrap(), vec![2.0, 16.0]);

        ctl.set_taking_data(true, 1_600_000_000).unwrap();
        ctl.push_raw_file("a.sum.dat").unwrap();
        assert_eq!(ctl.taking_data, Some((true, 1_600_000_000)));
        assert_eq!(ctl.raw_files, vec!["a.sum.dat"]);
    }

    #[test]
    fn missing_blocks_report_missing() {
        let mut ctl = MemoryControl::new();
        assert!(matches!(
            ctl.corr_to_ant_map(4),
            Err(ControlError::Missing(_))
        ));
    }
}
