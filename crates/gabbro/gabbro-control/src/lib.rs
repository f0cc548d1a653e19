//! Remote key-value control channel.
//!
//! The catcher reads its antenna mapping and per-baseline integration times
//! from, and publishes session state to, a small remote key-value store.
//! The store itself is an external collaborator; this crate defines the
//! [`ControlStore`] trait the pipeline programs against, a thin RESP client
//! for the real store, and an in-memory implementation for tests.
//!
//! All remote calls are gated on a healthy connection: a failed call marks
//! the client disconnected and later calls retry the connection under a
//! capped backoff instead of hammering a dead endpoint.

mod client;
mod memory;
mod resp;

pub use client::RedisControl;
pub use memory::MemoryControl;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control store i/o failed")]
    Io(#[from] std::io::Error),

    #[error("control store not connected (backing off)")]
    NotConnected,

    #[error("control store protocol error: {0}")]
    Protocol(String),

    #[error("control store returned no value for {0}")]
    Missing(&'static str),

    #[error("could not parse control value: {0}")]
    Parse(String),

    #[error("control store lists {got} entries but the pipeline supports {max}")]
    TooManyEntries { got: usize, max: usize },
}

/// Control-channel operations used by the pipeline stages.
///
/// The two fetches return the newline-delimited ASCII blocks the operators
/// maintain, already parsed: one antenna number per line for the map, one
/// integration-bin value (seconds, unscaled) per line.
pub trait ControlStore: Send {
    /// `HGET corr corr_to_hera_map`, at most `max_ants` entries.
    fn corr_to_ant_map(&mut self, max_ants: usize) -> Result<Vec<i32>, ControlError>;

    /// `HGET corr integration_bin`.
    fn integration_bins(&mut self) -> Result<Vec<f64>, ControlError>;

    /// `HMSET corr:is_taking_data state <bool> time <unix>` + 60 s expiry.
    fn set_taking_data(&mut self, taking: bool, unix: u64) -> Result<(), ControlError>;

    /// Refresh the 60 s expiry on `corr:is_taking_data` so its
    /// disappearance signals a dead pipeline.
    fn refresh_taking_data(&mut self) -> Result<(), ControlError>;

    /// `HMSET corr:current_file filename <name> time <unix>`.
    fn set_current_file(&mut self, filename: &str, unix: u64) -> Result<(), ControlError>;

    /// `RPUSH corr:files:raw <path>`.
    fn push_raw_file(&mut self, path: &str) -> Result<(), ControlError>;

    /// `HMSET corr:catcher cwd <dir>`.
    fn set_catcher_cwd(&mut self, cwd: &str) -> Result<(), ControlError>;

    /// `HMSET rtp:has_new_data state True`.
    fn notify_new_session(&mut self) -> Result<(), ControlError>;
}

/// Parse a newline-delimited block of integers (the antenna map format).
pub(crate) fn parse_int_lines(block: &str, max: usize) -> Result<Vec<i32>, ControlError> {
    let mut out = Vec::new();
    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let v: i32 = line
            .parse()
            .map_err(|_| ControlError::Parse(format!("bad antenna number {line:?}")))?;
        out.push(v);
        if out.len() > max {
            return Err(ControlError::TooManyEntries {
                got: out.len(),
                max,
            });
        }
    }
    Ok(out)
}

/// Parse a newline-delimited block of floats (the integration-bin format).
pub(crate) fn parse_float_lines(block: &str) -> Result<Vec<f64>, ControlError> {
    let mut out = Vec::new();
    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let v: f64 = line
            .parse()
            .map_err(|_| ControlError::Parse(format!("bad integration bin {line:?}")))?;
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_lines_parse_and_bound() {
        let got = parse_int_lines("0\n12\n85\n", 8).unwrap();
        assert_eq!(got, vec![0, 12, 85]);

        assert!(matches!(
            parse_int_lines("1\n2\n3\n", 2),
            Err(ControlError::TooManyEntries { got: 3, max: 2 })
        ));

        assert!(parse_int_lines("1\nx\n", 8).is_err());
    }

    #[test]
    fn float_lines_parse() {
        let got = parse_float_lines("2\n4\n4\n16\n").unwrap();
        assert_eq!(got, vec![2.0, 4.0, 4.0, 16.0]);
        assert!(parse_float_lines("nan-ish\n").is_err());
    }
}
