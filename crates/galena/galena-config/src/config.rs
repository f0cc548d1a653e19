use serde::Deserialize;
use std::path::Path;

/// Settings of the disk stage: ring locations, output layout, kernel
/// stride, and the control-store endpoint.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DiskConfig {
    /// Assembled block ring this stage consumes.
    pub blocks_ring: String,
    /// Autocorrelation side ring this stage produces.
    pub autocorr_ring: String,
    pub autocorr_slots: usize,
    /// Antennas tracked by the autocorr side stream.
    pub n_ants_total: usize,
    /// Integration seconds assumed for the side-channel JD stamp.
    pub autocorr_integration_secs: f64,
    /// Root directory for per-JD session directories.
    pub out_dir: String,
    /// Adjacent channels summed per output channel.
    pub chan_sum: usize,
    /// Baselines per kernel stride.
    pub n_bl_per_write: usize,
    pub write_diff: bool,
    /// `host:port` of the remote key-value control store; `None` runs
    /// without one (offline / test deployments).
    pub control_addr: Option<String>,
    pub sample_rate_hz: f64,
    pub n_chan_generated: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            blocks_ring: defaults::blocks_ring(),
            autocorr_ring: defaults::autocorr_ring(),
            autocorr_slots: defaults::autocorr_slots(),
            n_ants_total: defaults::n_ants_total(),
            autocorr_integration_secs: defaults::autocorr_integration_secs(),
            out_dir: defaults::out_dir(),
            chan_sum: defaults::chan_sum(),
            n_bl_per_write: defaults::n_bl_per_write(),
            write_diff: true,
            control_addr: None,
            sample_rate_hz: defaults::sample_rate_hz(),
            n_chan_generated: defaults::n_chan_generated(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn blocks_ring() -> String {
        "/dev/shm/catcher_block_ring".into()
    }

    pub fn autocorr_ring() -> String {
        "/dev/shm/catcher_autocorr_ring".into()
    }

    pub fn autocorr_slots() -> usize {
        4
    }

    pub fn n_ants_total() -> usize {
        192
    }

    pub fn autocorr_integration_secs() -> f64 {
        2.0
    }

    pub fn out_dir() -> String {
        ".".into()
    }

    pub fn chan_sum() -> usize {
        1
    }

    pub fn n_bl_per_write() -> usize {
        32
    }

    pub fn sample_rate_hz() -> f64 {
        500e6
    }

    pub fn n_chan_generated() -> u64 {
        8192
    }
}

impl DiskConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: DiskConfig =
            toml::from_str("chan_sum = 4\ncontrol_addr = \"10.0.1.10:6379\"\n").unwrap();
        assert_eq!(cfg.chan_sum, 4);
        assert_eq!(cfg.control_addr.as_deref(), Some("10.0.1.10:6379"));
        assert_eq!(cfg.n_bl_per_write, 32);
        assert!(cfg.write_diff);
    }

    #[test]
    fn control_store_is_optional() {
        let cfg: DiskConfig = toml::from_str("").unwrap();
        assert!(cfg.control_addr.is_none());
    }
}
