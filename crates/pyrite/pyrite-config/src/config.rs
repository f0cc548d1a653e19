use serde::Deserialize;
use std::path::Path;

/// Settings of the ingest stage: ring locations and shapes, and this
/// catcher instance's time-demux parity.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Raw packet ring filled by the external packet source.
    pub raw_ring: String,
    /// Assembled block ring feeding the next stage.
    pub blocks_ring: String,
    pub raw_slots: usize,
    /// Frames per raw ring slot.
    pub frames_per_block: usize,
    /// Slots in the assembled block ring.
    pub ring_slots: usize,
    /// Which sample parity this instance handles (overridable at runtime
    /// via the TIMEIDX status key during hold-off).
    pub time_index: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            raw_ring: defaults::raw_ring(),
            blocks_ring: defaults::blocks_ring(),
            raw_slots: defaults::raw_slots(),
            frames_per_block: defaults::frames_per_block(),
            ring_slots: defaults::ring_slots(),
            time_index: 0,
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
    pub fn raw_ring() -> String {
        "/dev/shm/catcher_pkt_ring".into()
    }

    pub fn blocks_ring() -> String {
        "/dev/shm/catcher_block_ring".into()
    }

    pub fn raw_slots() -> usize {
        8
    }

    pub fn frames_per_block() -> usize {
        128
    }

    pub fn ring_slots() -> usize {
        4
    }
}

impl IngestConfig {
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
        let cfg: IngestConfig = toml::from_str("time_index = 1\nring_slots = 8\n").unwrap();
        assert_eq!(cfg.time_index, 1);
        assert_eq!(cfg.ring_slots, 8);
        assert_eq!(cfg.raw_ring, "/dev/shm/catcher_pkt_ring");
        assert_eq!(cfg.frames_per_block, 128);
    }

    #[test]
    fn empty_toml_is_fully_defaulted() {
        let cfg: IngestConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.time_index, 0);
        assert_eq!(cfg.raw_slots, 8);
    }
}
