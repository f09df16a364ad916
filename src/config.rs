use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::MIB;

/// Tunables for validation and flashing. Every field has a default, so a
/// config file only needs the keys it wants to change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Size of the firmware partition at the end of the card
    pub firmware_partition_mib: u64,
    /// Start of the FAT32 partition
    pub fat_start_mib: u64,
    /// Required alignment of the firmware partition start, in bytes
    pub alignment_bytes: u64,
    /// Allowed deviation of the firmware partition size, in bytes
    pub size_tolerance_bytes: u64,
    /// Block size handed to the raw copier, also the checksum read chunk
    pub block_size_bytes: u64,
    pub progress_interval_ms: u64,
    /// How long a terminated command gets before it is killed
    pub abort_grace_ms: u64,
    /// Fraction of the image that must be readable back before a short read
    /// is treated as an error rather than a mismatch
    pub partial_read_threshold: f64,
    /// Disks that must never be flashed, in addition to the platform's list
    pub extra_boot_disks: Vec<String>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            firmware_partition_mib: 32,
            fat_start_mib: 1,
            alignment_bytes: 32 * MIB,
            size_tolerance_bytes: MIB,
            block_size_bytes: 4 * MIB,
            progress_interval_ms: 1000,
            abort_grace_ms: 2000,
            partial_read_threshold: 0.9,
            extra_boot_disks: Vec::new(),
        }
    }
}

impl FlashConfig {
    /// Load from a JSON file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: FlashConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if config.firmware_partition_mib == 0 || config.alignment_bytes == 0 {
            anyhow::bail!("firmware_partition_mib and alignment_bytes must be non-zero");
        }
        if config.block_size_bytes == 0 || config.progress_interval_ms == 0 {
            anyhow::bail!("block_size_bytes and progress_interval_ms must be non-zero");
        }
        if !(0.0..=1.0).contains(&config.partial_read_threshold) {
            anyhow::bail!("partial_read_threshold must be between 0 and 1");
        }

        log::debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn firmware_partition_bytes(&self) -> u64 {
        self.firmware_partition_mib * MIB
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}
