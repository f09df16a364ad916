use std::path::Path;

use async_trait::async_trait;
use regex::Regex;

use super::plan::PartitionPlan;
use super::process::CommandSpec;
use super::{Device, FlashError, FileSystemType};

/// On-disk placement of one partition, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionGeometry {
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

/// The host's FAT32 formatter and the flags the workflow invokes it with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatterSpec {
    pub program: &'static str,
    /// Arguments that make the tool print its usage text
    pub probe_args: Vec<&'static str>,
    pub required_flags: Vec<&'static str>,
}

/// Trait for platform-specific disk operations.
///
/// Everything that differs between hosts lives behind this trait: device
/// naming, how disks are discovered, and which commands partition, format,
/// unmount and copy. The validator and flasher only talk to this.
#[async_trait]
pub trait DiskManager: Send + Sync {
    /// Short name of the host model, for messages
    fn name(&self) -> &'static str;

    /// Whole-disk device nodes, e.g. `/dev/disk4` or `/dev/sdb`
    fn device_pattern(&self) -> &Regex;

    /// Partition nodes, e.g. `/dev/disk4s2` or `/dev/sdb2`
    fn partition_pattern(&self) -> &Regex;

    /// Suffix appended to `device` to name partition `index`
    fn partition_suffix(&self, device: &str, index: u32) -> String;

    /// Disks that are the boot disk on practically every host of this kind
    fn boot_disks(&self) -> &[&'static str];

    /// Whether `partition_commands` also creates the FAT32 filesystem
    fn formats_during_partitioning(&self) -> bool {
        false
    }

    fn formatter(&self) -> FormatterSpec;

    /// Commands that lay the plan down on disk, in execution order
    fn partition_commands(&self, plan: &PartitionPlan) -> Vec<CommandSpec>;

    /// Command that formats `partition`; `None` when no filesystem is needed
    fn format_command(&self, partition: &str, fs_type: FileSystemType) -> Option<CommandSpec>;

    /// Raw copy of `source` onto `target` in `block_size` chunks, reporting
    /// progress on stderr
    fn copy_command(&self, source: &Path, target: &str, block_size: u64) -> CommandSpec;

    /// Scans system for block devices
    async fn list_devices(&self) -> Result<Vec<Device>, FlashError>;

    /// Details of one whole-disk device
    async fn device_info(&self, device: &str) -> Result<Device, FlashError>;

    async fn device_size_bytes(&self, device: &str) -> Result<u64, FlashError> {
        Ok(self.device_info(device).await?.size_bytes)
    }

    /// Whole disk backing the root filesystem, `None` if it cannot be told
    async fn root_disk(&self) -> Result<Option<String>, FlashError>;

    async fn partition_geometry(&self, partition: &str) -> Result<PartitionGeometry, FlashError>;

    /// Commands that unmount everything mounted from `device`
    async fn unmount_commands(&self, device: &str) -> Result<Vec<CommandSpec>, FlashError>;
}

/// `dd` invocation shared by the unix hosts.
pub fn dd_command(source: &Path, target: &str, block_size: u64, extra: &[&str]) -> CommandSpec {
    CommandSpec::new("dd")
        .arg(format!("if={}", source.display()))
        .arg(format!("of={target}"))
        .arg(format!("bs={block_size}"))
        .args(extra.iter().copied())
        .arg("status=progress")
}
