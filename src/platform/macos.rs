use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::core::disk_ops::{DiskManager, FormatterSpec, PartitionGeometry, dd_command};
use crate::core::plan::PartitionPlan;
use crate::core::process::{CommandSpec, capture};
use crate::core::{Device, FileSystemType, FlashError};

static DEVICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/dev/disk[0-9]+$").expect("valid device regex"));

static PARTITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/dev/disk[0-9]+s[0-9]+$").expect("valid partition regex"));

const BOOT_DISKS: &[&str] = &["/dev/disk0"];

/// diskutil sizes in 512-byte blocks carry an `S` suffix.
const DISKUTIL_BLOCK: u64 = 512;

/// macOS disk manager built on diskutil, newfs_msdos and dd
pub struct MacOSDiskManager;

impl MacOSDiskManager {
    pub fn new() -> Self {
        Self
    }

    /// Raw `diskutil info -plist <target>` output.
    async fn diskutil_info(&self, target: &str) -> Result<String, FlashError> {
        let spec = CommandSpec::new("diskutil").args(["info", "-plist", target]);
        let output = capture(&spec).await?;
        if !output.status.success() {
            return Err(FlashError::ExternalCommandFailed {
                command: spec.to_string(),
                code: output.status.code(),
                stderr: output.combined().trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl Default for MacOSDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_plist(output: &str) -> Result<plist::Value, FlashError> {
    plist::from_bytes(output.as_bytes()).map_err(|e| FlashError::ParseError(format!("diskutil: {e}")))
}

fn dict_u64(plist: &plist::Value, key: &str) -> Option<u64> {
    plist
        .as_dictionary()
        .and_then(|d| d.get(key))
        .and_then(|v| v.as_unsigned_integer())
}

fn dict_str<'a>(plist: &'a plist::Value, key: &str) -> Option<&'a str> {
    plist
        .as_dictionary()
        .and_then(|d| d.get(key))
        .and_then(|v| v.as_string())
}

fn dict_bool(plist: &plist::Value, key: &str) -> bool {
    plist
        .as_dictionary()
        .and_then(|d| d.get(key))
        .and_then(|v| v.as_boolean())
        .unwrap_or(false)
}

/// Whole-disk identifiers from `diskutil list -plist external`.
fn parse_whole_disks(output: &str) -> Result<Vec<String>, FlashError> {
    let plist = parse_plist(output)?;
    let dict = plist
        .as_dictionary()
        .ok_or_else(|| FlashError::ParseError("diskutil list is not a dictionary".to_string()))?;

    if let Some(whole) = dict.get("WholeDisks").and_then(|v| v.as_array()) {
        return Ok(whole
            .iter()
            .filter_map(|v| v.as_string())
            .map(str::to_string)
            .collect());
    }

    // Older releases only carry AllDisksAndPartitions
    let all_disks = dict
        .get("AllDisksAndPartitions")
        .and_then(|v| v.as_array())
        .ok_or_else(|| FlashError::ParseError("Missing AllDisksAndPartitions".to_string()))?;

    Ok(all_disks
        .iter()
        .filter_map(|disk| disk.as_dictionary())
        .filter_map(|d| d.get("DeviceIdentifier").and_then(|v| v.as_string()))
        .filter(|id| extract_parent_disk(id) == *id)
        .map(str::to_string)
        .collect())
}

/// Build a `Device` from `diskutil info -plist` of a whole disk.
fn parse_disk_info(output: &str, protected: &[&str]) -> Result<Device, FlashError> {
    let plist = parse_plist(output)?;

    let identifier = dict_str(&plist, "DeviceIdentifier")
        .ok_or_else(|| FlashError::ParseError("Missing DeviceIdentifier".to_string()))?;
    let path = format!("/dev/{identifier}");

    let size_bytes = dict_u64(&plist, "TotalSize")
        .or_else(|| dict_u64(&plist, "Size"))
        .unwrap_or(0);

    let is_removable = dict_bool(&plist, "RemovableMedia")
        || dict_bool(&plist, "Removable")
        || dict_bool(&plist, "External");

    let label = dict_str(&plist, "VolumeName")
        .filter(|s| !s.is_empty())
        .or_else(|| dict_str(&plist, "MediaName"))
        .unwrap_or(identifier);

    Ok(Device {
        name: format!("Disk {identifier}"),
        size_bytes,
        filesystem: dict_str(&plist, "Content").unwrap_or("Unknown").to_string(),
        label: label.to_string(),
        mount_point: dict_str(&plist, "MountPoint")
            .filter(|m| !m.is_empty())
            .map(str::to_string),
        is_protected: protected.contains(&path.as_str()),
        is_removable,
        path,
    })
}

/// Whole disk holding the volume described by `diskutil info -plist /`.
fn parse_root_disk(output: &str) -> Result<Option<String>, FlashError> {
    let plist = parse_plist(output)?;
    let parent = dict_str(&plist, "ParentWholeDisk")
        .map(str::to_string)
        .or_else(|| dict_str(&plist, "DeviceIdentifier").map(extract_parent_disk));
    Ok(parent.map(|id| format!("/dev/{id}")))
}

/// Partition placement from `diskutil info -plist <partition>`.
fn parse_partition_geometry(output: &str) -> Result<PartitionGeometry, FlashError> {
    let plist = parse_plist(output)?;
    let offset_bytes = dict_u64(&plist, "PartitionMapPartitionOffset")
        .or_else(|| dict_u64(&plist, "Offset"))
        .ok_or_else(|| FlashError::ParseError("diskutil info has no partition offset".to_string()))?;
    let size_bytes = dict_u64(&plist, "Size")
        .or_else(|| dict_u64(&plist, "TotalSize"))
        .ok_or_else(|| FlashError::ParseError("diskutil info has no partition size".to_string()))?;
    Ok(PartitionGeometry {
        offset_bytes,
        size_bytes,
    })
}

#[async_trait]
impl DiskManager for MacOSDiskManager {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn device_pattern(&self) -> &Regex {
        &DEVICE_RE
    }

    fn partition_pattern(&self) -> &Regex {
        &PARTITION_RE
    }

    fn partition_suffix(&self, _device: &str, index: u32) -> String {
        format!("s{index}")
    }

    fn boot_disks(&self) -> &[&'static str] {
        BOOT_DISKS
    }

    fn formats_during_partitioning(&self) -> bool {
        true
    }

    fn formatter(&self) -> FormatterSpec {
        FormatterSpec {
            program: "newfs_msdos",
            probe_args: Vec::new(),
            required_flags: vec!["-F", "-v"],
        }
    }

    fn partition_commands(&self, plan: &PartitionPlan) -> Vec<CommandSpec> {
        // diskutil takes partition sizes, not boundaries. The FAT32 size is
        // given in blocks so the firmware partition starts at the planned MiB.
        let fat_blocks = (plan.fat_end_mib() - plan.fat_start_mib) * crate::core::MIB / DISKUTIL_BLOCK;
        vec![CommandSpec::new("diskutil").args([
            "partitionDisk".to_string(),
            plan.device.clone(),
            "2".to_string(),
            "MBR".to_string(),
            FileSystemType::Fat32.as_diskutil_format().to_string(),
            "SDCARD".to_string(),
            format!("{fat_blocks}S"),
            FileSystemType::Raw.as_diskutil_format().to_string(),
            "FIRMWARE".to_string(),
            "R".to_string(),
        ])]
    }

    fn format_command(&self, partition: &str, fs_type: FileSystemType) -> Option<CommandSpec> {
        match fs_type {
            FileSystemType::Fat32 => Some(
                CommandSpec::new("newfs_msdos").args(["-F", "32", "-v", "SDCARD", partition]),
            ),
            FileSystemType::Raw => None,
        }
    }

    fn copy_command(&self, source: &Path, target: &str, block_size: u64) -> CommandSpec {
        dd_command(source, target, block_size, &[])
    }

    async fn list_devices(&self) -> Result<Vec<Device>, FlashError> {
        let spec = CommandSpec::new("diskutil").args(["list", "-plist", "external"]);
        let output = capture(&spec).await?;
        if !output.status.success() {
            return Err(FlashError::CommandFailed(output.stderr.trim().to_string()));
        }

        let mut devices = Vec::new();
        for identifier in parse_whole_disks(&output.stdout)? {
            match self.device_info(&format!("/dev/{identifier}")).await {
                Ok(device) if device.size_bytes > 0 => devices.push(device),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping {identifier}: {e}"),
            }
        }
        Ok(devices)
    }

    async fn device_info(&self, device: &str) -> Result<Device, FlashError> {
        let identifier = device
            .strip_prefix("/dev/")
            .ok_or_else(|| FlashError::DeviceNotFound(device.to_string()))?;
        let output = self.diskutil_info(identifier).await.map_err(|e| match e {
            FlashError::ExternalCommandFailed { .. } => FlashError::DeviceNotFound(device.to_string()),
            other => other,
        })?;

        let root = self.root_disk().await.ok().flatten();
        let protected: Vec<&str> = root.as_deref().into_iter().collect();
        parse_disk_info(&output, &protected)
    }

    async fn root_disk(&self) -> Result<Option<String>, FlashError> {
        let spec = CommandSpec::new("diskutil").args(["info", "-plist", "/"]);
        let output = capture(&spec).await?;
        if !output.status.success() {
            return Ok(None);
        }
        parse_root_disk(&output.stdout)
    }

    async fn partition_geometry(&self, partition: &str) -> Result<PartitionGeometry, FlashError> {
        parse_partition_geometry(&self.diskutil_info(partition).await?)
    }

    async fn unmount_commands(&self, device: &str) -> Result<Vec<CommandSpec>, FlashError> {
        Ok(vec![CommandSpec::new("diskutil").args(["unmountDisk", device])])
    }
}

/// Extract parent disk from partition identifier
/// e.g., disk4s1 -> disk4, disk4s2 -> disk4, disk0s1 -> disk0
fn extract_parent_disk(identifier: &str) -> String {
    // Find the first 's' that follows a digit (partition separator); APFS
    // snapshots nest further, e.g. disk3s1s1.
    let bytes = identifier.as_bytes();
    for i in 1..bytes.len() {
        if bytes[i] == b's' && bytes[i - 1].is_ascii_digit() {
            return identifier[..i].to_string();
        }
    }
    // No partition separator found, return as-is
    identifier.to_string()
}
