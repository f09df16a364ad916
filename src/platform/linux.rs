use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::core::disk_ops::{DiskManager, FormatterSpec, PartitionGeometry, dd_command};
use crate::core::plan::PartitionPlan;
use crate::core::process::{CommandSpec, capture};
use crate::core::{Device, FileSystemType, FlashError};

static DEVICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/dev/(?:sd[a-z]+|nvme[0-9]+n[0-9]+|mmcblk[0-9]+)$").expect("valid device regex")
});

static PARTITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/dev/(?:sd[a-z]+[0-9]+|nvme[0-9]+n[0-9]+p[0-9]+|mmcblk[0-9]+p[0-9]+)$")
        .expect("valid partition regex")
});

const BOOT_DISKS: &[&str] = &["/dev/sda", "/dev/nvme0n1"];

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,FSTYPE,LABEL,MOUNTPOINT,PATH,RM";

/// sysfs reports partition start and size in 512-byte sectors regardless of the device.
const SYSFS_SECTOR: u64 = 512;

/// Linux disk manager using lsblk, parted, mkfs.fat and sysfs
pub struct LinuxDiskManager;

impl LinuxDiskManager {
    pub fn new() -> Self {
        Self
    }

    async fn lsblk(&self, args: &[&str]) -> Result<String, FlashError> {
        let spec = CommandSpec::new("lsblk").args(args.iter().copied());
        let output = capture(&spec).await?;
        if !output.status.success() {
            return Err(FlashError::ExternalCommandFailed {
                command: spec.to_string(),
                code: output.status.code(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl Default for LinuxDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Structures for parsing lsblk JSON output
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    #[serde(default)]
    name: String,
    size: Option<SizeField>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    fstype: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    path: Option<String>,
    rm: Option<FlagField>,
    children: Option<Vec<BlockDevice>>,
}

/// `lsblk -b` prints sizes as numbers, older versions as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeField {
    Bytes(u64),
    Text(String),
}

impl SizeField {
    fn bytes(&self) -> u64 {
        match self {
            SizeField::Bytes(n) => *n,
            SizeField::Text(s) => parse_size(s),
        }
    }
}

/// `rm` is a bool on current util-linux and "0"/"1" on older releases
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlagField {
    Bool(bool),
    Text(String),
}

impl FlagField {
    fn is_set(&self) -> bool {
        match self {
            FlagField::Bool(b) => *b,
            FlagField::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        }
    }
}

impl BlockDevice {
    fn path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }
}

fn parse_lsblk(output: &str) -> Result<LsblkOutput, FlashError> {
    serde_json::from_str(output).map_err(|e| FlashError::ParseError(format!("lsblk: {e}")))
}

/// Parse lsblk JSON output into whole-disk devices.
/// `protected` names disks that hold the running system.
fn parse_lsblk_devices(output: &str, protected: &[&str]) -> Result<Vec<Device>, FlashError> {
    let lsblk = parse_lsblk(output)?;

    let mut devices = Vec::new();
    for block in lsblk.blockdevices {
        // Skip loop devices and other non-physical devices
        if block.name.starts_with("loop") || block.name.starts_with("ram") || block.name.starts_with("zram") {
            continue;
        }

        if !matches!(block.device_type.as_deref(), Some("disk")) {
            continue;
        }

        let size = block.size.as_ref().map(SizeField::bytes).unwrap_or(0);
        if size == 0 {
            continue;
        }

        let path = block.path();
        devices.push(Device {
            name: format!("Disk {}", block.name),
            size_bytes: size,
            filesystem: block.fstype.clone().unwrap_or_else(|| "Unknown".to_string()),
            label: block.label.clone().unwrap_or_else(|| block.name.clone()),
            mount_point: block.mountpoint.clone(),
            is_protected: protected.contains(&path.as_str()),
            is_removable: block.rm.as_ref().is_some_and(FlagField::is_set),
            path,
        });
    }

    Ok(devices)
}

/// Every mounted node in an lsblk tree, partitions first.
fn mounted_paths(output: &str) -> Result<Vec<String>, FlashError> {
    fn walk(block: &BlockDevice, out: &mut Vec<String>) {
        for child in block.children.iter().flatten() {
            walk(child, out);
        }
        if block.mountpoint.as_deref().is_some_and(|m| !m.is_empty()) {
            out.push(block.path());
        }
    }

    let lsblk = parse_lsblk(output)?;
    let mut paths = Vec::new();
    for block in &lsblk.blockdevices {
        walk(block, &mut paths);
    }
    Ok(paths)
}

/// Source device of `/` from `findmnt -n -o SOURCE /`. Bind mounts print
/// `/dev/sda2[/subvol]`; overlay and tmpfs roots have no device at all.
fn parse_findmnt_source(output: &str) -> Option<String> {
    let source = output.lines().next()?.trim();
    let source = source.split('[').next().unwrap_or(source);
    source.starts_with("/dev/").then(|| source.to_string())
}

/// First `disk` row of `lsblk -n -l -s -o PATH,TYPE`, which lists a device
/// and everything beneath it down to the physical disk.
fn parse_backing_disk(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        let path = cols.next()?;
        (cols.next()? == "disk").then(|| path.to_string())
    })
}

/// Partition placement from `<sys_block>/<name>/{start,size}`.
fn read_sysfs_geometry(sys_block: &Path, partition: &str) -> Result<PartitionGeometry, FlashError> {
    let name = partition.rsplit('/').next().unwrap_or(partition);
    let dir = sys_block.join(name);
    let read = |file: &str| -> Result<u64, FlashError> {
        let path = dir.join(file);
        let raw = fs::read_to_string(&path).map_err(|e| {
            FlashError::CommandFailed(format!("Cannot read partition geometry from {}: {e}", path.display()))
        })?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| FlashError::ParseError(format!("{}: {e}", path.display())))
    };

    Ok(PartitionGeometry {
        offset_bytes: read("start")? * SYSFS_SECTOR,
        size_bytes: read("size")? * SYSFS_SECTOR,
    })
}

/// Parse size string from lsblk (e.g., "500G", "1T", "256M") to bytes
fn parse_size(size_str: &str) -> u64 {
    let size_str = size_str.trim();
    if size_str.is_empty() {
        return 0;
    }

    let (num_str, suffix) = size_str.split_at(size_str.len().saturating_sub(1));
    let multiplier: u64 = match suffix.to_uppercase().as_str() {
        "B" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        "T" => 1024 * 1024 * 1024 * 1024,
        "P" => 1024 * 1024 * 1024 * 1024 * 1024,
        _ => {
            // No suffix, try to parse as bytes
            return size_str.parse().unwrap_or(0);
        }
    };

    num_str
        .trim()
        .parse::<f64>()
        .map(|n| (n * multiplier as f64) as u64)
        .unwrap_or(0)
}

#[async_trait]
impl DiskManager for LinuxDiskManager {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn device_pattern(&self) -> &Regex {
        &DEVICE_RE
    }

    fn partition_pattern(&self) -> &Regex {
        &PARTITION_RE
    }

    fn partition_suffix(&self, device: &str, index: u32) -> String {
        // The kernel inserts 'p' when the disk name already ends in a digit.
        if device.ends_with(|c: char| c.is_ascii_digit()) {
            format!("p{index}")
        } else {
            index.to_string()
        }
    }

    fn boot_disks(&self) -> &[&'static str] {
        BOOT_DISKS
    }

    fn formatter(&self) -> FormatterSpec {
        FormatterSpec {
            program: "mkfs.fat",
            probe_args: vec!["--help"],
            required_flags: vec!["-F", "-v", "-I"],
        }
    }

    fn partition_commands(&self, plan: &PartitionPlan) -> Vec<CommandSpec> {
        plan.scripts()
            .iter()
            .map(|script| {
                CommandSpec::new("parted")
                    .arg("-s")
                    .arg(plan.device.as_str())
                    .args(script.split_whitespace())
            })
            .collect()
    }

    fn format_command(&self, partition: &str, fs_type: FileSystemType) -> Option<CommandSpec> {
        match fs_type {
            FileSystemType::Fat32 => Some(
                CommandSpec::new("mkfs.fat").args(["-F", "32", "-v", "-I", partition]),
            ),
            FileSystemType::Raw => None,
        }
    }

    fn copy_command(&self, source: &Path, target: &str, block_size: u64) -> CommandSpec {
        dd_command(source, target, block_size, &["conv=fsync"])
    }

    async fn list_devices(&self) -> Result<Vec<Device>, FlashError> {
        let stdout = self.lsblk(&["--json", "-b", "-d", "-o", LSBLK_COLUMNS]).await?;
        let root = self.root_disk().await.ok().flatten();
        let protected: Vec<&str> = root.as_deref().into_iter().collect();
        parse_lsblk_devices(&stdout, &protected)
    }

    async fn device_info(&self, device: &str) -> Result<Device, FlashError> {
        let stdout = self
            .lsblk(&["--json", "-b", "-d", "-o", LSBLK_COLUMNS, device])
            .await
            .map_err(|e| match e {
                FlashError::ExternalCommandFailed { .. } => FlashError::DeviceNotFound(device.to_string()),
                other => other,
            })?;
        let root = self.root_disk().await.ok().flatten();
        let protected: Vec<&str> = root.as_deref().into_iter().collect();
        parse_lsblk_devices(&stdout, &protected)?
            .into_iter()
            .next()
            .ok_or_else(|| FlashError::DeviceNotFound(device.to_string()))
    }

    async fn root_disk(&self) -> Result<Option<String>, FlashError> {
        let output = capture(&CommandSpec::new("findmnt").args(["-n", "-o", "SOURCE", "/"])).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let Some(source) = parse_findmnt_source(&output.stdout) else {
            return Ok(None);
        };

        let output = capture(&CommandSpec::new("lsblk").args(["-n", "-l", "-s", "-o", "PATH,TYPE", &source])).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let disk = parse_backing_disk(&output.stdout);
        log::debug!("Root filesystem {source} lives on {disk:?}");
        Ok(disk)
    }

    async fn partition_geometry(&self, partition: &str) -> Result<PartitionGeometry, FlashError> {
        read_sysfs_geometry(Path::new("/sys/class/block"), partition)
    }

    async fn unmount_commands(&self, device: &str) -> Result<Vec<CommandSpec>, FlashError> {
        let stdout = self.lsblk(&["--json", "-o", "NAME,PATH,MOUNTPOINT", device]).await?;
        Ok(mounted_paths(&stdout)?
            .into_iter()
            .map(|path| CommandSpec::new("umount").arg(path))
            .collect())
    }
}
