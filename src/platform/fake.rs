//! Fake disk manager for testing.
//!
//! Devices are plain files under a scratch directory and every mutating
//! command is a harmless `true`/`false`, so the whole workflow can run in CI
//! without root or a card reader. Each command handed out is recorded.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;

use crate::core::disk_ops::{DiskManager, FormatterSpec, PartitionGeometry, dd_command};
use crate::core::plan::PartitionPlan;
use crate::core::process::CommandSpec;
use crate::core::{Device, FileSystemType, FlashError, MIB};

/// What the fake reports as the disk holding `/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootDisk {
    Disk(String),
    Unknown,
    LookupFails,
}

pub struct FakeDiskManager {
    root: PathBuf,
    device_re: Regex,
    partition_re: Regex,
    removable: bool,
    size_bytes: u64,
    root_disk: RootDisk,
    geometry: Option<PartitionGeometry>,
    formats_during_partitioning: bool,
    formatter_program: &'static str,
    formatter_usage: &'static str,
    failing_partition_step: Option<usize>,
    unmount_fails: bool,
    copy_override: Option<CommandSpec>,
    issued: Mutex<Vec<String>>,
}

impl FakeDiskManager {
    /// Fake host whose cards live under `root` as `mmc<N>` with `mmc<N>p<M>` partitions.
    pub fn new(root: &Path) -> Self {
        let escaped = regex::escape(&root.to_string_lossy());
        Self {
            root: root.to_path_buf(),
            device_re: Regex::new(&format!("^{escaped}/mmc[0-9]+$")).expect("escaped device regex"),
            partition_re: Regex::new(&format!("^{escaped}/mmc[0-9]+p[0-9]+$"))
                .expect("escaped partition regex"),
            removable: true,
            size_bytes: 64 * 1024 * MIB,
            root_disk: RootDisk::Unknown,
            geometry: Some(PartitionGeometry {
                offset_bytes: 65504 * MIB,
                size_bytes: 32 * MIB,
            }),
            formats_during_partitioning: false,
            formatter_program: "echo",
            formatter_usage: "Usage: mkfs.fat [-F fat-size] [-v] [-I] TARGET",
            failing_partition_step: None,
            unmount_fails: false,
            copy_override: None,
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn removable(mut self, removable: bool) -> Self {
        self.removable = removable;
        self
    }

    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_root_disk(mut self, root_disk: RootDisk) -> Self {
        self.root_disk = root_disk;
        self
    }

    /// Report no partition table, as on a blank card.
    pub fn without_geometry(mut self) -> Self {
        self.geometry = None;
        self
    }

    pub fn with_geometry(mut self, geometry: PartitionGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn formatting_while_partitioning(mut self) -> Self {
        self.formats_during_partitioning = true;
        self
    }

    pub fn with_formatter_program(mut self, program: &'static str) -> Self {
        self.formatter_program = program;
        self
    }

    pub fn with_formatter_usage(mut self, usage: &'static str) -> Self {
        self.formatter_usage = usage;
        self
    }

    /// Make partition command number `step` (0-based) exit non-zero.
    pub fn failing_partition_step(mut self, step: usize) -> Self {
        self.failing_partition_step = Some(step);
        self
    }

    pub fn failing_unmount(mut self) -> Self {
        self.unmount_fails = true;
        self
    }

    /// Replace the raw copy, e.g. with a long `sleep` or a corrupting write.
    pub fn with_copy_command(mut self, spec: CommandSpec) -> Self {
        self.copy_override = Some(spec);
        self
    }

    pub fn device_path(&self, index: u32) -> String {
        format!("{}/mmc{index}", self.root.display())
    }

    /// Create the device node for card `index` and return its path.
    pub fn create_device(&self, index: u32) -> String {
        let path = self.device_path(index);
        if let Err(e) = fs::write(&path, b"") {
            log::warn!("Could not create fake device {path}: {e}");
        }
        path
    }

    /// Every command handed out so far, in order.
    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, spec: CommandSpec) -> CommandSpec {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.to_string());
        spec
    }

    fn exit_with(ok: bool) -> CommandSpec {
        CommandSpec::new(if ok { "true" } else { "false" })
    }
}

#[async_trait]
impl DiskManager for FakeDiskManager {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn device_pattern(&self) -> &Regex {
        &self.device_re
    }

    fn partition_pattern(&self) -> &Regex {
        &self.partition_re
    }

    fn partition_suffix(&self, _device: &str, index: u32) -> String {
        format!("p{index}")
    }

    fn boot_disks(&self) -> &[&'static str] {
        &[]
    }

    fn formats_during_partitioning(&self) -> bool {
        self.formats_during_partitioning
    }

    fn formatter(&self) -> FormatterSpec {
        FormatterSpec {
            program: self.formatter_program,
            probe_args: vec![self.formatter_usage],
            required_flags: vec!["-F", "-v", "-I"],
        }
    }

    fn partition_commands(&self, plan: &PartitionPlan) -> Vec<CommandSpec> {
        plan.scripts()
            .iter()
            .enumerate()
            .map(|(step, script)| {
                let ok = self.failing_partition_step != Some(step);
                self.record(
                    Self::exit_with(ok)
                        .args(["parted", "-s", plan.device.as_str()])
                        .args(script.split_whitespace()),
                )
            })
            .collect()
    }

    fn format_command(&self, partition: &str, fs_type: FileSystemType) -> Option<CommandSpec> {
        match fs_type {
            FileSystemType::Fat32 => Some(self.record(
                Self::exit_with(true).args(["mkfs.fat", "-F", "32", "-v", "-I", partition]),
            )),
            FileSystemType::Raw => None,
        }
    }

    fn copy_command(&self, source: &Path, target: &str, block_size: u64) -> CommandSpec {
        let spec = self
            .copy_override
            .clone()
            .unwrap_or_else(|| dd_command(source, target, block_size, &[]));
        self.record(spec)
    }

    async fn list_devices(&self) -> Result<Vec<Device>, FlashError> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path().to_string_lossy().into_owned();
            if self.device_re.is_match(&path) {
                devices.push(self.device_info(&path).await?);
            }
        }
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    async fn device_info(&self, device: &str) -> Result<Device, FlashError> {
        if !Path::new(device).exists() {
            return Err(FlashError::DeviceNotFound(device.to_string()));
        }
        Ok(Device {
            path: device.to_string(),
            name: format!("Fake {device}"),
            size_bytes: self.size_bytes,
            filesystem: "Unknown".to_string(),
            label: "FAKE".to_string(),
            mount_point: None,
            is_protected: matches!(&self.root_disk, RootDisk::Disk(d) if d == device),
            is_removable: self.removable,
        })
    }

    async fn root_disk(&self) -> Result<Option<String>, FlashError> {
        match &self.root_disk {
            RootDisk::Disk(disk) => Ok(Some(disk.clone())),
            RootDisk::Unknown => Ok(None),
            RootDisk::LookupFails => Err(FlashError::CommandFailed("findmnt: not available".to_string())),
        }
    }

    async fn partition_geometry(&self, partition: &str) -> Result<PartitionGeometry, FlashError> {
        self.geometry
            .ok_or_else(|| FlashError::CommandFailed(format!("{partition}: no partition table")))
    }

    async fn unmount_commands(&self, device: &str) -> Result<Vec<CommandSpec>, FlashError> {
        let spec = Self::exit_with(!self.unmount_fails).args(["umount", device]);
        Ok(vec![self.record(spec)])
    }
}
