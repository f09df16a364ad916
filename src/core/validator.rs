use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::checksum::{self, ChecksumRecord};
use super::disk_ops::{DiskManager, PartitionGeometry};
use super::plan::PartitionPlan;
use super::process::{CommandSpec, capture};
use super::{FileSystemType, FlashError, MIB};
use crate::config::FlashConfig;
use crate::utils;

/// How a check's failure affects the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckCategory {
    /// Must pass before anything destructive happens
    Required,
    /// Only meaningful once partitions exist; informational before that
    Pending,
    /// Hints about flash parameters
    Optional,
    /// Only meaningful after the firmware has been written
    PostFlash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckName {
    Device,
    PartitionPlan,
    Formatting,
    Alignment,
    WriteTarget,
    FlashParameters,
    Checksum,
}

impl CheckName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::Device => "device",
            CheckName::PartitionPlan => "partition_sequence",
            CheckName::Formatting => "formatting",
            CheckName::Alignment => "alignment",
            CheckName::WriteTarget => "dd_write",
            CheckName::FlashParameters => "flash_parameters",
            CheckName::Checksum => "checksum",
        }
    }

    pub fn category(&self) -> CheckCategory {
        match self {
            CheckName::Device
            | CheckName::PartitionPlan
            | CheckName::Formatting
            | CheckName::WriteTarget => CheckCategory::Required,
            CheckName::Alignment => CheckCategory::Pending,
            CheckName::FlashParameters => CheckCategory::Optional,
            CheckName::Checksum => CheckCategory::PostFlash,
        }
    }
}

#[derive(Debug)]
pub enum CheckStatus {
    Passed(String),
    Failed(FlashError),
    NotPerformed(String),
}

impl CheckStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, CheckStatus::Failed(_))
    }
}

impl From<Result<String, FlashError>> for CheckStatus {
    fn from(result: Result<String, FlashError>) -> Self {
        match result {
            Ok(message) => CheckStatus::Passed(message),
            Err(e) => CheckStatus::Failed(e),
        }
    }
}

#[derive(Debug)]
pub struct CheckEntry {
    pub name: CheckName,
    pub status: CheckStatus,
}

impl CheckEntry {
    pub fn category(&self) -> CheckCategory {
        self.name.category()
    }
}

impl fmt::Display for CheckEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.as_str();
        match &self.status {
            CheckStatus::Passed(message) => write!(f, "✓ {name}: {message}"),
            CheckStatus::Failed(e) => write!(f, "✗ {name}: {e} (hint: {})", e.hint()),
            CheckStatus::NotPerformed(message) => write!(f, "… {name}: {message}"),
        }
    }
}

/// Outcome of every check that ran, in the order they ran.
#[derive(Debug, Default)]
pub struct ValidationResult {
    entries: Vec<CheckEntry>,
}

impl ValidationResult {
    pub fn record(&mut self, name: CheckName, status: impl Into<CheckStatus>) {
        let status = status.into();
        match &status {
            CheckStatus::Failed(e) => log::warn!("Check {} failed: {e}", name.as_str()),
            CheckStatus::Passed(message) => log::debug!("Check {} passed: {message}", name.as_str()),
            CheckStatus::NotPerformed(_) => {}
        }
        self.entries.push(CheckEntry { name, status });
    }

    /// Overwrite the status of an already recorded check, e.g. the checksum
    /// placeholder once the firmware has been written.
    pub fn replace(&mut self, name: CheckName, status: impl Into<CheckStatus>) {
        let status = status.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.status = status,
            None => self.entries.push(CheckEntry { name, status }),
        }
    }

    pub fn entries(&self) -> &[CheckEntry] {
        &self.entries
    }

    pub fn get(&self, name: CheckName) -> Option<&CheckStatus> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.status)
    }

    pub fn contains(&self, name: CheckName) -> bool {
        self.get(name).is_some()
    }

    /// True when no Required check failed. An empty result has not passed anything.
    pub fn required_passed(&self) -> bool {
        !self.entries.is_empty() && self.required_failures().next().is_none()
    }

    pub fn required_failures(&self) -> impl Iterator<Item = &CheckEntry> {
        self.entries
            .iter()
            .filter(|e| e.category() == CheckCategory::Required && e.status.is_failed())
    }

    /// Failures that are surfaced but never block the workflow.
    pub fn advisory_failures(&self) -> impl Iterator<Item = &CheckEntry> {
        self.entries
            .iter()
            .filter(|e| e.category() != CheckCategory::Required && e.status.is_failed())
    }

    /// All Required failures joined into one message.
    pub fn failure_summary(&self) -> String {
        self.required_failures()
            .filter_map(|e| match &e.status {
                CheckStatus::Failed(err) => Some(format!("{}: {err}", e.name.as_str())),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// Check the firmware partition sits on an alignment boundary and has the expected size.
pub fn check_alignment(geometry: &PartitionGeometry, config: &FlashConfig) -> Result<(), FlashError> {
    let alignment = config.alignment_bytes;
    if geometry.offset_bytes % alignment != 0 {
        return Err(FlashError::MisalignedPartition {
            offset: geometry.offset_bytes,
            alignment,
        });
    }

    let expected = config.firmware_partition_bytes();
    if geometry.size_bytes.abs_diff(expected) > config.size_tolerance_bytes {
        return Err(FlashError::WrongPartitionSize {
            size: geometry.size_bytes,
            expected,
        });
    }

    Ok(())
}

/// Whether a tool's usage text lists `flag`. `-F32` counts as `-F`, `-Fx` does not.
fn advertises_flag(usage: &str, flag: &str) -> bool {
    usage
        .split(|c: char| c.is_whitespace() || "[]|(),".contains(c))
        .filter_map(|token| token.strip_prefix(flag))
        .any(|rest| !rest.starts_with(|c: char| c.is_ascii_alphabetic()))
}

/// Decides whether a device and a firmware image are safe to flash. Reads
/// host state through the `DiskManager` but never changes it.
pub struct Validator {
    disk_manager: Arc<dyn DiskManager>,
    config: FlashConfig,
}

impl Validator {
    pub fn new(disk_manager: Arc<dyn DiskManager>, config: FlashConfig) -> Self {
        Self {
            disk_manager,
            config,
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Name of partition `index` on `device`. Every partition path in the crate comes from here.
    pub fn partition_device_name(&self, device: &str, index: u32) -> String {
        format!("{device}{}", self.disk_manager.partition_suffix(device, index))
    }

    pub async fn validate_device(&self, device: &str) -> Result<String, FlashError> {
        let pattern = self.disk_manager.device_pattern();
        if !pattern.is_match(device) {
            return Err(FlashError::InvalidDeviceFormat {
                device: device.to_string(),
                expected: format!("{} ({})", pattern.as_str(), self.disk_manager.name()),
            });
        }

        if !Path::new(device).exists() {
            return Err(FlashError::DeviceNotFound(device.to_string()));
        }

        // Must stay ahead of the removability check: some internal disks report as removable.
        if self.is_system_device(device).await {
            return Err(FlashError::SystemDiskRejected(device.to_string()));
        }

        let info = self.disk_manager.device_info(device).await?;
        if !info.is_removable {
            return Err(FlashError::DeviceNotRemovable(device.to_string()));
        }

        Ok("Device validation passed".to_string())
    }

    /// Whether `device` is the host's own disk. Fails open: when the root disk
    /// cannot be determined, only the static deny-list applies.
    pub async fn is_system_device(&self, device: &str) -> bool {
        let denied = self.disk_manager.boot_disks().contains(&device)
            || self.config.extra_boot_disks.iter().any(|d| d == device);
        if denied {
            return true;
        }

        match self.disk_manager.root_disk().await {
            Ok(Some(root)) => root == device,
            Ok(None) => {
                log::warn!("Could not determine the root disk; treating {device} as not the system disk");
                false
            }
            Err(e) => {
                log::warn!("Root disk lookup failed ({e}); treating {device} as not the system disk");
                false
            }
        }
    }

    pub fn compute_partition_plan(
        &self,
        device: &str,
        total_size_mb: u64,
    ) -> Result<PartitionPlan, FlashError> {
        PartitionPlan::compute(device, total_size_mb, &self.config)
    }

    pub async fn validate_formatting_tools(&self, fs_type: FileSystemType) -> Result<String, FlashError> {
        if fs_type == FileSystemType::Raw {
            return Ok("No formatting tool required for the raw partition".to_string());
        }

        let formatter = self.disk_manager.formatter();
        let probe = CommandSpec::new(formatter.program).args(formatter.probe_args.iter().copied());
        // Usage output goes to stdout or stderr depending on the tool version,
        // and some exit non-zero after printing it, so only the text matters.
        let usage = capture(&probe).await?.combined();

        let missing: Vec<String> = formatter
            .required_flags
            .iter()
            .filter(|flag| !advertises_flag(&usage, flag))
            .map(|flag| flag.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(FlashError::FlagUnsupported {
                tool: formatter.program.to_string(),
                flags: missing,
            });
        }

        Ok(format!(
            "{} formatting flags validation passed ({})",
            fs_type.display_name(),
            formatter.program
        ))
    }

    pub async fn validate_partition_alignment(&self, device: &str) -> Result<String, FlashError> {
        let partition = self.partition_device_name(device, 2);
        let geometry = self.disk_manager.partition_geometry(&partition).await?;
        check_alignment(&geometry, &self.config)?;
        Ok(format!(
            "Partition alignment validation passed ({partition} at {}MiB, {}MiB)",
            geometry.offset_bytes / MIB,
            geometry.size_bytes / MIB
        ))
    }

    /// Called before and after partitioning, so a partition node that does
    /// not exist yet is not an error.
    pub fn validate_write_target(
        &self,
        source: &Path,
        device: &str,
        partition_index: u32,
    ) -> Result<String, FlashError> {
        if !source.is_file() {
            return Err(FlashError::SourceFileMissing(source.to_path_buf()));
        }

        let target = self.partition_device_name(device, partition_index);
        if !self.disk_manager.partition_pattern().is_match(&target) {
            return Err(FlashError::InvalidTargetFormat(target));
        }

        if !Path::new(device).exists() {
            return Err(FlashError::TargetUnreachable(device.to_string()));
        }

        if !Path::new(&target).exists() {
            return Ok(format!(
                "DD write validation passed ({target} will be created by partitioning)"
            ));
        }

        Ok("DD write validation passed".to_string())
    }

    /// Hints that do not block a flash: planned alignment, image size, privileges.
    pub fn validate_flash_parameters(
        &self,
        plan: Option<&PartitionPlan>,
        source: Option<&Path>,
    ) -> Result<String, FlashError> {
        let capacity = self.config.firmware_partition_bytes();
        if let Some(size) = source.and_then(|s| s.metadata().ok()).map(|m| m.len()) {
            if size > capacity {
                return Err(FlashError::FirmwareTooLarge { size, capacity });
            }
        }

        if let Some(plan) = plan {
            if !plan.is_firmware_aligned(self.config.alignment_bytes) {
                return Err(FlashError::MisalignedPartition {
                    offset: plan.firmware_start_bytes(),
                    alignment: self.config.alignment_bytes,
                });
            }
        }

        if !utils::is_root() {
            return Ok("Flash parameters look good; not running as root, commands may be denied".to_string());
        }
        Ok("Flash parameters look good".to_string())
    }

    /// Compare the firmware image against what was written to partition `partition_index`.
    pub async fn verify_checksum(
        &self,
        source: &Path,
        device: &str,
        partition_index: u32,
    ) -> Result<ChecksumRecord, FlashError> {
        let source = source.to_path_buf();
        let target = self.partition_device_name(device, partition_index);
        let chunk = self.config.block_size_bytes as usize;
        let threshold = self.config.partial_read_threshold;

        tokio::task::spawn_blocking(move || checksum::verify(&source, &target, chunk, threshold))
            .await
            .map_err(|e| FlashError::IoError(io::Error::other(e)))?
    }

    /// Run every check in a fixed order. Nothing after the device check is
    /// meaningful without a valid device, so a device failure ends the run.
    pub async fn run_all_checks(
        &self,
        device: &str,
        total_size_mb: u64,
        source: Option<&Path>,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();

        let device_check = self.validate_device(device).await;
        let device_ok = device_check.is_ok();
        result.record(CheckName::Device, device_check);
        if !device_ok {
            log::info!("Device check failed for {device}, skipping remaining checks");
            return result;
        }

        let plan = match self
            .compute_partition_plan(device, total_size_mb)
            .and_then(|plan| plan.validate().map(|_| plan))
        {
            Ok(plan) => {
                result.record(
                    CheckName::PartitionPlan,
                    CheckStatus::Passed(format!(
                        "Partition sequence validated: {}",
                        plan.scripts().join("; ")
                    )),
                );
                Some(plan)
            }
            Err(e) => {
                result.record(CheckName::PartitionPlan, CheckStatus::Failed(e));
                None
            }
        };

        result.record(
            CheckName::Formatting,
            self.validate_formatting_tools(FileSystemType::Fat32).await,
        );

        result.record(
            CheckName::Alignment,
            self.validate_partition_alignment(device).await,
        );

        match source {
            Some(source) => result.record(
                CheckName::WriteTarget,
                self.validate_write_target(source, device, 2),
            ),
            None => result.record(
                CheckName::WriteTarget,
                CheckStatus::NotPerformed("No firmware image selected".to_string()),
            ),
        }

        result.record(
            CheckName::FlashParameters,
            self.validate_flash_parameters(plan.as_ref(), source),
        );

        result.record(
            CheckName::Checksum,
            CheckStatus::NotPerformed("Verified after the firmware is written".to_string()),
        );

        result
    }
}
