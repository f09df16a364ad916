pub mod checksum;
pub mod disk_ops;
pub mod flasher;
pub mod plan;
pub mod process;
pub mod validator;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;

/// Represents a block storage device
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub path: String,
    pub name: String,
    pub size_bytes: u64,
    pub filesystem: String,
    pub label: String,
    pub mount_point: Option<String>,
    pub is_protected: bool,
    pub is_removable: bool,
}

impl Device {
    /// Whole mebibytes available on the device, the unit partition plans work in.
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / MIB
    }

    /// A device worth offering to the user: removable and not the host's own disk.
    pub fn is_candidate(&self) -> bool {
        self.is_removable && !self.is_protected
    }
}

/// Filesystems the workflow lays down on the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemType {
    /// Data partition, formatted by the host's FAT32 tool
    Fat32,
    /// Firmware partition, written byte-for-byte with no filesystem
    Raw,
}

impl FileSystemType {
    /// Get the filesystem name as used by diskutil.
    ///
    /// diskutil has no personality for an unformatted partition that still
    /// gets a table entry ("Free Space" leaves a gap instead). The raw
    /// partition is therefore created as a throwaway FAT volume that the
    /// firmware write overwrites.
    pub fn as_diskutil_format(&self) -> &'static str {
        match self {
            FileSystemType::Fat32 => "FAT32",
            FileSystemType::Raw => "MS-DOS",
        }
    }

    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            FileSystemType::Fat32 => "FAT32",
            FileSystemType::Raw => "raw",
        }
    }
}

/// Workflow states of a single flash run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    Validating,
    Unmounting,
    Partitioning,
    Formatting,
    Writing,
    Verifying,
    Aborting,
    Completed,
    Failed,
}

impl FlashState {
    /// States in which an external command may be live and abort is meaningful.
    pub fn is_abortable(&self) -> bool {
        matches!(
            self,
            FlashState::Unmounting
                | FlashState::Partitioning
                | FlashState::Formatting
                | FlashState::Writing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlashState::Completed | FlashState::Failed)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashState::Idle => "idle",
            FlashState::Validating => "validating",
            FlashState::Unmounting => "unmounting",
            FlashState::Partitioning => "partitioning",
            FlashState::Formatting => "formatting",
            FlashState::Writing => "writing",
            FlashState::Verifying => "verifying",
            FlashState::Aborting => "aborting",
            FlashState::Completed => "completed",
            FlashState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while validating or flashing a card
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Invalid device path format: {device}. Expected format: {expected}")]
    InvalidDeviceFormat { device: String, expected: String },

    #[error("Device does not exist: {0}")]
    DeviceNotFound(String),

    #[error("Device {0} is the host's system disk")]
    SystemDiskRejected(String),

    #[error("Device {0} is not removable or external")]
    DeviceNotRemovable(String),

    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    #[error("{tool} does not support required flags: {}", .flags.join(", "))]
    FlagUnsupported { tool: String, flags: Vec<String> },

    #[error("Invalid partition plan: {0}")]
    PartitionPlanInvalid(String),

    #[error("Partition not aligned to {alignment} byte boundary (offset: {offset})")]
    MisalignedPartition { offset: u64, alignment: u64 },

    #[error("Partition size is {size} bytes, expected {expected} bytes")]
    WrongPartitionSize { size: u64, expected: u64 },

    #[error("Source file does not exist: {}", .0.display())]
    SourceFileMissing(PathBuf),

    #[error("Invalid target partition format: {0}")]
    InvalidTargetFormat(String),

    #[error("Target device does not exist: {0}")]
    TargetUnreachable(String),

    #[error("Firmware image is {size} bytes, larger than the {capacity} byte firmware partition")]
    FirmwareTooLarge { size: u64, capacity: u64 },

    #[error("Command `{command}` failed (exit={code:?}): {stderr}")]
    ExternalCommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Checksum mismatch: source {source_digest}, target {target_digest}")]
    ChecksumMismatch {
        source_digest: String,
        target_digest: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("Partial read from {path}: got {read} of {expected} bytes")]
    PartialRead {
        path: String,
        read: u64,
        expected: u64,
    },

    #[error("Aborted by user")]
    UserAborted,

    #[error("Another flash operation is already in progress")]
    FlashInProgress,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FlashError {
    /// Human-readable remediation shown next to the error.
    pub fn hint(&self) -> &'static str {
        match self {
            FlashError::InvalidDeviceFormat { .. } => {
                "pass the whole-disk node (e.g. /dev/sdb or /dev/disk4), not a partition"
            }
            FlashError::DeviceNotFound(_) | FlashError::TargetUnreachable(_) => {
                "check the card is inserted and refresh the device list"
            }
            FlashError::SystemDiskRejected(_) => "choose the SD card, never the host's boot disk",
            FlashError::DeviceNotRemovable(_) => "use a removable card reader or external device",
            FlashError::ToolMissing(_) => "install the missing disk utility (dosfstools for mkfs.fat, parted)",
            FlashError::FlagUnsupported { .. } => "upgrade the formatting tool to a current release",
            FlashError::PartitionPlanInvalid(_) => {
                "the card must be larger than the firmware partition"
            }
            FlashError::MisalignedPartition { .. } | FlashError::WrongPartitionSize { .. } => {
                "repartition the card; the firmware partition may not boot"
            }
            FlashError::SourceFileMissing(_) => "select an existing firmware image",
            FlashError::InvalidTargetFormat(_) => "the device naming scheme is not supported",
            FlashError::FirmwareTooLarge { .. } => "the image does not fit the firmware partition",
            FlashError::ExternalCommandFailed { .. } | FlashError::CommandFailed(_) => {
                "see the command output above; run with elevated privileges if access was denied"
            }
            FlashError::ChecksumMismatch { .. } | FlashError::PartialRead { .. } => {
                "flash the card again or try another card"
            }
            FlashError::PermissionDenied(_) => "run with elevated privileges",
            FlashError::DeviceDisconnected(_) => "device may be disconnected; reinsert the card",
            FlashError::UserAborted => "the card is in an unknown state; flash it again",
            FlashError::FlashInProgress => "wait for the running flash to finish",
            FlashError::ValidationFailed(_) => "fix the failed checks listed above",
            FlashError::ParseError(_) => "the disk utility output was not understood",
            FlashError::IoError(_) => "check the device and file permissions",
        }
    }

    pub fn is_user_aborted(&self) -> bool {
        matches!(self, FlashError::UserAborted)
    }
}
