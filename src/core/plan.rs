use std::fmt;

use super::{FileSystemType, FlashError, MIB};
use crate::config::FlashConfig;

/// Partition boundary in parted notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Mib(u64),
    End,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::Mib(n) => write!(f, "{n}MiB"),
            Boundary::End => f.write_str("100%"),
        }
    }
}

/// One step of a partition plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOp {
    CreateLabel {
        table: &'static str,
    },
    CreatePartition {
        fs_type: FileSystemType,
        start: Boundary,
        end: Boundary,
    },
}

impl PartitionOp {
    /// The op as a parted script line, e.g. `mkpart primary fat32 1MiB 65504MiB`.
    pub fn parted_script(&self) -> String {
        match self {
            PartitionOp::CreateLabel { table } => format!("mklabel {table}"),
            PartitionOp::CreatePartition {
                fs_type: FileSystemType::Fat32,
                start,
                end,
            } => format!("mkpart primary fat32 {start} {end}"),
            PartitionOp::CreatePartition {
                fs_type: FileSystemType::Raw,
                start,
                end,
            } => format!("mkpart primary {start} {end}"),
        }
    }
}

/// Label plus the two partitions of a card, derived from the card size alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub device: String,
    pub total_size_mb: u64,
    pub fat_start_mib: u64,
    pub firmware_size_mib: u64,
    pub ops: Vec<PartitionOp>,
}

impl PartitionPlan {
    pub fn compute(
        device: &str,
        total_size_mb: u64,
        config: &FlashConfig,
    ) -> Result<Self, FlashError> {
        let firmware_size_mib = config.firmware_partition_mib;
        let fat_start_mib = config.fat_start_mib;

        if total_size_mb <= firmware_size_mib {
            return Err(FlashError::PartitionPlanInvalid(format!(
                "device size {total_size_mb}MiB must exceed the {firmware_size_mib}MiB firmware partition"
            )));
        }

        let fat_end_mib = total_size_mb - firmware_size_mib;
        if fat_end_mib <= fat_start_mib {
            return Err(FlashError::PartitionPlanInvalid(format!(
                "device size {total_size_mb}MiB leaves no room for the FAT32 partition"
            )));
        }

        Ok(Self {
            device: device.to_string(),
            total_size_mb,
            fat_start_mib,
            firmware_size_mib,
            ops: vec![
                PartitionOp::CreateLabel { table: "msdos" },
                PartitionOp::CreatePartition {
                    fs_type: FileSystemType::Fat32,
                    start: Boundary::Mib(fat_start_mib),
                    end: Boundary::Mib(fat_end_mib),
                },
                PartitionOp::CreatePartition {
                    fs_type: FileSystemType::Raw,
                    start: Boundary::Mib(fat_end_mib),
                    end: Boundary::End,
                },
            ],
        })
    }

    /// Declared end of the FAT32 partition, which is also where the firmware partition starts.
    pub fn fat_end_mib(&self) -> u64 {
        self.total_size_mb - self.firmware_size_mib
    }

    pub fn firmware_start_bytes(&self) -> u64 {
        self.fat_end_mib() * MIB
    }

    pub fn firmware_size_bytes(&self) -> u64 {
        self.firmware_size_mib * MIB
    }

    /// Whether the planned firmware partition lands on an alignment boundary.
    pub fn is_firmware_aligned(&self, alignment_bytes: u64) -> bool {
        self.firmware_start_bytes() % alignment_bytes == 0
    }

    pub fn scripts(&self) -> Vec<String> {
        self.ops.iter().map(PartitionOp::parted_script).collect()
    }

    /// Check the op sequence is the label followed by FAT32 then firmware,
    /// with the FAT32 partition ending exactly where the firmware one begins.
    pub fn validate(&self) -> Result<(), FlashError> {
        let invalid = |msg: &str| Err(FlashError::PartitionPlanInvalid(msg.to_string()));

        if self.ops.len() != 3 {
            return invalid("Invalid partition command count generated");
        }

        if !matches!(self.ops[0], PartitionOp::CreateLabel { table: "msdos" }) {
            return invalid("First command must create MSDOS label");
        }

        let fat_end = Boundary::Mib(self.fat_end_mib());
        match &self.ops[1] {
            PartitionOp::CreatePartition {
                fs_type: FileSystemType::Fat32,
                end,
                ..
            } => {
                if *end != fat_end {
                    return Err(FlashError::PartitionPlanInvalid(format!(
                        "FAT32 partition must end at {fat_end}"
                    )));
                }
            }
            _ => return invalid("Second command must create FAT32 partition"),
        }

        match &self.ops[2] {
            PartitionOp::CreatePartition {
                fs_type: FileSystemType::Raw,
                start,
                end: Boundary::End,
            } if *start == fat_end => Ok(()),
            _ => invalid("Third command must create the firmware partition up to the end of the device"),
        }
    }
}
