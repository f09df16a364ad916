//! Command-line interface for sdflash

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sdflash")]
#[command(version)]
#[command(about = "Partition, format and flash firmware onto SD cards")]
#[command(long_about = "Partition, format and flash firmware onto SD cards\n\n\
    The card gets an MBR label, a FAT32 data partition and a 32MiB firmware\n\
    partition at the end. The firmware image is written raw with dd and\n\
    verified with SHA-256.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// JSON file overriding partition sizes, alignment and timing
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List removable devices that can be flashed
    List {
        /// Show every disk, including fixed and system disks
        #[arg(long)]
        all: bool,
    },

    /// Run all pre-flash checks without touching the card
    Validate {
        /// Target disk device (e.g., /dev/disk4, /dev/sdb, /dev/mmcblk0)
        #[arg(long)]
        device: String,

        /// Firmware image to write to the firmware partition
        #[arg(long)]
        firmware: PathBuf,

        /// Card size in MiB; read from the device when omitted
        #[arg(long)]
        size_mb: Option<u64>,
    },

    /// Partition, format and flash the card
    Flash {
        /// Target disk device (e.g., /dev/disk4, /dev/sdb, /dev/mmcblk0)
        #[arg(long)]
        device: String,

        /// Firmware image to write to the firmware partition
        #[arg(long)]
        firmware: PathBuf,

        /// Card size in MiB; read from the device when omitted
        #[arg(long)]
        size_mb: Option<u64>,

        /// Skip the typed confirmation before erasing the card
        #[arg(long)]
        yes_i_know: bool,
    },

    /// Compare the firmware image against the card's firmware partition
    Verify {
        /// Target disk device (e.g., /dev/disk4, /dev/sdb, /dev/mmcblk0)
        #[arg(long)]
        device: String,

        /// Firmware image that was written
        #[arg(long)]
        firmware: PathBuf,
    },
}
