//! Host adapters. Both real adapters only shell out to their host's tools,
//! so they build everywhere and their parsers are tested on any unix host.

pub mod fake;
pub mod linux;
pub mod macos;

use std::sync::Arc;

use crate::core::disk_ops::DiskManager;

/// Get the appropriate DiskManager for the current platform
pub fn get_disk_manager() -> Arc<dyn DiskManager> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::MacOSDiskManager::new())
    }

    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(linux::LinuxDiskManager::new())
    }
}
