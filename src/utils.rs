use elevate::RunningAs;
use std::sync::OnceLock;

static IS_ROOT: OnceLock<bool> = OnceLock::new();

/// Whether sdflash can open raw block devices. Checked once per process.
pub fn is_root() -> bool {
    *IS_ROOT.get_or_init(|| matches!(elevate::check(), RunningAs::Root | RunningAs::Suid))
}

/// Render a byte count with binary units, two decimals above 1 KB.
pub fn bytes_to_human(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
