use log::LevelFilter;

/// Initialize the global logger on stderr. Workflow messages already reach
/// the terminal as events, so the default only shows warnings; each `-v`
/// raises the level and `RUST_LOG` overrides both.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}
