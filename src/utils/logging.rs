//! Logging bootstrap for the binary and tests.

use tracing::Level;

use crate::config::LoggingSettings;

/// Installs the global `tracing` subscriber at `level`.
///
/// Returns `false` when a subscriber was already installed, which is the
/// normal case in tests where many cases call this.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .try_init()
        .is_ok()
}

pub fn init_from(settings: &LoggingSettings) -> bool {
    init(&settings.level)
}

/// Maps a configured level name onto a [`Level`]. Unknown names mean `INFO`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
