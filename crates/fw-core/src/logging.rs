//! Shared logging initialization for flywheel binaries.
//!
//! Level precedence: `FW_LOG_LEVEL`, then `TODO_LOG_LEVEL`, then the
//! `[logging] level` config key, then `info`. Unrecognised values are
//! skipped in favour of the next source.

use crate::config::LoggingConfig;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

pub fn parse_level(raw: &str) -> Option<tracing::Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

fn resolve_level(config: &LoggingConfig) -> tracing::Level {
    ["FW_LOG_LEVEL", "TODO_LOG_LEVEL"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(config.level.clone())
        .find_map(|raw| parse_level(&raw))
        .unwrap_or(tracing::Level::INFO)
}

/// Initialize process-level tracing output with default config.
pub fn init() {
    init_with(&LoggingConfig::default());
}

/// Initialize process-level tracing output on stderr.
///
/// Safe to call multiple times; only the first call installs the
/// subscriber. Best-effort: never returns an error.
pub fn init_with(config: &LoggingConfig) {
    if INIT.get().is_some() {
        return;
    }
    let level = resolve_level(config);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}
