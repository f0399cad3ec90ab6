//! Home directory resolution
//!
//! The global config lives under `<home>/.config/flywheel/`. Tests and
//! custom deployments point `<home>` elsewhere with `FW_HOME`.
//!
//! # Precedence
//!
//! 1. `FW_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default

use crate::config::ConfigError;
use std::path::PathBuf;

/// Environment variable that overrides the home directory
pub const HOME_ENV: &str = "FW_HOME";

/// Get the home directory used for the global config
///
/// # Errors
///
/// Returns [`ConfigError::NoHomeDir`] if `FW_HOME` is unset and the platform
/// home directory cannot be determined.
pub fn get_home_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().ok_or(ConfigError::NoHomeDir)
}
