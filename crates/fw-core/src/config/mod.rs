//! Configuration resolution
//!
//! Resolves configuration from multiple sources with priority:
//! 1. Explicit overrides (passed as parameters)
//! 2. Environment variables
//! 3. Repo-local config (.flywheel.toml)
//! 4. Global config (~/.config/flywheel/config.toml)
//! 5. Defaults

mod discovery;
mod types;

pub use discovery::{
    ConfigError, ConfigOverrides, LOCAL_CONFIG_FILE, global_config_path, resolve_config,
    resolve_user_config,
};
pub use types::{Config, LoggingConfig, StorageConfig};
