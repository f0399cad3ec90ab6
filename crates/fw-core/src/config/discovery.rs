//! Configuration discovery and resolution

use super::types::{Config, LoggingConfig, StorageConfig};
use crate::home::{HOME_ENV, get_home_dir};
use crate::schema::JsonFormat;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Repo-local config file name
pub const LOCAL_CONFIG_FILE: &str = ".flywheel.toml";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Home directory could not be determined
    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Explicit overrides, usually from command-line flags
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub db_path: Option<PathBuf>,
    pub lock_timeout_secs: Option<f64>,
    pub backup: Option<bool>,
    pub backup_count: Option<u32>,
    pub json_format: Option<JsonFormat>,
    /// Config file loaded above the repo-local one. Unlike discovered
    /// files, a missing or malformed explicit file is an error.
    pub config_path: Option<PathBuf>,
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables
/// 3. Explicit config file, then repo-local `.flywheel.toml` (current dir up to the git root)
/// 4. Global config (`<home>/.config/flywheel/config.toml`)
/// 5. Defaults
///
/// File layers are merged key by key, so a repo-local file only needs the
/// keys it changes. A value of the wrong type is dropped on its own, with a
/// warning, and that key alone falls back. The storage section is validated
/// last.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    current_dir: &Path,
    home_dir: &Path,
) -> Result<Config, ConfigError> {
    let mut merged = toml::Table::new();

    // 4. Global config
    let global_config_path = global_config_path(home_dir);
    if global_config_path.exists() {
        match load_table(&global_config_path) {
            Ok(table) => merge_tables(&mut merged, table),
            Err(e) => warn!(path = %global_config_path.display(), error = %e, "Failed to parse global config"),
        }
    }

    // 3. Repo-local config, then the explicit file
    if let Some(repo_config) = find_repo_local_config(current_dir) {
        match load_table(&repo_config) {
            Ok(table) => merge_tables(&mut merged, table),
            Err(e) => warn!(path = %repo_config.display(), error = %e, "Failed to parse repo config"),
        }
    }
    if let Some(ref path) = overrides.config_path {
        merge_tables(&mut merged, load_table(path)?);
    }

    let mut config = lenient_config(merged);

    // 2. Environment variables
    apply_env_overrides(&mut config.storage);

    // 1. Explicit overrides
    apply_overrides(&mut config.storage, overrides);

    config.storage = config.storage.validated();
    Ok(config)
}

/// [`resolve_config`] for the current user
///
/// The global config is looked up under [`get_home_dir`], so `FW_HOME`
/// redirects it.
pub fn resolve_user_config(overrides: &ConfigOverrides, current_dir: &Path) -> Result<Config, ConfigError> {
    let home_dir = get_home_dir()?;
    resolve_config(overrides, current_dir, &home_dir)
}

/// `<home>/.config/flywheel/config.toml`
pub fn global_config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config").join("flywheel").join("config.toml")
}

/// Find repo-local config file
///
/// Searches current directory and parent directories up to git root
fn find_repo_local_config(current_dir: &Path) -> Option<PathBuf> {
    let mut dir = current_dir;

    loop {
        let config_path = dir.join(LOCAL_CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        // Stop at git root
        if dir.join(".git").exists() {
            break;
        }

        dir = dir.parent()?;
    }

    None
}

fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.parse::<toml::Table>()?)
}

type FieldCheck = fn(toml::Value) -> bool;

const SECTIONS: [(&str, FieldCheck); 2] = [("storage", storage_accepts), ("logging", logging_accepts)];

fn storage_accepts(single: toml::Value) -> bool {
    single.try_into::<StorageConfig>().is_ok()
}

fn logging_accepts(single: toml::Value) -> bool {
    single.try_into::<LoggingConfig>().is_ok()
}

// Each key is checked on its own so one bad value cannot take the rest of
// its section down with it.
fn lenient_config(mut merged: toml::Table) -> Config {
    for (section, accepts) in SECTIONS {
        if !merged.get(section).is_none_or(toml::Value::is_table) {
            warn!(section, "Config section is not a table; using defaults");
            merged.remove(section);
            continue;
        }
        let Some(toml::Value::Table(table)) = merged.get_mut(section) else {
            continue;
        };

        let rejected: Vec<String> = table
            .iter()
            .filter(|(key, value)| {
                let mut single = toml::Table::new();
                single.insert((*key).clone(), (*value).clone());
                !accepts(toml::Value::Table(single))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in rejected {
            if let Some(value) = table.remove(&key) {
                warn!(section, key = %key, value = %value, "Ignoring invalid config value; using default");
            }
        }
    }

    match toml::Value::Table(merged).try_into::<Config>() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Config files contain invalid values; using defaults");
            Config::default()
        }
    }
}

// Later layers win; nested tables merge recursively.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => None,
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(var = name, value = other, "Ignoring unparseable environment flag");
            None
        }
    }
}

/// Apply environment variable overrides
fn apply_env_overrides(storage: &mut StorageConfig) {
    if let Ok(path) = std::env::var("TODO_DB_PATH")
        && !path.trim().is_empty()
    {
        storage.db_path = PathBuf::from(path.trim());
    }
    if let Some(timeout) = env_value::<f64>("FW_LOCK_TIMEOUT") {
        storage.lock_timeout_secs = timeout;
    }
    if let Some(count) = env_value::<u32>("TODO_BACKUP_COUNT") {
        storage.backup_count = count;
    }
    if let Some(secs) = env_value::<i64>("FW_STALE_LOCK_SECONDS") {
        storage.stale_lock_secs = secs;
    }
    if let Some(format) = env_value::<JsonFormat>("FW_JSON_FORMAT") {
        storage.json_format = format;
    }
    if let Some(ms) = env_value::<u64>("FW_STORAGE_SLOW_LOG_THRESHOLD") {
        storage.slow_op_threshold_ms = ms;
    }
    if let Some(on) = env_flag("FW_STORAGE_METRICS_LOG") {
        storage.metrics_log = on;
    }
}

/// Apply explicit overrides
fn apply_overrides(storage: &mut StorageConfig, overrides: &ConfigOverrides) {
    if let Some(ref path) = overrides.db_path {
        storage.db_path = path.clone();
    }
    if let Some(timeout) = overrides.lock_timeout_secs {
        storage.lock_timeout_secs = timeout;
    }
    if let Some(backup) = overrides.backup {
        storage.backup = backup;
    }
    if let Some(count) = overrides.backup_count {
        storage.backup_count = count;
    }
    if let Some(format) = overrides.json_format {
        storage.json_format = format;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::time::Duration;
    use tempfile::TempDir;

    const ENV_VARS: [&str; 7] = [
        "TODO_DB_PATH",
        "FW_LOCK_TIMEOUT",
        "TODO_BACKUP_COUNT",
        "FW_STALE_LOCK_SECONDS",
        "FW_JSON_FORMAT",
        "FW_STORAGE_SLOW_LOG_THRESHOLD",
        "FW_STORAGE_METRICS_LOG",
    ];

    fn clear_env() {
        unsafe {
            for var in ENV_VARS {
                env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();

        let config = resolve_config(&ConfigOverrides::default(), temp_dir.path(), temp_dir.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        unsafe {
            env::set_var("TODO_DB_PATH", "/tmp/env-todos.json");
            env::set_var("FW_LOCK_TIMEOUT", "2.5");
            env::set_var("TODO_BACKUP_COUNT", "4");
            env::set_var("FW_STALE_LOCK_SECONDS", "60");
            env::set_var("FW_JSON_FORMAT", "compact");
            env::set_var("FW_STORAGE_SLOW_LOG_THRESHOLD", "250");
            env::set_var("FW_STORAGE_METRICS_LOG", "yes");
        }

        let config = resolve_config(&ConfigOverrides::default(), temp_dir.path(), temp_dir.path()).unwrap();
        let storage = &config.storage;
        assert_eq!(storage.db_path, PathBuf::from("/tmp/env-todos.json"));
        assert_eq!(storage.lock_timeout(), Duration::from_millis(2500));
        assert_eq!(storage.backup_count, 4);
        assert_eq!(storage.stale_lock_secs, 60);
        assert_eq!(storage.json_format, JsonFormat::Compact);
        assert_eq!(storage.slow_op_threshold_ms, 250);
        assert!(storage.metrics_log);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_values_fall_back_to_defaults() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        unsafe {
            env::set_var("FW_LOCK_TIMEOUT", "soon");
            env::set_var("FW_STALE_LOCK_SECONDS", "-5");
            env::set_var("TODO_BACKUP_COUNT", "0");
            env::set_var("FW_JSON_FORMAT", "yaml");
        }

        let config = resolve_config(&ConfigOverrides::default(), temp_dir.path(), temp_dir.path()).unwrap();
        assert_eq!(config.storage, StorageConfig::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_priority_order() {
        clear_env();
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        std::fs::create_dir(repo.path().join(".git")).unwrap();
        let nested = repo.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let global = global_config_path(home.path());
        std::fs::create_dir_all(global.parent().unwrap()).unwrap();
        std::fs::write(
            &global,
            "[storage]\nbackup = true\nbackup_count = 2\nlock_timeout_secs = 3.0\n",
        )
        .unwrap();
        std::fs::write(
            repo.path().join(LOCAL_CONFIG_FILE),
            "[storage]\nbackup_count = 5\njson_format = \"pretty\"\n",
        )
        .unwrap();
        unsafe { env::set_var("FW_LOCK_TIMEOUT", "7") };

        let overrides = ConfigOverrides {
            json_format: Some(JsonFormat::Compact),
            ..ConfigOverrides::default()
        };
        let config = resolve_config(&overrides, &nested, home.path()).unwrap();

        // global only
        assert!(config.storage.backup);
        // repo-local beats global
        assert_eq!(config.storage.backup_count, 5);
        // env beats files
        assert_eq!(config.storage.lock_timeout_secs, 7.0);
        // explicit beats everything
        assert_eq!(config.storage.json_format, JsonFormat::Compact);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_malformed_config_handled_gracefully() {
        clear_env();
        let home = TempDir::new().unwrap();
        let global = global_config_path(home.path());
        std::fs::create_dir_all(global.parent().unwrap()).unwrap();
        std::fs::write(&global, "[storage\nbackup = ").unwrap();

        let config = resolve_config(&ConfigOverrides::default(), home.path(), home.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    #[serial]
    fn test_wrong_typed_value_falls_back_alone() {
        clear_env();
        let home = TempDir::new().unwrap();
        let global = global_config_path(home.path());
        std::fs::create_dir_all(global.parent().unwrap()).unwrap();
        std::fs::write(
            &global,
            "[storage]\ndb_path = \"/data/mine.json\"\nbackup = \"yes\"\nbackup_count = 4\n\n[logging]\nlevel = 5\n",
        )
        .unwrap();

        let config = resolve_config(&ConfigOverrides::default(), home.path(), home.path()).unwrap();
        assert_eq!(config.storage.db_path, PathBuf::from("/data/mine.json"));
        assert_eq!(config.storage.backup_count, 4);
        assert!(!config.storage.backup);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    #[serial]
    fn test_non_table_section_falls_back() {
        clear_env();
        let home = TempDir::new().unwrap();
        let global = global_config_path(home.path());
        std::fs::create_dir_all(global.parent().unwrap()).unwrap();
        std::fs::write(&global, "storage = 3\n\n[logging]\nlevel = \"debug\"\n").unwrap();

        let config = resolve_config(&ConfigOverrides::default(), home.path(), home.path()).unwrap();
        assert_eq!(config.storage, StorageConfig::default());
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    #[serial]
    fn test_user_config_reads_global_file_under_fw_home() {
        clear_env();
        let home = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        let global = global_config_path(home.path());
        std::fs::create_dir_all(global.parent().unwrap()).unwrap();
        std::fs::write(&global, "[storage]\nbackup_count = 9\n").unwrap();

        let original = env::var(HOME_ENV).ok();
        unsafe { env::set_var(HOME_ENV, home.path()) };
        let config = resolve_user_config(&ConfigOverrides::default(), cwd.path());
        unsafe {
            match original {
                Some(v) => env::set_var(HOME_ENV, v),
                None => env::remove_var(HOME_ENV),
            }
        }

        assert_eq!(config.unwrap().storage.backup_count, 9);
    }

    #[test]
    #[serial]
    fn test_explicit_config_path_must_parse() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "not = [valid").unwrap();

        let overrides = ConfigOverrides {
            config_path: Some(path),
            ..ConfigOverrides::default()
        };
        assert!(matches!(
            resolve_config(&overrides, dir.path(), dir.path()),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table = "[storage]\nbackup = true\ncache = true\n".parse().unwrap();
        let layer: toml::Table = "[storage]\ncache = false\n".parse().unwrap();
        merge_tables(&mut base, layer);
        let storage = base["storage"].as_table().unwrap();
        assert_eq!(storage["backup"].as_bool(), Some(true));
        assert_eq!(storage["cache"].as_bool(), Some(false));
    }
}
