//! Configuration types

use crate::io::{FileLockOptions, LockPolicy, RetryPolicy, WriteOptions};
use crate::schema::JsonFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_DB_PATH: &str = ".todo.json";
pub const DEFAULT_LOCK_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_BACKUP_COUNT: u32 = 1;
pub const DEFAULT_STALE_LOCK_SECS: i64 = 300;
pub const DEFAULT_IO_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_IO_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SLOW_OP_THRESHOLD_MS: u64 = 1000;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Todo file location
    pub db_path: PathBuf,
    /// Seconds to wait for the in-process and file locks
    pub lock_timeout_secs: f64,
    /// Keep a copy of the previous file on every save
    pub backup: bool,
    /// Backup generations to keep when `backup` is on
    pub backup_count: u32,
    /// Age in seconds after which a held lock or temp file is abandoned
    pub stale_lock_secs: i64,
    pub json_format: JsonFormat,
    /// Deadline in seconds for one I/O operation including retries
    pub io_timeout_secs: f64,
    pub io_max_attempts: u32,
    /// Cache loaded todos until the file changes
    pub cache: bool,
    /// Operations slower than this are logged; 0 disables
    pub slow_op_threshold_ms: u64,
    /// Log a metrics summary on close
    pub metrics_log: bool,
    /// Run without a cross-process lock where none is available
    pub allow_degraded_locking: bool,
    pub max_file_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            backup: false,
            backup_count: DEFAULT_BACKUP_COUNT,
            stale_lock_secs: DEFAULT_STALE_LOCK_SECS,
            json_format: JsonFormat::Auto,
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            io_max_attempts: DEFAULT_IO_MAX_ATTEMPTS,
            cache: false,
            slow_op_threshold_ms: DEFAULT_SLOW_OP_THRESHOLD_MS,
            metrics_log: false,
            allow_degraded_locking: false,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

fn positive_secs(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= u32::MAX as f64
}

impl StorageConfig {
    /// Replace out-of-range values with their defaults, warning for each
    pub fn validated(mut self) -> Self {
        if self.db_path.as_os_str().is_empty() {
            warn!(default = DEFAULT_DB_PATH, "Empty db_path; using default");
            self.db_path = PathBuf::from(DEFAULT_DB_PATH);
        }
        if !positive_secs(self.lock_timeout_secs) {
            warn!(
                value = self.lock_timeout_secs,
                default = DEFAULT_LOCK_TIMEOUT_SECS,
                "Invalid lock_timeout_secs; using default"
            );
            self.lock_timeout_secs = DEFAULT_LOCK_TIMEOUT_SECS;
        }
        if self.backup_count == 0 {
            warn!(default = DEFAULT_BACKUP_COUNT, "backup_count must be at least 1; using default");
            self.backup_count = DEFAULT_BACKUP_COUNT;
        }
        if self.stale_lock_secs <= 0 {
            warn!(
                value = self.stale_lock_secs,
                default = DEFAULT_STALE_LOCK_SECS,
                "Invalid stale_lock_secs; using default"
            );
            self.stale_lock_secs = DEFAULT_STALE_LOCK_SECS;
        }
        if !positive_secs(self.io_timeout_secs) {
            warn!(
                value = self.io_timeout_secs,
                default = DEFAULT_IO_TIMEOUT_SECS,
                "Invalid io_timeout_secs; using default"
            );
            self.io_timeout_secs = DEFAULT_IO_TIMEOUT_SECS;
        }
        if self.io_max_attempts == 0 {
            warn!(default = DEFAULT_IO_MAX_ATTEMPTS, "io_max_attempts must be at least 1; using default");
            self.io_max_attempts = DEFAULT_IO_MAX_ATTEMPTS;
        }
        if self.max_file_bytes == 0 {
            warn!(default = DEFAULT_MAX_FILE_BYTES, "max_file_bytes must be positive; using default");
            self.max_file_bytes = DEFAULT_MAX_FILE_BYTES;
        }
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.lock_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.io_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs.max(0) as u64)
    }

    pub fn slow_threshold(&self) -> Option<Duration> {
        (self.slow_op_threshold_ms > 0).then(|| Duration::from_millis(self.slow_op_threshold_ms))
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: self.lock_timeout(),
            ..LockPolicy::default()
        }
    }

    pub fn file_lock_options(&self) -> FileLockOptions {
        FileLockOptions {
            timeout: self.lock_timeout(),
            stale_after: self.stale_after(),
            allow_degraded: self.allow_degraded_locking,
            ..FileLockOptions::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.io_max_attempts,
            timeout: self.io_timeout(),
            ..RetryPolicy::default()
        }
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            backup: self.backup,
            backup_count: self.backup_count,
            stale_tmp_after: self.stale_after(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}
