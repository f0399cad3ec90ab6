//! Todo storage facade
//!
//! [`TodoStorage`] wires the io core together for one todo file: a
//! [`HybridMutex`] and [`PlatformFileLock`] for exclusion, [`RetryableIo`]
//! and [`OperationMetrics`] for every filesystem call, and an
//! [`AtomicWriter`] for saves.
//!
//! Loads take no lock. They open the file directly (a vanished file reads as
//! empty), check the size on the open handle, and decode all-or-nothing.
//!
//! `load` and `save` block and refuse to run on an async executor thread.
//! From async code use the `_async` variants, or run them through
//! [`crate::io::spawn_blocking`].

use crate::config::{Config, StorageConfig};
use crate::io::{
    AtomicWriter, ExecutionContext, HybridMutex, LockStats, MetricsSnapshot, OpType,
    OperationMetrics, PlatformFileLock, RetryableIo, StorageError,
};
use crate::schema::{self, Todo};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

// Identity of one on-disk version of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
    #[cfg(unix)]
    ino: u64,
}

impl FileStamp {
    fn of(meta: &Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            #[cfg(unix)]
            ino: std::os::unix::fs::MetadataExt::ino(meta),
        }
    }
}

enum ReadOutcome {
    Missing,
    Unchanged,
    Data { bytes: Vec<u8>, stamp: FileStamp },
    TooLarge(u64),
}

#[derive(Clone)]
struct CacheEntry {
    stamp: FileStamp,
    todos: Arc<Vec<Todo>>,
}

/// Result of [`TodoStorage::health_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// A file can be created in the target directory
    pub writable: bool,
    /// The cross-process lock can be taken and released
    pub lock_ok: bool,
    /// The target is absent or decodes cleanly
    pub file_readable: bool,
    pub healthy: bool,
}

pub struct TodoStorage {
    path: PathBuf,
    config: StorageConfig,
    mutex: Arc<HybridMutex>,
    writer: Arc<AtomicWriter>,
    io: RetryableIo,
    metrics: Arc<OperationMetrics>,
    cache: Mutex<Option<CacheEntry>>,
    closed: AtomicBool,
}

impl TodoStorage {
    /// Open storage for the todo file at `path`
    ///
    /// Nothing is read or created yet. Fails with
    /// [`StorageError::PlatformUnsupported`] when no cross-process lock is
    /// available and degraded locking was not requested.
    pub fn open(path: impl Into<PathBuf>, config: StorageConfig) -> Result<Self, StorageError> {
        let path = path.into();
        let config = config.validated();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "todo".to_string());

        let mutex = Arc::new(HybridMutex::with_policy(name, config.lock_policy()));
        let metrics = Arc::new(OperationMetrics::new().with_slow_threshold(config.slow_threshold()));
        let io = RetryableIo::new(
            config.retry_policy(),
            Arc::clone(&metrics),
            Arc::clone(mutex.loop_host()),
        );
        let file_lock = PlatformFileLock::for_target(&path, config.file_lock_options())?;
        let writer = Arc::new(AtomicWriter::new(
            &path,
            Arc::clone(&mutex),
            file_lock,
            io.clone(),
            config.write_options(),
        )?);

        debug!(
            path = %path.display(),
            backend = ?writer.file_lock().backend(),
            "Opened todo storage"
        );
        Ok(Self {
            path,
            config,
            mutex,
            writer,
            io,
            metrics,
            cache: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Open storage at the configured `db_path`
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        Self::open(config.storage.db_path.clone(), config.storage.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, Option<CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self) -> Option<CacheEntry> {
        if !self.config.cache {
            return None;
        }
        self.cache_lock().clone()
    }

    /// Load all todos from a blocking caller
    pub fn load(&self) -> Result<Vec<Todo>, StorageError> {
        self.ensure_open()?;
        if ExecutionContext::detect().is_async() {
            return Err(StorageError::WrongContext);
        }

        let cached = self.cached();
        let known = cached.as_ref().map(|entry| entry.stamp);
        let (path, limit) = (self.path.clone(), self.config.max_file_bytes);
        let outcome = self
            .io
            .run(OpType::Read, &self.path, move || read_file(&path, limit, known))?;
        self.finish_load(outcome, cached)
    }

    /// Load all todos from async code
    pub async fn load_async(&self) -> Result<Vec<Todo>, StorageError> {
        self.ensure_open()?;

        let cached = self.cached();
        let known = cached.as_ref().map(|entry| entry.stamp);
        let limit = self.config.max_file_bytes;
        let outcome = self
            .io
            .run_async(OpType::Read, &self.path, || read_file_async(&self.path, limit, known))
            .await?;
        self.finish_load(outcome, cached)
    }

    fn finish_load(&self, outcome: ReadOutcome, cached: Option<CacheEntry>) -> Result<Vec<Todo>, StorageError> {
        match outcome {
            ReadOutcome::Missing => {
                debug!(path = %self.path.display(), "Todo file not found; starting empty");
                self.invalidate_cache();
                Ok(Vec::new())
            }
            ReadOutcome::TooLarge(size) => Err(StorageError::TooLarge {
                path: self.path.clone(),
                size,
                limit: self.config.max_file_bytes,
            }),
            // Only reported when a stamp from `cached` was passed in
            ReadOutcome::Unchanged => Ok(cached.map(|entry| entry.todos.to_vec()).unwrap_or_default()),
            ReadOutcome::Data { bytes, stamp } => {
                let decoded = schema::decode(&bytes).map_err(|e| StorageError::Schema {
                    path: self.path.clone(),
                    message: e.to_string(),
                })?;
                if decoded.version < schema::SCHEMA_VERSION {
                    debug!(
                        path = %self.path.display(),
                        version = decoded.version,
                        "Read legacy todo layout; next save upgrades it"
                    );
                }
                if self.config.cache {
                    *self.cache_lock() = Some(CacheEntry {
                        stamp,
                        todos: Arc::new(decoded.todos.clone()),
                    });
                }
                Ok(decoded.todos)
            }
        }
    }

    fn encode(&self, todos: &[Todo]) -> Result<Vec<u8>, StorageError> {
        schema::encode(todos, self.config.json_format).map_err(|e| StorageError::Schema {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Replace the file contents with `todos` from a blocking caller
    pub fn save(&self, todos: &[Todo]) -> Result<(), StorageError> {
        self.ensure_open()?;
        let payload = self.encode(todos)?;
        let result = self.writer.save(&payload);
        self.invalidate_cache();
        let report = result?;
        debug!(todos = todos.len(), bytes = report.bytes, "Saved todos");
        Ok(())
    }

    /// Replace the file contents with `todos` from async code
    pub async fn save_async(&self, todos: &[Todo]) -> Result<(), StorageError> {
        self.ensure_open()?;
        let payload = self.encode(todos)?;
        let result = self.writer.save_async(payload).await;
        self.invalidate_cache();
        let report = result?;
        debug!(todos = todos.len(), bytes = report.bytes, "Saved todos");
        Ok(())
    }

    /// Smallest unused positive id
    pub fn next_id(&self, todos: &[Todo]) -> u64 {
        schema::next_id(todos)
    }

    pub fn invalidate_cache(&self) {
        self.cache_lock().take();
    }

    /// Check directory writability, the file lock and the current file
    ///
    /// Blocks for up to one second on the file lock.
    pub fn health_check(&self) -> HealthReport {
        let writable = check_writable(&self.path);

        let lock_timeout = self.config.lock_timeout().min(Duration::from_secs(1));
        let lock_ok = match self.writer.file_lock().acquire_with_timeout(lock_timeout) {
            Ok(guard) => guard.release().is_ok(),
            Err(e) => {
                debug!(error = %e, "Health check could not take the file lock");
                false
            }
        };

        let file_readable = match fs::read(&self.path) {
            Ok(bytes) => schema::decode(&bytes).is_ok(),
            Err(e) => e.kind() == io::ErrorKind::NotFound,
        };

        let report = HealthReport {
            writable,
            lock_ok,
            file_readable,
            healthy: writable && lock_ok && file_readable,
        };
        if report.healthy {
            debug!(?report, "Storage health check passed");
        } else {
            warn!(?report, "Storage health check failed");
        }
        report
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.mutex.stats()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// In-process lock, for timeout scopes and loop teardown
    pub fn lock(&self) -> &HybridMutex {
        &self.mutex
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop background helpers. Idempotent; also runs on drop.
    ///
    /// From a blocking caller this waits for the helper thread to exit.
    /// Inside an async task the wait runs on the runtime's blocking pool, so
    /// dropping a storage in a task does not stall the executor.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.config.metrics_log {
            self.metrics.log_summary();
        }
        self.mutex.close();
        self.invalidate_cache();
        info!(path = %self.path.display(), "Closed todo storage");
    }
}

impl Drop for TodoStorage {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_file(path: &Path, limit: u64, known: Option<FileStamp>) -> io::Result<ReadOutcome> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
        Err(e) => return Err(e),
    };
    let stamp = FileStamp::of(&file.metadata()?);
    if stamp.len > limit {
        return Ok(ReadOutcome::TooLarge(stamp.len));
    }
    if known == Some(stamp) {
        return Ok(ReadOutcome::Unchanged);
    }

    let mut bytes = Vec::with_capacity(stamp.len as usize);
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > limit {
        return Ok(ReadOutcome::TooLarge(bytes.len() as u64));
    }
    Ok(ReadOutcome::Data { bytes, stamp })
}

async fn read_file_async(path: &Path, limit: u64, known: Option<FileStamp>) -> io::Result<ReadOutcome> {
    use tokio::io::AsyncReadExt;

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
        Err(e) => return Err(e),
    };
    let stamp = FileStamp::of(&file.metadata().await?);
    if stamp.len > limit {
        return Ok(ReadOutcome::TooLarge(stamp.len));
    }
    if known == Some(stamp) {
        return Ok(ReadOutcome::Unchanged);
    }

    let mut bytes = Vec::with_capacity(stamp.len as usize);
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes).await?;
    if bytes.len() as u64 > limit {
        return Ok(ReadOutcome::TooLarge(bytes.len() as u64));
    }
    Ok(ReadOutcome::Data { bytes, stamp })
}

// Creates and removes a temp file in the target's directory, or in the
// nearest existing ancestor when the directory does not exist yet.
fn check_writable(target: &Path) -> bool {
    let mut dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    while !dir.exists() {
        match dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => dir = parent,
            _ => return false,
        }
    }

    let prefix = format!(
        "{}.health.",
        target.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .is_ok()
}
