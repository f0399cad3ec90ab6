//! Crash-safe replacement of the storage file
//!
//! One save walks `Init → DirEnsured → (BackedUp) → TempWritten → Fsynced →
//! PermissionsSet → Renamed`. Any failure before the rename drops the
//! temp file's [`TempPath`], which unlinks it, so the target is always
//! either the previous complete content or the new complete content.
//!
//! A save holds the [`HybridMutex`] (in-process) and then the
//! [`PlatformFileLock`] (cross-process) for its whole duration. Every
//! filesystem step goes through [`RetryableIo`]; the rename runs inline on
//! the saving thread, so it has finished before either lock is released.

use crate::io::context::spawn_blocking;
use crate::io::error::StorageError;
use crate::io::hybrid::HybridMutex;
use crate::io::lock::PlatformFileLock;
use crate::io::metrics::OpType;
use crate::io::retry::RetryableIo;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempPath;
use tracing::{debug, trace, warn};

/// Step reached by a save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStage {
    Init,
    DirEnsured,
    BackedUp,
    TempWritten,
    Fsynced,
    PermissionsSet,
    Renamed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub backup: bool,
    /// Backup generations kept: `.bak`, `.bak.1`, … `.bak.{N-1}`
    pub backup_count: u32,
    /// Leftover temp files older than this are removed before writing.
    /// Zero disables the sweep.
    pub stale_tmp_after: Duration,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            backup: false,
            backup_count: 1,
            stale_tmp_after: Duration::from_secs(300),
        }
    }
}

/// What a successful save did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub bytes: usize,
    pub backed_up: bool,
    pub stages: Vec<WriteStage>,
    pub duration: Duration,
}

/// `<name>.bak` for generation 0, `<name>.bak.{n}` after that
pub fn backup_path(target: &Path, generation: u32) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    if generation == 0 {
        name.push(".bak");
    } else {
        name.push(format!(".bak.{generation}"));
    }
    PathBuf::from(name)
}

pub struct AtomicWriter {
    target: PathBuf,
    dir: PathBuf,
    name: String,
    mutex: Arc<HybridMutex>,
    file_lock: PlatformFileLock,
    io: RetryableIo,
    options: WriteOptions,
    #[cfg(test)]
    fail_at: std::sync::Mutex<Option<WriteStage>>,
    #[cfg(test)]
    rename_delay: std::sync::Mutex<Duration>,
}

impl AtomicWriter {
    pub fn new(
        target: impl Into<PathBuf>,
        mutex: Arc<HybridMutex>,
        file_lock: PlatformFileLock,
        io: RetryableIo,
        options: WriteOptions,
    ) -> Result<Self, StorageError> {
        let target = target.into();
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidPath {
                path: target.clone(),
                message: "path has no file name".to_string(),
            })?;
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();

        Ok(Self {
            target,
            dir,
            name,
            mutex,
            file_lock,
            io,
            options,
            #[cfg(test)]
            fail_at: std::sync::Mutex::new(None),
            #[cfg(test)]
            rename_delay: std::sync::Mutex::new(Duration::ZERO),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    pub fn file_lock(&self) -> &PlatformFileLock {
        &self.file_lock
    }

    /// Persist `payload` from a blocking caller
    pub fn save(&self, payload: &[u8]) -> Result<WriteReport, StorageError> {
        let _guard = self.mutex.enter_sync()?;
        let _file_guard = self.file_lock.acquire()?;
        self.commit(Arc::from(payload))
    }

    /// Persist `payload` from async code
    ///
    /// The in-process lock is awaited; the file lock and the write run on
    /// the blocking pool. A cancelled caller does not cancel a save that has
    /// already started.
    pub async fn save_async(self: &Arc<Self>, payload: Vec<u8>) -> Result<WriteReport, StorageError> {
        let guard = self.mutex.enter_async().await?;
        let writer = Arc::clone(self);
        let job = spawn_blocking(move || {
            let _guard = guard;
            let _file_guard = writer.file_lock.acquire()?;
            writer.commit(Arc::from(payload))
        });

        match job.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(StorageError::Closed),
        }
    }

    // Caller holds both locks.
    fn commit(&self, payload: Arc<[u8]>) -> Result<WriteReport, StorageError> {
        let started = Instant::now();
        let mut stages = vec![WriteStage::Init];

        match self.commit_stages(&payload, &mut stages) {
            Ok(backed_up) => {
                let report = WriteReport {
                    bytes: payload.len(),
                    backed_up,
                    stages,
                    duration: started.elapsed(),
                };
                debug!(
                    path = %self.target.display(),
                    bytes = report.bytes,
                    backed_up,
                    duration_ms = report.duration.as_millis() as u64,
                    "Saved storage file"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(
                    path = %self.target.display(),
                    stage = ?stages.last(),
                    error = %e,
                    "Save failed; temp file rolled back"
                );
                Err(e)
            }
        }
    }

    fn commit_stages(&self, payload: &Arc<[u8]>, stages: &mut Vec<WriteStage>) -> Result<bool, StorageError> {
        let dir = self.dir.clone();
        self.io
            .run(OpType::CreateDir, &self.dir, move || fs::create_dir_all(&dir))?;
        self.advance(stages, WriteStage::DirEnsured)?;

        self.sweep_stale_temps();

        let backed_up = self.options.backup && self.backup();
        if backed_up {
            self.advance(stages, WriteStage::BackedUp)?;
        }

        let (file, temp_path) = self.create_temp()?;
        // From here on, returning early drops `temp_path`, which unlinks it.
        let file = Arc::new(file);

        let (writer, bytes) = (Arc::clone(&file), Arc::clone(payload));
        self.io.run(OpType::Write, &temp_path, move || {
            let mut f = &*writer;
            f.seek(SeekFrom::Start(0))?;
            f.set_len(0)?;
            f.write_all(&bytes)?;
            f.flush()
        })?;
        self.advance(stages, WriteStage::TempWritten)?;

        let syncer = Arc::clone(&file);
        self.io
            .run(OpType::Fsync, &temp_path, move || syncer.sync_all())?;
        self.advance(stages, WriteStage::Fsynced)?;
        drop(file);

        let path = temp_path.to_path_buf();
        self.io
            .run(OpType::SetPermissions, &temp_path, move || restrict_permissions(&path))?;
        self.advance(stages, WriteStage::PermissionsSet)?;

        // Inline: a rename left running past a timeout could land after the
        // locks are released.
        self.io.run_inline(OpType::Rename, &self.target, || {
            #[cfg(test)]
            std::thread::sleep(*self.rename_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
            fs::rename(&temp_path, &self.target)
        })?;
        // Renamed away; nothing left to clean up.
        let _ = temp_path.keep();
        stages.push(WriteStage::Renamed);

        self.sync_dir();
        Ok(backed_up)
    }

    fn advance(&self, stages: &mut Vec<WriteStage>, stage: WriteStage) -> Result<(), StorageError> {
        trace!(path = %self.target.display(), ?stage, "Save advanced");
        #[cfg(test)]
        if *self.fail_at.lock().unwrap_or_else(std::sync::PoisonError::into_inner) == Some(stage) {
            stages.push(WriteStage::RolledBack);
            return Err(StorageError::io(
                &self.target,
                io::Error::other(format!("injected failure at {stage:?}")),
            ));
        }
        stages.push(stage);
        Ok(())
    }

    fn create_temp(&self) -> Result<(File, TempPath), StorageError> {
        let (dir, prefix) = (self.dir.clone(), format!("{}.", self.name));
        let temp = self.io.run(OpType::Write, &self.dir, move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".tmp")
                .tempfile_in(&dir)
        })?;
        Ok(temp.into_parts())
    }

    // Rotates `.bak` generations and copies the current target into `.bak`.
    // Failures are logged; the save goes on without a backup.
    fn backup(&self) -> bool {
        let (target, dir, name) = (self.target.clone(), self.dir.clone(), self.name.clone());
        let generations = self.options.backup_count.max(1);
        let result = self.io.run(OpType::Backup, &self.target, move || {
            rotate_and_copy(&target, &dir, &name, generations)
        });

        match result {
            Ok(copied) => copied,
            Err(e) => {
                warn!(path = %self.target.display(), error = %e, "Backup failed; continuing without it");
                false
            }
        }
    }

    fn sweep_stale_temps(&self) {
        let max_age = self.options.stale_tmp_after;
        if max_age.is_zero() {
            return;
        }
        let (dir, prefix) = (self.dir.clone(), format!("{}.", self.name));
        let result = self.io.run(OpType::Cleanup, &self.dir, move || {
            remove_stale_temps(&dir, &prefix, max_age)
        });
        match result {
            Ok(0) => {}
            Ok(removed) => debug!(dir = %self.dir.display(), removed, "Removed stale temp files"),
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Stale temp sweep failed"),
        }
    }

    #[cfg(unix)]
    fn sync_dir(&self) {
        let dir = self.dir.clone();
        let result = self
            .io
            .run(OpType::Fsync, &self.dir, move || File::open(&dir)?.sync_all());
        if let Err(e) = result {
            warn!(dir = %self.dir.display(), error = %e, "Directory fsync failed");
        }
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) {}

    #[cfg(test)]
    fn inject_failure(&self, stage: Option<WriteStage>) {
        *self.fail_at.lock().unwrap() = stage;
    }

    #[cfg(test)]
    fn slow_down_rename(&self, delay: Duration) {
        *self.rename_delay.lock().unwrap() = delay;
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

// Owner-only ACLs are out of scope on Windows; new files already inherit
// the directory's ACL.
#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn rotate_and_copy(target: &Path, dir: &Path, name: &str, generations: u32) -> io::Result<bool> {
    let current = match fs::read(target) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    for generation in (1..generations).rev() {
        match fs::rename(backup_path(target, generation - 1), backup_path(target, generation)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    let mut temp = tempfile::Builder::new()
        .prefix(&format!("{name}.bak."))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(&current)?;
    temp.as_file().sync_all()?;
    restrict_permissions(temp.path())?;
    temp.persist(backup_path(target, 0)).map_err(|e| e.error)?;
    Ok(true)
}

fn remove_stale_temps(dir: &Path, prefix: &str, max_age: Duration) -> io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !(file_name.starts_with(prefix) && file_name.ends_with(".tmp")) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .unwrap_or_default();
        if meta.is_file() && age > max_age {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(removed)
}
