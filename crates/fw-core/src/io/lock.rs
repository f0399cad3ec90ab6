//! Cross-process file locking with backoff retry
//!
//! The lock lives in a sibling `<target>.lock` file. The backend is fixed
//! when the lock is constructed:
//!
//! - POSIX: whole-file `flock`. The byte range is computed for interface
//!   uniformity but ignored by the OS.
//! - Windows: mandatory `LockFileEx` range lock. The range is derived from the
//!   live file size at lock time and always covers byte 0, so two processes
//!   that observe different sizes still overlap.
//! - Anything else fails with [`StorageError::PlatformUnsupported`] unless the
//!   caller opted into degraded (unlocked) mode.
//!
//! While held, the lock file carries a fixed-width owner record. Both native
//! backends release a lock when its process exits, so a lock that cannot be
//! taken always has a live holder; the lock file is never removed. A
//! contender that finds a dead or old owner record only reports it (the
//! record was left by a crashed holder and the live holder has not yet
//! overwritten it, or the holder is genuinely slow).

use crate::io::error::StorageError;
use crate::io::retry::{backoff_cap, jitter};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Suffix appended to the target file name to form the lock path
pub const LOCK_SUFFIX: &str = ".lock";

// Owner records are padded to this width so rewriting one never changes
// the file length seen by a Windows contender computing its range.
const OWNER_RECORD_WIDTH: usize = 128;
const MAX_HOST_LEN: usize = 48;

/// `<target>.lock`
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Byte range `(offset, length)` to lock for a file of `len` bytes
///
/// Never extends past the live size, except that an empty file locks byte 0.
pub fn lock_range(len: u64) -> (u64, u64) {
    (0, len.max(1))
}

/// OS locking mechanism in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    Flock,
    LockFileEx,
    /// No OS lock at all. Only reachable through an explicit opt-in.
    Degraded,
}

#[cfg(unix)]
const NATIVE_BACKEND: Option<LockBackend> = Some(LockBackend::Flock);
#[cfg(windows)]
const NATIVE_BACKEND: Option<LockBackend> = Some(LockBackend::LockFileEx);
#[cfg(not(any(unix, windows)))]
const NATIVE_BACKEND: Option<LockBackend> = None;

impl LockBackend {
    /// Backend for the current platform
    pub fn for_platform(allow_degraded: bool) -> Result<Self, StorageError> {
        match (NATIVE_BACKEND, allow_degraded) {
            (Some(backend), _) => Ok(backend),
            (None, true) => {
                warn!("No OS file locking on this platform; running with degraded locking");
                Ok(LockBackend::Degraded)
            }
            (None, false) => Err(StorageError::PlatformUnsupported {
                message: format!(
                    "no cross-process file lock is available on {}; set allow_degraded_locking = true to run without one (unsafe with multiple processes)",
                    std::env::consts::OS
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileLockOptions {
    pub timeout: Duration,
    /// Age after which a held lock is considered abandoned. Zero disables
    /// stale-lock breaking.
    pub stale_after: Duration,
    pub allow_degraded: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FileLockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(300),
            allow_degraded: false,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Holder identity written into the lock file while held
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub pid: u32,
    pub host: String,
    pub acquired_at_ms: u64,
}

impl OwnerRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: host_name(),
            acquired_at_ms: now_ms(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).unwrap_or_default();
        bytes.truncate(OWNER_RECORD_WIDTH - 1);
        bytes.resize(OWNER_RECORD_WIDTH - 1, b' ');
        bytes.push(b'\n');
        bytes
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?.trim();
        if text.is_empty() {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    fn is_holder_alive(&self) -> bool {
        // A holder on another host cannot be checked; assume it is alive.
        if self.host != host_name() {
            return true;
        }
        is_pid_alive(self.pid)
    }
}

fn host_name() -> String {
    let mut host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    if host.len() > MAX_HOST_LEN {
        let mut cut = MAX_HOST_LEN;
        while !host.is_char_boundary(cut) {
            cut -= 1;
        }
        host.truncate(cut);
    }
    host
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 checks for existence without delivering anything.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}

/// Cross-process lock on one resource
#[derive(Debug, Clone)]
pub struct PlatformFileLock {
    path: PathBuf,
    backend: LockBackend,
    options: FileLockOptions,
}

impl PlatformFileLock {
    /// Lock at an explicit lock-file path
    ///
    /// Fails with [`StorageError::PlatformUnsupported`] when the platform has
    /// no usable lock and degraded mode was not requested.
    pub fn new(path: impl Into<PathBuf>, options: FileLockOptions) -> Result<Self, StorageError> {
        let backend = LockBackend::for_platform(options.allow_degraded)?;
        Ok(Self {
            path: path.into(),
            backend,
            options,
        })
    }

    /// Lock guarding `target`, stored at `<target>.lock`
    pub fn for_target(target: &Path, options: FileLockOptions) -> Result<Self, StorageError> {
        Self::new(lock_path_for(target), options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> LockBackend {
        self.backend
    }

    pub fn options(&self) -> &FileLockOptions {
        &self.options
    }

    pub fn acquire(&self) -> Result<FileLockGuard, StorageError> {
        self.acquire_with_timeout(self.options.timeout)
    }

    /// Acquire the lock, retrying with jittered backoff until `timeout`
    pub fn acquire_with_timeout(&self, timeout: Duration) -> Result<FileLockGuard, StorageError> {
        if self.backend == LockBackend::Degraded {
            warn!(path = %self.path.display(), "Degraded locking: proceeding without a cross-process lock");
            return Ok(FileLockGuard::degraded(self.path.clone()));
        }

        let started = Instant::now();
        let mut retries = 0u32;
        let mut reported_stale = false;

        loop {
            if let Some(guard) = self.try_acquire()? {
                debug!(path = %self.path.display(), retries, "File lock acquired");
                return Ok(guard);
            }

            if !reported_stale {
                reported_stale = self.report_stale_owner();
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(
                    path = %self.path.display(),
                    retries,
                    waited_ms = waited.as_millis() as u64,
                    "Timed out waiting for file lock"
                );
                return Err(StorageError::LockTimeout {
                    resource: self.path.display().to_string(),
                    waited,
                    retries,
                });
            }

            let cap = backoff_cap(self.options.initial_backoff, self.options.max_backoff, retries);
            std::thread::sleep(jitter(cap).min(timeout - waited));
            retries += 1;
        }
    }

    /// Single non-blocking attempt
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>, StorageError> {
        if self.backend == LockBackend::Degraded {
            warn!(path = %self.path.display(), "Degraded locking: proceeding without a cross-process lock");
            return Ok(Some(FileLockGuard::degraded(self.path.clone())));
        }

        let file = self.open_lock_file()?;
        let range = match os::try_lock(&file) {
            Ok(Some(range)) => range,
            Ok(None) => return Ok(None),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };

        let mut guard = FileLockGuard {
            file: Some(file),
            path: self.path.clone(),
            range,
        };

        // The lock file may have been deleted or replaced by an outside tool
        // between our open and our lock; a lock on the orphaned inode
        // excludes nobody.
        if !guard.is_current() {
            debug!(path = %self.path.display(), "Lock file replaced while locking; retrying");
            drop(guard);
            return Ok(None);
        }

        if let Err(e) = guard.write_record(&OwnerRecord::current().encode()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write lock owner record");
        }
        Ok(Some(guard))
    }

    fn open_lock_file(&self) -> Result<File, StorageError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StorageError::io(&self.path, e))
    }

    /// Current owner record, if the lock file carries one
    pub fn owner(&self) -> Option<OwnerRecord> {
        let mut bytes = Vec::with_capacity(OWNER_RECORD_WIDTH);
        File::open(&self.path)
            .and_then(|f| f.take(OWNER_RECORD_WIDTH as u64 * 2).read_to_end(&mut bytes))
            .ok()?;
        OwnerRecord::decode(&bytes)
    }

    /// Why the recorded owner of a contended lock looks abandoned, if it does
    ///
    /// Diagnostic only. The OS lock is held by some live process, so the lock
    /// file is left alone.
    pub fn stale_reason(&self) -> Option<&'static str> {
        if self.options.stale_after.is_zero() {
            return None;
        }
        let owner = self.owner()?;
        if !owner.is_holder_alive() {
            return Some("recorded holder process is dead");
        }
        let age = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or_default();
        (age > self.options.stale_after).then_some("lock held longer than stale threshold")
    }

    fn report_stale_owner(&self) -> bool {
        let Some(reason) = self.stale_reason() else {
            return false;
        };
        let owner = self.owner();
        warn!(
            path = %self.path.display(),
            pid = owner.as_ref().map(|o| o.pid),
            host = owner.as_ref().map(|o| o.host.as_str()),
            reason,
            "File lock owner looks stale; waiting for the OS lock"
        );
        true
    }
}

/// Scoped hold on a [`PlatformFileLock`]; released on drop
#[derive(Debug)]
pub struct FileLockGuard {
    file: Option<File>,
    path: PathBuf,
    #[cfg_attr(not(windows), allow(dead_code))]
    range: (u64, u64),
}

impl FileLockGuard {
    fn degraded(path: PathBuf) -> Self {
        Self {
            file: None,
            path,
            range: (0, 0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this guard holds no OS lock
    pub fn is_degraded(&self) -> bool {
        self.file.is_none()
    }

    /// Byte range passed to the OS when locking
    pub fn range(&self) -> (u64, u64) {
        self.range
    }

    /// Release explicitly, surfacing unlock errors
    pub fn release(mut self) -> Result<(), StorageError> {
        let path = self.path.clone();
        self.unlock().map_err(|e| StorageError::io(path, e))
    }

    #[cfg(unix)]
    fn is_current(&self) -> bool {
        use std::os::unix::fs::MetadataExt;
        let Some(file) = &self.file else {
            return true;
        };
        match (file.metadata(), std::fs::metadata(&self.path)) {
            (Ok(held), Ok(on_disk)) => held.ino() == on_disk.ino() && held.dev() == on_disk.dev(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn is_current(&self) -> bool {
        self.file.is_none() || self.path.exists()
    }

    fn write_record(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(bytes)?;
            file.flush()?;
        }
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        // Best effort: a stale record only delays the next contender's check.
        let _ = self.write_record(&[b' '; OWNER_RECORD_WIDTH]);
        match self.file.take() {
            Some(file) => os::unlock(&file, self.range),
            None => Ok(()),
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
        }
    }
}

#[cfg(unix)]
mod os {
    use super::*;

    pub(super) fn try_lock(file: &File) -> io::Result<Option<(u64, u64)>> {
        let range = lock_range(file.metadata()?.len());
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(Some(range));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN || code == libc::EINTR => {
                Ok(None)
            }
            _ => Err(err),
        }
    }

    pub(super) fn unlock(file: &File, _range: (u64, u64)) -> io::Result<()> {
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx, UnlockFileEx,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    fn overlapped_at(offset: u64) -> OVERLAPPED {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        overlapped.Anonymous.Anonymous.Offset = offset as u32;
        overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        overlapped
    }

    pub(super) fn try_lock(file: &File) -> io::Result<Option<(u64, u64)>> {
        let (offset, length) = lock_range(file.metadata()?.len());
        let mut overlapped = overlapped_at(offset);
        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle() as HANDLE,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                length as u32,
                (length >> 32) as u32,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(Some((offset, length)));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(None)
        } else {
            Err(err)
        }
    }

    pub(super) fn unlock(file: &File, (offset, length): (u64, u64)) -> io::Result<()> {
        let mut overlapped = overlapped_at(offset);
        let ok = unsafe {
            UnlockFileEx(
                file.as_raw_handle() as HANDLE,
                0,
                length as u32,
                (length >> 32) as u32,
                &mut overlapped,
            )
        };
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use super::*;

    pub(super) fn try_lock(_file: &File) -> io::Result<Option<(u64, u64)>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no native file lock on this platform",
        ))
    }

    pub(super) fn unlock(_file: &File, _range: (u64, u64)) -> io::Result<()> {
        Ok(())
    }
}
