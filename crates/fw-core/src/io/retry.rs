//! Bounded retry with deadline and jittered exponential backoff
//!
//! Only a whitelist of transient OS errors is retried. Anything else
//! (permission denied, invalid input, not found) is returned on the first
//! failure without consuming a retry. An overall deadline covers all
//! attempts and backoff sleeps; missing it yields [`StorageError::IoTimeout`],
//! never a plain I/O error.
//!
//! Both entry points always exist: [`RetryableIo::run`] for blocking work
//! (the deadline is enforced by the [`LoopHost`] helper thread) and
//! [`RetryableIo::run_async`] for futures. [`RetryableIo::run_inline`] is for
//! steps whose outcome must be known before the caller moves on, such as the
//! rename that publishes a save.

use crate::io::context::ExecutionContext;
use crate::io::error::StorageError;
use crate::io::loop_host::{HostOutcome, LoopHost};
use crate::io::metrics::{OpType, OperationMetrics};
use rand::Rng;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[cfg(unix)]
const TRANSIENT_OS_CODES: &[i32] = &[
    libc::EIO,
    libc::EAGAIN,
    libc::EBUSY,
    libc::EINTR,
    libc::ETIMEDOUT,
];

#[cfg(windows)]
const TRANSIENT_OS_CODES: &[i32] = &[
    windows_sys::Win32::Foundation::ERROR_SHARING_VIOLATION as i32,
    windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION as i32,
    windows_sys::Win32::Foundation::ERROR_IO_DEVICE as i32,
];

#[cfg(not(any(unix, windows)))]
const TRANSIENT_OS_CODES: &[i32] = &[];

/// Whether an I/O error is worth retrying
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    err.raw_os_error()
        .is_some_and(|code| TRANSIENT_OS_CODES.contains(&code))
}

/// Draw a delay uniformly from `[0, cap]`
pub fn jitter(cap: Duration) -> Duration {
    let cap_nanos = u64::try_from(cap.as_nanos()).unwrap_or(u64::MAX);
    if cap_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..=cap_nanos))
}

/// Upper bound of the `retry`-th backoff: `initial * 2^retry`, capped at `max`
pub fn backoff_cap(initial: Duration, max: Duration, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Retry parameters for one class of operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline covering every attempt and backoff sleep
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        jitter(backoff_cap(self.initial_backoff, self.max_backoff, retry))
    }
}

/// Retrying executor that records every operation into [`OperationMetrics`]
#[derive(Clone)]
pub struct RetryableIo {
    policy: RetryPolicy,
    metrics: Arc<OperationMetrics>,
    host: Arc<LoopHost>,
}

impl RetryableIo {
    pub fn new(policy: RetryPolicy, metrics: Arc<OperationMetrics>, host: Arc<LoopHost>) -> Self {
        Self {
            policy,
            metrics,
            host,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Same executor with a different policy
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            policy,
            metrics: Arc::clone(&self.metrics),
            host: Arc::clone(&self.host),
        }
    }

    pub fn metrics(&self) -> &Arc<OperationMetrics> {
        &self.metrics
    }

    /// Run a blocking operation under the retry policy
    ///
    /// The closure runs on the helper thread's blocking pool, so it must own
    /// what it touches. If the deadline passes mid-attempt, the attempt is
    /// abandoned and [`StorageError::IoTimeout`] is returned.
    pub fn run<T, F>(&self, op: OpType, path: &Path, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> io::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut retries = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out(op, path, started, retries));
            }

            let job = Arc::clone(&f);
            let err = match self.host.run_blocking(remaining, move || job())? {
                HostOutcome::TimedOut => return Err(self.timed_out(op, path, started, retries)),
                HostOutcome::Completed(Ok(value)) => {
                    self.metrics
                        .record(op, started.elapsed(), retries, true, None);
                    return Ok(value);
                }
                HostOutcome::Completed(Err(err)) => err,
            };

            if !self.should_retry(&err, retries) {
                return Err(self.failed(op, path, started, retries, err));
            }

            let delay = self.policy.backoff_delay(retries);
            let left = deadline.saturating_duration_since(Instant::now());
            warn!(
                op = op.as_str(),
                path = %path.display(),
                attempt = retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient I/O error, retrying"
            );
            if delay >= left {
                return Err(self.timed_out(op, path, started, retries));
            }
            std::thread::sleep(delay);
            retries += 1;
        }
    }

    /// Run a blocking operation on the calling thread under the retry policy
    ///
    /// An attempt is never abandoned: it runs to completion and its result
    /// is returned even past the deadline. The deadline only stops further
    /// retries, so `IoTimeout` here always means nothing was left running.
    pub fn run_inline<T, F>(&self, op: OpType, path: &Path, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> io::Result<T>,
    {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut retries = 0u32;

        loop {
            let err = match f() {
                Ok(value) => {
                    self.metrics
                        .record(op, started.elapsed(), retries, true, None);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.should_retry(&err, retries) {
                return Err(self.failed(op, path, started, retries, err));
            }

            let delay = self.policy.backoff_delay(retries);
            let left = deadline.saturating_duration_since(Instant::now());
            if delay >= left {
                return Err(self.timed_out(op, path, started, retries));
            }
            warn!(
                op = op.as_str(),
                path = %path.display(),
                attempt = retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient I/O error, retrying"
            );
            std::thread::sleep(delay);
            retries += 1;
        }
    }

    /// Run an async operation under the retry policy
    pub async fn run_async<T, F, Fut>(&self, op: OpType, path: &Path, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        if !ExecutionContext::detect().is_async() {
            return Err(StorageError::WrongContext);
        }

        let started = Instant::now();
        let mut retries = 0u32;
        let attempts = async {
            loop {
                match f().await {
                    Ok(value) => return Ok(value),
                    Err(err) if self.should_retry(&err, retries) => {
                        let delay = self.policy.backoff_delay(retries);
                        warn!(
                            op = op.as_str(),
                            path = %path.display(),
                            attempt = retries + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient I/O error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        retries += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        let outcome = tokio::time::timeout(self.policy.timeout, attempts).await;

        match outcome {
            Ok(Ok(value)) => {
                self.metrics
                    .record_async(op, started.elapsed(), retries, true, None)
                    .await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.metrics
                    .record_async(op, started.elapsed(), retries, false, err.raw_os_error())
                    .await;
                debug!(op = op.as_str(), path = %path.display(), error = %err, "I/O operation failed");
                Err(StorageError::io(path, err))
            }
            Err(_elapsed) => {
                self.metrics
                    .record_async(op, started.elapsed(), retries, false, None)
                    .await;
                Err(self.timeout_error(op, path))
            }
        }
    }

    fn should_retry(&self, err: &io::Error, retries: u32) -> bool {
        is_transient(err) && retries + 1 < self.policy.max_attempts
    }

    fn failed(&self, op: OpType, path: &Path, started: Instant, retries: u32, err: io::Error) -> StorageError {
        self.metrics
            .record(op, started.elapsed(), retries, false, err.raw_os_error());
        debug!(op = op.as_str(), path = %path.display(), retries, error = %err, "I/O operation failed");
        StorageError::io(path, err)
    }

    fn timed_out(&self, op: OpType, path: &Path, started: Instant, retries: u32) -> StorageError {
        self.metrics
            .record(op, started.elapsed(), retries, false, None);
        self.timeout_error(op, path)
    }

    fn timeout_error(&self, op: OpType, path: &Path) -> StorageError {
        warn!(
            op = op.as_str(),
            path = %path.display(),
            timeout_ms = self.policy.timeout.as_millis() as u64,
            "I/O operation exceeded its deadline"
        );
        StorageError::IoTimeout {
            op: op.as_str().to_string(),
            path: path.to_path_buf(),
            timeout: self.policy.timeout,
        }
    }
}
