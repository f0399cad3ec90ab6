//! Background helper runtime for blocking callers
//!
//! Blocking callers cannot put a deadline on a filesystem syscall by
//! themselves. The host runs a current-thread tokio runtime on one dedicated
//! OS thread; a blocking caller hands it a job, the job runs on the runtime's
//! blocking pool under `tokio::time::timeout`, and the caller waits on a
//! channel. A job that misses its deadline is abandoned, not joined.
//!
//! The thread is started lazily on first use and is stopped by [`LoopHost::close`]
//! or on drop. Once closed, the host refuses new work with
//! [`StorageError::Closed`].
//!
//! Stopping waits up to [`SHUTDOWN_GRACE`] for abandoned jobs. Closed from an
//! async task, the host hands that wait to the caller's blocking pool and
//! returns at once, so the helper thread may outlive `close()` briefly.

use crate::io::context::ExecutionContext;
use crate::io::error::StorageError;
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Grace period for the blocking pool when the host shuts down
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a job run on the host
#[derive(Debug)]
pub enum HostOutcome<T> {
    Completed(T),
    TimedOut,
}

struct HostThread {
    handle: Handle,
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

enum HostState {
    Idle,
    Running(HostThread),
    Closed,
}

pub struct LoopHost {
    name: String,
    state: Mutex<HostState>,
}

impl LoopHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(HostState::Idle),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), HostState::Running(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), HostState::Closed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> Result<Handle, StorageError> {
        let mut state = self.lock();
        match &*state {
            HostState::Running(host) => return Ok(host.handle.clone()),
            HostState::Closed => return Err(StorageError::Closed),
            HostState::Idle => {}
        }

        let host = self.start()?;
        let handle = host.handle.clone();
        *state = HostState::Running(host);
        Ok(handle)
    }

    fn start(&self) -> Result<HostThread, StorageError> {
        let (handle_tx, handle_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .thread_name("fw-io-blocking")
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            })
            .map_err(|e| StorageError::io(&self.name, e))?;

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(StorageError::io(&self.name, e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(StorageError::Closed);
            }
        };

        debug!(host = %self.name, "Started storage helper thread");
        Ok(HostThread {
            handle,
            shutdown: shutdown_tx,
            thread,
        })
    }

    /// Run a blocking job with a deadline
    ///
    /// A panic inside the job is re-raised on the calling thread.
    pub fn run_blocking<T, F>(&self, timeout: Duration, job: F) -> Result<HostOutcome<T>, StorageError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.handle()?;
        let (tx, rx) = mpsc::sync_channel(1);

        handle.spawn(async move {
            let result = tokio::time::timeout(timeout, tokio::task::spawn_blocking(job)).await;
            let _ = tx.send(result);
        });

        match rx.recv() {
            Ok(Ok(Ok(value))) => Ok(HostOutcome::Completed(value)),
            Ok(Ok(Err(join_err))) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                Err(StorageError::Closed)
            }
            Ok(Err(_elapsed)) => Ok(HostOutcome::TimedOut),
            // Sender dropped without a result: the runtime shut down mid-job.
            Err(_) => Err(StorageError::Closed),
        }
    }

    /// Stop the helper thread. Idempotent.
    ///
    /// Blocking callers wait for the thread to exit. Inside an async task the
    /// join moves to the current runtime's blocking pool instead.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock(), HostState::Closed);
        let HostState::Running(host) = previous else {
            return;
        };
        let _ = host.shutdown.send(());

        let name = self.name.clone();
        if ExecutionContext::detect().is_async()
            && let Ok(runtime) = Handle::try_current()
        {
            debug!(host = %name, "Joining storage helper thread off the executor");
            drop(runtime.spawn_blocking(move || join_host(&name, host.thread)));
        } else {
            join_host(&name, host.thread);
        }
    }
}

fn join_host(name: &str, thread: JoinHandle<()>) {
    if thread.join().is_err() {
        warn!(host = %name, "Storage helper thread panicked during shutdown");
    } else {
        debug!(host = %name, "Stopped storage helper thread");
    }
}

impl Drop for LoopHost {
    fn drop(&mut self) {
        self.close();
    }
}
