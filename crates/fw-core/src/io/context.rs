//! Execution context detection for the hybrid lock
//!
//! The context is resolved once, at the public entry point, and then passed
//! down explicitly. Nothing below the entry point looks for a runtime again.
//!
//! tokio enters its runtime context on blocking-pool threads too, and offers
//! no public way to tell them apart from executor threads. Code running on
//! the blocking pool marks itself with a [`BlockingSection`]; [`spawn_blocking`]
//! does that for the closure it runs.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::thread::ThreadId;
use tokio::task::JoinHandle;

thread_local! {
    static BLOCKING_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as free to block while alive
///
/// Only for threads that are not driving a runtime, such as the closure of
/// `tokio::task::spawn_blocking`. Entering a section on an executor thread
/// lets blocking calls park that executor.
#[must_use = "the section ends as soon as it is dropped"]
pub struct BlockingSection {
    // Tied to the thread whose counter it bumped
    _not_send: PhantomData<*const ()>,
}

impl BlockingSection {
    pub fn enter() -> Self {
        BLOCKING_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _not_send: PhantomData }
    }

    pub fn is_active() -> bool {
        BLOCKING_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for BlockingSection {
    fn drop(&mut self) {
        BLOCKING_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl fmt::Debug for BlockingSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockingSection")
    }
}

/// `tokio::task::spawn_blocking` with the closure run in a [`BlockingSection`],
/// so the blocking storage entry points accept it
pub fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let _section = BlockingSection::enter();
        f()
    })
}

/// Identity of the event loop driving the current task.
///
/// A tokio runtime has no stable public identifier, so a loop is identified
/// by the OS thread polling the task. A current-thread runtime is pinned to
/// the thread that entered it; each worker of a multi-thread runtime gets its
/// own slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(ThreadId);

impl LoopId {
    /// Loop identity of the calling thread
    pub fn current() -> Self {
        LoopId(std::thread::current().id())
    }
}

impl fmt::Debug for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopId({:?})", self.0)
    }
}

/// Where a lock or I/O entry point was called from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Plain OS thread, or a blocking section on the runtime's blocking pool
    Sync,
    /// Inside a tokio runtime on the given loop
    Async(LoopId),
}

impl ExecutionContext {
    pub fn detect() -> Self {
        if BlockingSection::is_active() {
            return ExecutionContext::Sync;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(_) => ExecutionContext::Async(LoopId::current()),
            Err(_) => ExecutionContext::Sync,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, ExecutionContext::Async(_))
    }

    pub fn loop_id(&self) -> Option<LoopId> {
        match self {
            ExecutionContext::Async(id) => Some(*id),
            ExecutionContext::Sync => None,
        }
    }
}
