//! In-process lock shared by blocking threads and async tasks
//!
//! There is exactly one exclusion primitive: a `held` flag behind a std
//! mutex. Blocking callers wait on a condvar; async callers try the same
//! flag without blocking and, on failure, await a per-loop [`Notify`] (or a
//! backoff timer, whichever fires first). Release clears the flag, wakes the
//! condvar and every registered loop, all from synchronous code, so a guard
//! can be dropped anywhere.
//!
//! The blocking entry point refuses to run inside a tokio runtime and returns
//! [`StorageError::WrongContext`] instead of parking an executor thread.

use crate::io::context::{ExecutionContext, LoopId};
use crate::io::error::StorageError;
use crate::io::loop_host::LoopHost;
use crate::io::loop_registry::{DEFAULT_LOOP_CAPACITY, LoopRegistry};
use crate::io::retry::{backoff_cap, jitter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Contention parameters for [`HybridMutex`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Backoff waits that may expire before giving up. Wake-ups caused by a
    /// release do not count.
    pub max_retries: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(100),
            max_retries: 100,
        }
    }
}

/// Who currently holds the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderKind {
    Sync,
    Async(LoopId),
}

/// Contention counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    pub acquisitions: u64,
    /// Acquisitions that had to wait
    pub total_waits: u64,
    pub total_wait_time: Duration,
    pub max_wait: Duration,
    pub timeouts: u64,
}

#[derive(Default)]
struct LockState {
    holder: Option<HolderKind>,
}

#[derive(Default)]
struct TimeoutStack {
    next_token: u64,
    entries: Vec<(u64, Duration)>,
}

struct Shared {
    name: String,
    policy: LockPolicy,
    state: Mutex<LockState>,
    released: Condvar,
    wakers: LoopRegistry<Notify>,
    timeouts: Mutex<TimeoutStack>,
    stats: Mutex<LockStats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn effective_timeout(&self) -> Duration {
        lock(&self.timeouts)
            .entries
            .last()
            .map(|(_, t)| *t)
            .unwrap_or(self.policy.timeout)
    }

    // Flag-setting and guard construction happen together under the state
    // mutex; there is no fallible step in between.
    fn take(self: &Arc<Self>, state: &mut LockState, kind: HolderKind) -> HybridGuard {
        state.holder = Some(kind);
        HybridGuard {
            shared: Some(Arc::clone(self)),
            kind,
        }
    }

    fn record_acquired(&self, waited: Option<Duration>) {
        let mut stats = lock(&self.stats);
        stats.acquisitions += 1;
        if let Some(waited) = waited {
            stats.total_waits += 1;
            stats.total_wait_time += waited;
            stats.max_wait = stats.max_wait.max(waited);
        }
    }

    fn timed_out(&self, waited: Duration, retries: u32) -> StorageError {
        lock(&self.stats).timeouts += 1;
        warn!(
            lock = %self.name,
            retries,
            waited_ms = waited.as_millis() as u64,
            "Timed out waiting for storage lock"
        );
        StorageError::LockTimeout {
            resource: self.name.clone(),
            waited,
            retries,
        }
    }

    fn release(&self) {
        lock(&self.state).holder = None;
        self.released.notify_all();
        self.wakers.for_each(|notify| notify.notify_waiters());
    }
}

/// Mutual exclusion usable from both threads and async tasks
pub struct HybridMutex {
    shared: Arc<Shared>,
    host: Arc<LoopHost>,
}

impl HybridMutex {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_policy(name, LockPolicy::default())
    }

    pub fn with_policy(name: impl Into<String>, policy: LockPolicy) -> Self {
        let name = name.into();
        let host = Arc::new(LoopHost::new(format!("fw-io-{name}")));
        Self {
            shared: Arc::new(Shared {
                name,
                policy,
                state: Mutex::new(LockState::default()),
                released: Condvar::new(),
                wakers: LoopRegistry::with_capacity(DEFAULT_LOOP_CAPACITY),
                timeouts: Mutex::new(TimeoutStack::default()),
                stats: Mutex::new(LockStats::default()),
            }),
            host,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.shared.policy
    }

    /// Helper thread used for deadline-bounded blocking I/O. Stopped by
    /// [`HybridMutex::close`].
    pub fn loop_host(&self) -> &Arc<LoopHost> {
        &self.host
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.shared.state).holder.is_some()
    }

    pub fn holder(&self) -> Option<HolderKind> {
        lock(&self.shared.state).holder
    }

    /// Acquisition timeout currently in effect
    pub fn timeout(&self) -> Duration {
        self.shared.effective_timeout()
    }

    pub fn stats(&self) -> LockStats {
        *lock(&self.shared.stats)
    }

    /// Blocking acquire. Fails with [`StorageError::WrongContext`] inside a
    /// tokio runtime.
    pub fn enter_sync(&self) -> Result<HybridGuard, StorageError> {
        if ExecutionContext::detect().is_async() {
            return Err(StorageError::WrongContext);
        }

        let shared = &self.shared;
        let policy = shared.policy;
        let timeout = shared.effective_timeout();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut retries = 0u32;
        let mut contended = false;

        let mut state = lock(&shared.state);
        loop {
            if state.holder.is_none() {
                let guard = shared.take(&mut state, HolderKind::Sync);
                drop(state);
                shared.record_acquired(contended.then(|| started.elapsed()));
                trace!(lock = %shared.name, retries, "Acquired storage lock (sync)");
                return Ok(guard);
            }

            contended = true;
            let now = Instant::now();
            if now >= deadline || retries >= policy.max_retries {
                drop(state);
                return Err(shared.timed_out(started.elapsed(), retries));
            }

            let delay = jitter(backoff_cap(policy.initial_backoff, policy.max_backoff, retries))
                .min(deadline - now);
            let (next, wait) = shared
                .released
                .wait_timeout(state, delay)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            if wait.timed_out() {
                retries += 1;
            }
        }
    }

    /// Awaitable acquire; never blocks the executor thread
    pub async fn enter_async(&self) -> Result<HybridGuard, StorageError> {
        let Some(loop_id) = ExecutionContext::detect().loop_id() else {
            return Err(StorageError::WrongContext);
        };

        let shared = &self.shared;
        let policy = shared.policy;
        let timeout = shared.effective_timeout();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut retries = 0u32;
        let mut contended = false;
        let waker = shared.wakers.get_or_create(loop_id);

        loop {
            // Register interest before checking so a release in between is
            // not missed.
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&shared.state);
                if state.holder.is_none() {
                    let guard = shared.take(&mut state, HolderKind::Async(loop_id));
                    drop(state);
                    shared.record_acquired(contended.then(|| started.elapsed()));
                    trace!(lock = %shared.name, retries, "Acquired storage lock (async)");
                    return Ok(guard);
                }
            }

            contended = true;
            let now = Instant::now();
            if now >= deadline || retries >= policy.max_retries {
                return Err(shared.timed_out(started.elapsed(), retries));
            }

            let delay = jitter(backoff_cap(policy.initial_backoff, policy.max_backoff, retries))
                .min(deadline - now);
            if tokio::time::timeout(delay, notified).await.is_err() {
                retries += 1;
            }
        }
    }

    /// Non-blocking attempt, valid from any context
    pub fn try_enter(&self) -> Option<HybridGuard> {
        let kind = match ExecutionContext::detect() {
            ExecutionContext::Sync => HolderKind::Sync,
            ExecutionContext::Async(loop_id) => HolderKind::Async(loop_id),
        };
        let mut state = lock(&self.shared.state);
        if state.holder.is_some() {
            return None;
        }
        let guard = self.shared.take(&mut state, kind);
        drop(state);
        self.shared.record_acquired(None);
        Some(guard)
    }

    /// Override the acquisition timeout until the returned scope is dropped
    ///
    /// Scopes nest; dropping one restores whatever was in effect before it,
    /// even when scopes are dropped out of order.
    pub fn timeout_scope(&self, timeout: Duration) -> TimeoutScope {
        let mut stack = lock(&self.shared.timeouts);
        stack.next_token += 1;
        let token = stack.next_token;
        stack.entries.push((token, timeout));
        TimeoutScope {
            shared: Arc::clone(&self.shared),
            token,
        }
    }

    pub fn with_timeout<R>(&self, timeout: Duration, f: impl FnOnce() -> R) -> R {
        let _scope = self.timeout_scope(timeout);
        f()
    }

    pub async fn with_timeout_async<F: Future>(&self, timeout: Duration, fut: F) -> F::Output {
        let _scope = self.timeout_scope(timeout);
        fut.await
    }

    /// Drop the wake-up slot of a loop that is being torn down
    pub fn release_loop(&self, loop_id: LoopId) -> bool {
        self.shared.wakers.evict(loop_id)
    }

    /// [`HybridMutex::release_loop`] for the calling thread's loop
    pub fn forget_current_loop(&self) -> bool {
        self.release_loop(LoopId::current())
    }

    /// Number of loops with a live wake-up slot
    pub fn tracked_loops(&self) -> usize {
        self.shared.wakers.len()
    }

    /// Stop the helper thread and drop all loop slots. Idempotent.
    pub fn close(&self) {
        self.host.close();
        self.shared.wakers.clear();
        debug!(lock = %self.shared.name, "Closed storage lock");
    }
}

impl Drop for HybridMutex {
    fn drop(&mut self) {
        self.close();
    }
}

/// Held [`HybridMutex`]; released on drop, including during unwinding
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HybridGuard {
    shared: Option<Arc<Shared>>,
    kind: HolderKind,
}

impl HybridGuard {
    pub fn kind(&self) -> HolderKind {
        self.kind
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl Drop for HybridGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for HybridGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridGuard")
            .field("lock", &self.shared.as_ref().map(|shared| shared.name.as_str()))
            .field("kind", &self.kind)
            .finish()
    }
}

/// Active timeout override; see [`HybridMutex::timeout_scope`]
#[must_use = "the override ends as soon as the scope is dropped"]
pub struct TimeoutScope {
    shared: Arc<Shared>,
    token: u64,
}

impl Drop for TimeoutScope {
    fn drop(&mut self) {
        let mut stack = lock(&self.shared.timeouts);
        if let Some(pos) = stack.entries.iter().rposition(|(t, _)| *t == self.token) {
            stack.entries.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::error::ErrorKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn fast_policy() -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_micros(200),
            max_backoff: Duration::from_millis(5),
            max_retries: 10_000,
        }
    }

    // Increment through a non-atomic read-modify-write so any overlap
    // between holders shows up as a lost update.
    fn critical_section(counter: &AtomicUsize, inside: &AtomicBool) {
        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
        let value = counter.load(Ordering::SeqCst);
        thread::yield_now();
        counter.store(value + 1, Ordering::SeqCst);
        inside.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_sync_threads_are_exclusive() {
        let mutex = Arc::new(HybridMutex::with_policy("test", fast_policy()));
        let counter = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (mutex, counter, inside) = (Arc::clone(&mutex), Arc::clone(&counter), Arc::clone(&inside));
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = mutex.enter_sync().unwrap();
                        critical_section(&counter, &inside);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 400);
        assert_eq!(mutex.stats().acquisitions, 400);
    }

    #[test]
    fn test_sync_and_async_share_one_lock() {
        let mutex = Arc::new(HybridMutex::with_policy("test", fast_policy()));
        let counter = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (mutex, counter, inside) = (Arc::clone(&mutex), Arc::clone(&counter), Arc::clone(&inside));
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let _guard = mutex.enter_sync().unwrap();
                    critical_section(&counter, &inside);
                }
            }));
        }
        {
            let (mutex, counter, inside) = (Arc::clone(&mutex), Arc::clone(&counter), Arc::clone(&inside));
            handles.push(thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async move {
                    let tasks: Vec<_> = (0..100)
                        .map(|_| {
                            let (mutex, counter, inside) =
                                (Arc::clone(&mutex), Arc::clone(&counter), Arc::clone(&inside));
                            tokio::spawn(async move {
                                let guard = mutex.enter_async().await.unwrap();
                                critical_section(&counter, &inside);
                                tokio::task::yield_now().await;
                                drop(guard);
                            })
                        })
                        .collect();
                    for task in tasks {
                        task.await.unwrap();
                    }
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_guard_debug_names_lock_and_holder() {
        let mutex = HybridMutex::new("debugged");
        let guard = mutex.enter_sync().unwrap();
        let rendered = format!("{guard:?}");
        assert!(rendered.contains("debugged"));
        assert!(rendered.contains("Sync"));
    }

    #[tokio::test]
    async fn test_sync_entry_inside_runtime_is_wrong_context() {
        let mutex = HybridMutex::new("test");
        let err = mutex.enter_sync().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongContext);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_async_entry_outside_runtime_is_wrong_context() {
        let mutex = HybridMutex::new("test");
        let fut = mutex.enter_async();
        // Poll once without a runtime
        let waker = std::task::Waker::noop();
        let mut cx = std::task::Context::from_waker(waker);
        let mut fut = std::pin::pin!(fut);
        match fut.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(Err(e)) => assert_eq!(e.kind(), ErrorKind::WrongContext),
            _ => panic!("expected WrongContext"),
        }
    }

    #[test]
    fn test_timeout_leaves_nothing_held() {
        let mutex = Arc::new(HybridMutex::with_policy("test", fast_policy()));
        let held = mutex.enter_sync().unwrap();

        let contender = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.with_timeout(Duration::from_millis(50), || mutex.enter_sync().map(|_| ())))
        };
        let err = contender.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(err.to_string().contains("no lock is held"));

        assert_eq!(mutex.holder(), Some(HolderKind::Sync));
        drop(held);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.stats().timeouts, 1);
    }

    #[test]
    fn test_max_retries_bounds_waiting() {
        let policy = LockPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..fast_policy()
        };
        let mutex = Arc::new(HybridMutex::with_policy("test", policy));
        let _held = mutex.enter_sync().unwrap();

        let contender = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let started = Instant::now();
                let result = mutex.enter_sync().map(|_| ());
                (result, started.elapsed())
            })
        };
        let (result, elapsed) = contender.join().unwrap();
        assert!(matches!(result, Err(StorageError::LockTimeout { retries: 3, .. })));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_release_on_panic() {
        let mutex = Arc::new(HybridMutex::new("test"));
        let worker = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let _guard = mutex.enter_sync().unwrap();
                panic!("protected block failed");
            })
        };
        assert!(worker.join().is_err());
        assert!(!mutex.is_locked());
        assert!(mutex.try_enter().is_some());
    }

    #[test]
    fn test_timeout_scopes_nest_and_restore() {
        let mutex = HybridMutex::new("test");
        let base = mutex.timeout();

        mutex.with_timeout(Duration::from_secs(1), || {
            assert_eq!(mutex.timeout(), Duration::from_secs(1));
            mutex.with_timeout(Duration::from_millis(5), || {
                assert_eq!(mutex.timeout(), Duration::from_millis(5));
            });
            assert_eq!(mutex.timeout(), Duration::from_secs(1));
        });
        assert_eq!(mutex.timeout(), base);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            mutex.with_timeout(Duration::from_secs(2), || panic!("inside scope"))
        }));
        assert!(result.is_err());
        assert_eq!(mutex.timeout(), base);
    }

    #[test]
    fn test_out_of_order_scope_drop() {
        let mutex = HybridMutex::new("test");
        let outer = mutex.timeout_scope(Duration::from_secs(1));
        let inner = mutex.timeout_scope(Duration::from_secs(2));
        drop(outer);
        assert_eq!(mutex.timeout(), Duration::from_secs(2));
        drop(inner);
        assert_eq!(mutex.timeout(), LockPolicy::default().timeout);
    }

    #[test]
    fn test_try_enter_and_stats() {
        let mutex = HybridMutex::new("test");
        let guard = mutex.try_enter().unwrap();
        assert!(mutex.try_enter().is_none());
        guard.release();
        assert!(mutex.try_enter().is_some());
        assert_eq!(mutex.stats().acquisitions, 2);
        assert_eq!(mutex.stats().total_waits, 0);
    }

    #[test]
    fn test_short_lived_loops_do_not_leak_slots() {
        let mutex = Arc::new(HybridMutex::new("test"));
        for _ in 0..(DEFAULT_LOOP_CAPACITY * 3) {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let _guard = mutex.enter_async().await.unwrap();
                });
            })
            .join()
            .unwrap();
        }
        assert!(mutex.tracked_loops() <= DEFAULT_LOOP_CAPACITY);
    }

    #[test]
    fn test_explicit_loop_release() {
        let mutex = Arc::new(HybridMutex::new("test"));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let _guard = mutex.enter_async().await.unwrap();
        });
        assert_eq!(mutex.tracked_loops(), 1);
        assert!(mutex.forget_current_loop());
        assert_eq!(mutex.tracked_loops(), 0);
    }

    #[test]
    fn test_close_stops_helper_thread() {
        let mutex = HybridMutex::new("test");
        mutex
            .loop_host()
            .run_blocking(Duration::from_secs(1), || ())
            .unwrap();
        assert!(mutex.loop_host().is_running());
        mutex.close();
        assert!(mutex.loop_host().is_closed());
        mutex.close();
    }
}
