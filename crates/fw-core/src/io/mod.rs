//! Storage durability and concurrency core
//!
//! Everything that touches the todo file on disk goes through this module:
//!
//! - **HybridMutex**: one in-process lock for threads and async tasks alike
//! - **PlatformFileLock**: cross-process `flock` / `LockFileEx` lock with stale-lock recovery
//! - **AtomicWriter**: temp file, fsync, owner-only permissions, rename, optional backups
//! - **RetryableIo**: bounded retries of transient errors under a deadline
//! - **OperationMetrics**: fixed-capacity ring buffer of I/O attempts
//!
//! # Example
//!
//! ```rust,no_run
//! use flywheel_core::io::{
//!     AtomicWriter, FileLockOptions, HybridMutex, OperationMetrics, PlatformFileLock,
//!     RetryPolicy, RetryableIo, WriteOptions,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let target = Path::new("/home/user/.todo.json");
//! let mutex = Arc::new(HybridMutex::new("todo.json"));
//! let io = RetryableIo::new(
//!     RetryPolicy::default(),
//!     Arc::new(OperationMetrics::new()),
//!     Arc::clone(mutex.loop_host()),
//! );
//! let lock = PlatformFileLock::for_target(target, FileLockOptions::default()).unwrap();
//! let writer = AtomicWriter::new(target, mutex, lock, io, WriteOptions::default()).unwrap();
//!
//! writer.save(br#"{"schema_version":1,"todos":[]}"#).unwrap();
//! ```

pub mod atomic;
pub mod context;
pub mod error;
pub mod hybrid;
pub mod lock;
pub mod loop_host;
pub mod loop_registry;
pub mod metrics;
pub mod retry;

// Re-export primary API
pub use atomic::{AtomicWriter, WriteOptions, WriteReport, WriteStage, backup_path};
pub use context::{BlockingSection, ExecutionContext, LoopId, spawn_blocking};
pub use error::{ErrorKind, StorageError};
pub use hybrid::{HolderKind, HybridGuard, HybridMutex, LockPolicy, LockStats, TimeoutScope};
pub use lock::{
    FileLockGuard, FileLockOptions, LockBackend, OwnerRecord, PlatformFileLock, lock_path_for,
    lock_range,
};
pub use loop_host::{HostOutcome, LoopHost};
pub use metrics::{MAX_OPERATIONS, MetricsSnapshot, OpType, OperationMetrics, OperationRecord};
pub use retry::{RetryPolicy, RetryableIo, is_transient};
