//! Operation metrics for storage I/O
//!
//! Every I/O attempt made through [`RetryableIo`](crate::io::retry::RetryableIo)
//! lands here as an [`OperationRecord`]. Records live in a fixed-capacity ring
//! buffer; once [`MAX_OPERATIONS`] is reached the oldest record is evicted.
//!
//! The buffer itself is guarded by a short, non-async critical section, which
//! is safe from any thread and any runtime. Async recorders additionally
//! queue on a per-loop async guard so tasks of one loop take turns instead of
//! all hammering the buffer mutex; the guards are created lazily through a
//! [`LoopRegistry`], whose own mutex serialises creation.

use crate::io::context::ExecutionContext;
use crate::io::loop_registry::LoopRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Capacity of the operation ring buffer
pub const MAX_OPERATIONS: usize = 1000;

/// Kind of storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Read,
    Write,
    Fsync,
    SetPermissions,
    Rename,
    Backup,
    CreateDir,
    Cleanup,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Read => "read",
            OpType::Write => "write",
            OpType::Fsync => "fsync",
            OpType::SetPermissions => "set_permissions",
            OpType::Rename => "rename",
            OpType::Backup => "backup",
            OpType::CreateDir => "create_dir",
            OpType::Cleanup => "cleanup",
        }
    }
}

/// One completed (successful or failed) operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_type: OpType,
    pub duration: Duration,
    pub retry_count: u32,
    pub success: bool,
    /// Raw OS error code of the final failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
}

/// Aggregate for one operation type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSummary {
    pub count: usize,
    pub failures: usize,
    pub retries: u64,
    pub total_duration: Duration,
}

/// Point-in-time copy of the recorder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_operations: usize,
    pub successes: usize,
    pub failures: usize,
    pub total_retries: u64,
    pub total_duration: Duration,
    pub by_op: BTreeMap<OpType, OpSummary>,
}

pub struct OperationMetrics {
    records: Mutex<VecDeque<OperationRecord>>,
    capacity: usize,
    async_guards: LoopRegistry<tokio::sync::Mutex<()>>,
    slow_threshold: Option<Duration>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::with_capacity(MAX_OPERATIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            async_guards: LoopRegistry::new(),
            slow_threshold: None,
        }
    }

    /// Warn about operations slower than `threshold`
    pub fn with_slow_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OperationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(
        &self,
        op_type: OpType,
        duration: Duration,
        retry_count: u32,
        success: bool,
        error_code: Option<i32>,
    ) {
        self.push(OperationRecord {
            op_type,
            duration,
            retry_count,
            success,
            error_code,
        });
    }

    /// Record from async code, taking turns with other tasks on this loop
    pub async fn record_async(
        &self,
        op_type: OpType,
        duration: Duration,
        retry_count: u32,
        success: bool,
        error_code: Option<i32>,
    ) {
        let record = OperationRecord {
            op_type,
            duration,
            retry_count,
            success,
            error_code,
        };
        match ExecutionContext::detect() {
            ExecutionContext::Async(loop_id) => {
                let guard = self.async_guards.get_or_create(loop_id);
                let _turn = guard.lock().await;
                self.push(record);
            }
            ExecutionContext::Sync => self.push(record),
        }
    }

    fn push(&self, record: OperationRecord) {
        if let Some(threshold) = self.slow_threshold
            && record.duration > threshold
        {
            warn!(
                op = record.op_type.as_str(),
                duration_ms = record.duration.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                retries = record.retry_count,
                "Slow storage operation"
            );
        }

        let mut records = self.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Drop all records. Idempotent.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Forget the async guard of a loop that has been shut down
    pub fn release_loop(&self, loop_id: crate::io::context::LoopId) -> bool {
        self.async_guards.evict(loop_id)
    }

    pub fn total_operation_count(&self) -> usize {
        self.lock().len()
    }

    pub fn total_duration(&self) -> Duration {
        self.lock().iter().map(|r| r.duration).sum()
    }

    pub fn records(&self) -> Vec<OperationRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let records = self.lock();
        let mut snapshot = MetricsSnapshot::default();
        for record in records.iter() {
            snapshot.total_operations += 1;
            snapshot.total_retries += u64::from(record.retry_count);
            snapshot.total_duration += record.duration;
            if record.success {
                snapshot.successes += 1;
            } else {
                snapshot.failures += 1;
            }

            let entry = snapshot.by_op.entry(record.op_type).or_default();
            entry.count += 1;
            entry.retries += u64::from(record.retry_count);
            entry.total_duration += record.duration;
            if !record.success {
                entry.failures += 1;
            }
        }
        snapshot
    }

    /// Emit the current snapshot as one structured log line
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            operations = snapshot.total_operations,
            failures = snapshot.failures,
            retries = snapshot.total_retries,
            total_ms = snapshot.total_duration.as_millis() as u64,
            "Storage operation metrics"
        );
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ring_buffer_never_exceeds_capacity() {
        let metrics = OperationMetrics::new();
        for i in 0..(MAX_OPERATIONS + 250) {
            metrics.record(OpType::Write, Duration::from_micros(i as u64), 0, true, None);
        }
        assert_eq!(metrics.total_operation_count(), MAX_OPERATIONS);

        // Oldest records were evicted first
        let first = &metrics.records()[0];
        assert_eq!(first.duration, Duration::from_micros(250));
    }

    #[test]
    fn test_reset_clears_and_is_idempotent() {
        let metrics = OperationMetrics::with_capacity(8);
        metrics.record(OpType::Read, Duration::from_millis(3), 1, true, None);
        metrics.record(OpType::Rename, Duration::from_millis(2), 0, false, Some(5));

        metrics.reset();
        assert_eq!(metrics.total_operation_count(), 0);
        assert_eq!(metrics.total_duration(), Duration::ZERO);
        metrics.reset();
        assert_eq!(metrics.total_operation_count(), 0);
    }

    #[test]
    fn test_snapshot_aggregates_by_op() {
        let metrics = OperationMetrics::new();
        metrics.record(OpType::Write, Duration::from_millis(4), 2, true, None);
        metrics.record(OpType::Write, Duration::from_millis(6), 0, false, Some(5));
        metrics.record(OpType::Fsync, Duration::from_millis(1), 0, true, None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_operations, 3);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.total_retries, 2);
        assert_eq!(snapshot.total_duration, Duration::from_millis(11));

        let writes = &snapshot.by_op[&OpType::Write];
        assert_eq!(writes.count, 2);
        assert_eq!(writes.failures, 1);
        assert_eq!(metrics.total_duration(), Duration::from_millis(11));
    }

    #[test]
    fn test_concurrent_threads_and_loops() {
        let metrics = Arc::new(OperationMetrics::with_capacity(10_000));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let metrics = Arc::clone(&metrics);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    metrics.record(OpType::Read, Duration::from_micros(1), 0, true, None);
                }
            }));
        }
        // Independent event loops, each on its own thread
        for _ in 0..4 {
            let metrics = Arc::clone(&metrics);
            handles.push(thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let mut tasks = Vec::new();
                    for _ in 0..10 {
                        let metrics = Arc::clone(&metrics);
                        tasks.push(tokio::spawn(async move {
                            for _ in 0..10 {
                                metrics
                                    .record_async(OpType::Write, Duration::from_micros(1), 0, true, None)
                                    .await;
                                tokio::task::yield_now().await;
                            }
                        }));
                    }
                    for task in tasks {
                        task.await.unwrap();
                    }
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.total_operation_count(), 800);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.by_op[&OpType::Read].count, 400);
        assert_eq!(snapshot.by_op[&OpType::Write].count, 400);
    }

    #[test]
    fn test_reset_races_with_recorders() {
        let metrics = Arc::new(OperationMetrics::with_capacity(64));
        let recorder = {
            let metrics = Arc::clone(&metrics);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    metrics.record(OpType::Write, Duration::from_micros(1), 0, true, None);
                }
            })
        };
        for _ in 0..50 {
            metrics.reset();
            assert!(metrics.total_operation_count() <= 64);
        }
        recorder.join().unwrap();
        metrics.reset();
        assert_eq!(metrics.total_operation_count(), 0);
    }
}
