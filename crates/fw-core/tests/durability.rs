//! End-to-end durability behaviour of `TodoStorage`

use flywheel_core::io::{
    LoopHost, OpType, OperationMetrics, RetryPolicy, RetryableIo, backup_path, lock_path_for,
};
use flywheel_core::{ErrorKind, StorageConfig, Todo, TodoStorage};
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn todos(n: u64) -> Vec<Todo> {
    (1..=n).map(|id| Todo::new(id, format!("todo {id}"))).collect()
}

#[test]
fn test_backup_holds_previous_save() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("todo.json");
    let storage = TodoStorage::open(
        &target,
        StorageConfig {
            backup: true,
            ..StorageConfig::default()
        },
    )
    .unwrap();

    let mut previous = Vec::new();
    for n in 1..=4 {
        storage.save(&todos(n)).unwrap();
        if n > 1 {
            assert_eq!(fs::read(backup_path(&target, 0)).unwrap(), previous);
        }
        previous = fs::read(&target).unwrap();
    }
    assert!(!backup_path(&target, 1).exists());
}

#[test]
fn test_load_after_external_delete_is_empty() {
    let temp_dir = TempDir::new().unwrap();
    let storage = TodoStorage::open(
        temp_dir.path().join("todo.json"),
        StorageConfig {
            cache: true,
            ..StorageConfig::default()
        },
    )
    .unwrap();

    storage.save(&todos(3)).unwrap();
    assert_eq!(storage.load().unwrap().len(), 3);

    fs::remove_file(storage.path()).unwrap();
    assert!(storage.load().unwrap().is_empty());
}

#[tokio::test]
async fn test_async_load_after_external_delete_is_empty() {
    let temp_dir = TempDir::new().unwrap();
    let storage = TodoStorage::open(temp_dir.path().join("todo.json"), StorageConfig::default()).unwrap();

    storage.save_async(&todos(2)).await.unwrap();
    fs::remove_file(storage.path()).unwrap();
    assert!(storage.load_async().await.unwrap().is_empty());
}

#[test]
fn test_failed_decode_leaves_file_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let storage = TodoStorage::open(temp_dir.path().join("todo.json"), StorageConfig::default()).unwrap();
    fs::write(storage.path(), br#"{"schema_version": 7, "todos": []}"#).unwrap();

    let err = storage.load().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert_eq!(
        fs::read(storage.path()).unwrap(),
        br#"{"schema_version": 7, "todos": []}"#
    );
}

#[test]
fn test_unknown_fields_survive_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let storage = TodoStorage::open(temp_dir.path().join("todo.json"), StorageConfig::default()).unwrap();
    fs::write(
        storage.path(),
        r#"{"schema_version": 1, "todos": [{"id": 4, "text": "tagged", "done": false, "tags": ["home"]}]}"#,
    )
    .unwrap();

    let loaded = storage.load().unwrap();
    storage.save(&loaded).unwrap();

    let raw: serde_json::Value = serde_json::from_slice(&fs::read(storage.path()).unwrap()).unwrap();
    assert_eq!(raw["todos"][0]["tags"][0], "home");
    assert!(raw["todos"][0]["created_at"].is_string());
}

#[cfg(unix)]
#[test]
fn test_lock_file_left_by_crashed_process_does_not_block() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("todo.json");
    let storage = TodoStorage::open(
        &target,
        StorageConfig {
            lock_timeout_secs: 2.0,
            ..StorageConfig::default()
        },
    )
    .unwrap();

    // A crashed holder leaves its record behind but its flock died with it
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    let record = format!(r#"{{"pid":{pid},"host":"crashed","acquired_at_ms":0}}"#);
    fs::write(lock_path_for(&target), format!("{record:<128}")).unwrap();

    storage.save(&todos(1)).unwrap();
    assert_eq!(storage.load().unwrap().len(), 1);
    assert_eq!(storage.lock_stats().timeouts, 0);
}

fn retryable_io(timeout: Duration, max_attempts: u32) -> RetryableIo {
    RetryableIo::new(
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            timeout,
        },
        Arc::new(OperationMetrics::new()),
        Arc::new(LoopHost::new("fw-test-retry")),
    )
}

#[test]
fn test_deadline_is_timeout_not_io_error() {
    let io = retryable_io(Duration::from_millis(50), 3);
    let err = io
        .run(OpType::Read, "slow.json".as_ref(), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoTimeout);
}

#[test]
fn test_permanent_error_is_not_retried() {
    let io = retryable_io(Duration::from_secs(5), 5);
    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);

    let err = io
        .run(OpType::Write, "denied.json".as_ref(), move || -> io::Result<()> {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let snapshot = io.metrics().snapshot();
    assert_eq!(snapshot.failures, 1);
    assert_eq!(snapshot.total_retries, 0);
}

#[test]
fn test_safe_message_hides_paths() {
    let temp_dir = TempDir::new().unwrap();
    let storage = TodoStorage::open(
        temp_dir.path().join("todo.json"),
        StorageConfig {
            max_file_bytes: 8,
            ..StorageConfig::default()
        },
    )
    .unwrap();
    fs::write(storage.path(), b"[        ]").unwrap();

    let err = storage.load().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooLarge);
    assert!(err.to_string().contains("todo.json"));
    assert!(!err.safe_message().contains(&*temp_dir.path().to_string_lossy()));
}
