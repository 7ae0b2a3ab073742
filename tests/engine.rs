//! Lifecycle engine tests against the fake platform.
//!
//! These pin the engine's externally observable guarantees: the status
//! transition sequences written to the record store, the single-handle
//! invariant, error bookkeeping, and the polling safety net.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakePlatform, HistoryStore};
use hyperhost::model::{EngineError, OsType, VmRecord, VmStatus};
use hyperhost::paths::HostPaths;
use hyperhost::platform::InstanceStatus;
use hyperhost::signal::LogSignals;
use hyperhost::store::RecordStore;
use hyperhost::vm::{VmEngine, sanitize_vm_name};

const POLL: Duration = Duration::from_millis(30);

struct Harness {
    platform: Arc<FakePlatform>,
    store: Arc<HistoryStore>,
    engine: VmEngine,
    _tmp: tempfile::TempDir,
}

fn harness(platform: FakePlatform) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let paths = HostPaths::rooted(tmp.path());
    paths.ensure().expect("ensure paths");
    let platform = Arc::new(platform);
    let store = Arc::new(HistoryStore::new());
    let engine = VmEngine::with_poll_interval(
        platform.clone(),
        store.clone(),
        Arc::new(LogSignals),
        paths,
        POLL,
    );
    Harness {
        platform,
        store,
        engine,
        _tmp: tmp,
    }
}

async fn insert_record(store: &HistoryStore, name: &str, os: OsType) -> VmRecord {
    let record = VmRecord::new(name, os);
    store.insert(record.clone()).await.unwrap();
    record
}

/// Let unacked listener/poller events drain through the consumer.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(120)).await;
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn named_os_start_walks_stopped_starting_running() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;

    h.engine.create_and_start(&record).await.expect("start");

    assert_eq!(h.engine.status(&record.id), VmStatus::Running);
    assert!(h.engine.is_running(&record.id));
    assert_eq!(
        h.store.status_history(&record.id),
        vec![VmStatus::Starting, VmStatus::Running]
    );

    let stored = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, VmStatus::Running);
    assert!(stored.last_started_at.is_some());
    assert_eq!(h.platform.created_names(), vec!["test".to_string()]);
}

#[tokio::test]
async fn start_sanitizes_the_platform_name() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "my dev vm!", OsType::Debian).await;

    h.engine.create_and_start(&record).await.expect("start");

    assert_eq!(h.platform.created_names(), vec!["my_dev_vm_".to_string()]);
    assert_eq!(sanitize_vm_name("my dev vm!"), "my_dev_vm_");
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;

    h.engine.create_and_start(&record).await.expect("start");
    let second = h.engine.create_and_start(&record).await;

    assert!(matches!(second, Err(EngineError::AlreadyRunning(_))));
    // Still exactly one instance.
    assert_eq!(h.platform.created_names().len(), 1);
}

#[tokio::test]
async fn start_without_manager_fails_with_capability_unavailable() {
    let mut platform = FakePlatform::new(&["debian"]);
    platform.manager = false;
    let h = harness(platform);
    let record = insert_record(&h.store, "test", OsType::Debian).await;

    let result = h.engine.create_and_start(&record).await;

    assert!(matches!(result, Err(EngineError::CapabilityUnavailable)));
    assert!(!h.engine.is_running(&record.id));
}

// ---------------------------------------------------------------------------
// Config build failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn build_failure_sets_error_and_allows_retry() {
    // No native guest support, no image.
    let h = harness(FakePlatform::new(&[]));
    let mut record = insert_record(&h.store, "test", OsType::Debian).await;

    let result = h.engine.create_and_start(&record).await;
    let Err(EngineError::ConfigBuildFailure(reason)) = result else {
        panic!("expected ConfigBuildFailure, got {result:?}");
    };
    assert!(
        reason.contains("bootable"),
        "reason should cite the missing bootable image: {reason}"
    );

    assert_eq!(h.engine.status(&record.id), VmStatus::Error);
    assert!(!h.engine.is_running(&record.id));
    assert!(h.platform.created_names().is_empty());
    assert_eq!(h.engine.last_error(&record.id), Some(reason));

    // Error → Starting is valid: fix the record and retry.
    let image = h._tmp.path().join("disk.img");
    std::fs::write(&image, b"img").unwrap();
    record.image_path = Some(image);
    h.store.update(record.clone()).await.unwrap();

    h.engine.create_and_start(&record).await.expect("retry");
    assert_eq!(h.engine.status(&record.id), VmStatus::Running);
    assert!(h.engine.last_error(&record.id).is_none());
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_on_unknown_id_is_vm_not_found_and_leaves_status_alone() {
    let h = harness(FakePlatform::new(&["debian"]));

    let result = h.engine.stop("missing").await;

    assert!(matches!(result, Err(EngineError::VmNotFound(_))));
    assert_eq!(h.engine.status("missing"), VmStatus::Stopped);
    assert!(h.store.status_history("missing").is_empty());
}

#[tokio::test]
async fn stop_removes_handle_and_transitions_to_stopped() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;
    h.engine.create_and_start(&record).await.expect("start");

    h.engine.stop(&record.id).await.expect("stop");

    assert_eq!(h.engine.status(&record.id), VmStatus::Stopped);
    assert!(!h.engine.is_running(&record.id));
    // A second stop addresses stale state.
    assert!(matches!(
        h.engine.stop(&record.id).await,
        Err(EngineError::VmNotFound(_))
    ));
}

#[tokio::test]
async fn stop_falls_back_to_forced_stop() {
    let mut platform = FakePlatform::new(&["debian"]);
    platform.shutdown_unsupported = true;
    let h = harness(platform);
    let record = insert_record(&h.store, "test", OsType::Debian).await;
    h.engine.create_and_start(&record).await.expect("start");

    h.engine.stop(&record.id).await.expect("stop");

    assert_eq!(h.engine.status(&record.id), VmStatus::Stopped);
    assert_eq!(
        *h.platform.instance("test").status.lock().unwrap(),
        InstanceStatus::Stopped
    );
}

// ---------------------------------------------------------------------------
// Lifecycle events and polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listener_fault_records_error_and_frees_the_handle() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;
    h.engine.create_and_start(&record).await.expect("start");

    h.platform.instance("test").fire_error(7, "guest exploded");
    settle().await;

    assert_eq!(h.engine.status(&record.id), VmStatus::Error);
    assert!(!h.engine.is_running(&record.id));
    let detail = h.engine.last_error(&record.id).expect("error recorded");
    assert!(detail.contains("error 7"), "got: {detail}");
    assert!(detail.contains("guest exploded"), "got: {detail}");

    // Retry from Error is accepted and replaces the instance.
    h.engine.create_and_start(&record).await.expect("retry");
    assert_eq!(h.engine.status(&record.id), VmStatus::Running);
}

#[tokio::test]
async fn listener_finish_transitions_to_stopped() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;
    h.engine.create_and_start(&record).await.expect("start");

    h.platform.instance("test").fire_finished(0);
    settle().await;

    assert_eq!(h.engine.status(&record.id), VmStatus::Stopped);
    assert!(!h.engine.is_running(&record.id));
    let stored = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, VmStatus::Stopped);
}

#[tokio::test]
async fn poller_notices_an_externally_dead_instance() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;
    h.engine.create_and_start(&record).await.expect("start");

    // Kill the instance behind the engine's back; no listener event fires.
    h.platform
        .instance("test")
        .set_status(InstanceStatus::Stopped);

    // Give the poller a few intervals.
    tokio::time::sleep(POLL * 8).await;

    assert_eq!(h.engine.status(&record.id), VmStatus::Stopped);
    assert!(!h.engine.is_running(&record.id));
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_stops_and_clears_engine_state() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;
    h.engine.create_and_start(&record).await.expect("start");

    h.engine.delete(&record.id).await.expect("delete");

    assert!(!h.engine.is_running(&record.id));
    assert!(h.engine.last_error(&record.id).is_none());
    assert!(!h.engine.statuses().contains_key(&record.id));
    assert!(
        h.platform.deleted_names().contains(&"test".to_string()),
        "platform delete by mapped name"
    );
    // The record itself belongs to the store's caller.
    assert!(h.store.get(&record.id).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_of_a_stopped_vm_is_accepted() {
    let h = harness(FakePlatform::new(&["debian"]));
    let record = insert_record(&h.store, "test", OsType::Debian).await;

    h.engine.delete(&record.id).await.expect("delete");
    assert!(!h.engine.statuses().contains_key(&record.id));
}
