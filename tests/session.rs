//! Session bridge tests: the output log bound, line accumulation, console
//! transport, and the console→network fallback decision.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ConsoleBehavior, FakePlatform, HistoryStore};
use hyperhost::config::HostConfig;
use hyperhost::model::{OsType, VmRecord};
use hyperhost::paths::HostPaths;
use hyperhost::session::{
    ConnectionMode, LineAccumulator, MAX_LOG_LINES, OutputLog, SessionBridge, SessionTuning,
};
use hyperhost::signal::LogSignals;
use hyperhost::store::RecordStore;
use hyperhost::vm::VmEngine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// ---------------------------------------------------------------------------
// Output log
// ---------------------------------------------------------------------------

#[test]
fn output_log_evicts_oldest_beyond_capacity() {
    let mut log = OutputLog::new(MAX_LOG_LINES);
    for i in 0..=MAX_LOG_LINES {
        log.append(format!("line {i}"));
    }

    assert_eq!(log.len(), MAX_LOG_LINES);
    let snapshot = log.snapshot();
    assert_eq!(snapshot.first().unwrap(), "line 1", "oldest line evicted");
    assert_eq!(snapshot.last().unwrap(), &format!("line {MAX_LOG_LINES}"));
}

// ---------------------------------------------------------------------------
// Line accumulation
// ---------------------------------------------------------------------------

#[test]
fn accumulator_emits_on_newline_and_ignores_cr() {
    let mut acc = LineAccumulator::new();
    let lines = acc.push(b"ab\r\ncd");
    assert_eq!(lines, vec!["ab".to_string()]);
    assert_eq!(acc.take_partial(), Some("cd".to_string()));
    assert_eq!(acc.take_partial(), None);
}

#[test]
fn accumulator_handles_split_lines_across_chunks() {
    let mut acc = LineAccumulator::new();
    assert!(acc.push(b"hel").is_empty());
    assert_eq!(acc.push(b"lo\nwor"), vec!["hello".to_string()]);
    assert_eq!(acc.take_partial(), Some("wor".to_string()));
}

// ---------------------------------------------------------------------------
// Transport selection
// ---------------------------------------------------------------------------

struct SessionEnv {
    platform: Arc<FakePlatform>,
    engine: VmEngine,
    config: HostConfig,
    paths: HostPaths,
    record: VmRecord,
    _tmp: tempfile::TempDir,
}

async fn session_env(console: ConsoleBehavior) -> SessionEnv {
    let tmp = tempfile::tempdir().expect("tempdir");
    let paths = HostPaths::rooted(tmp.path());
    paths.ensure().expect("ensure");

    let mut fake = FakePlatform::new(&["debian"]);
    fake.console = console;
    let platform = Arc::new(fake);
    let store = Arc::new(HistoryStore::new());
    let engine = VmEngine::with_poll_interval(
        platform.clone(),
        store.clone(),
        Arc::new(LogSignals),
        paths.clone(),
        Duration::from_secs(60),
    );

    let record = VmRecord::new("test", OsType::Debian);
    store.insert(record.clone()).await.unwrap();
    engine.create_and_start(&record).await.expect("start");

    let mut config = HostConfig::default();
    // An interface prefix nothing on the host matches, so discovery always
    // comes back empty and the fallback path stays fast.
    config.tap_prefix = "hyperhost-test-tap".into();

    SessionEnv {
        platform,
        engine,
        config,
        paths,
        record,
        _tmp: tmp,
    }
}

fn fast_tuning() -> SessionTuning {
    SessionTuning {
        connect_timeout: Duration::from_secs(1),
        retry_delay: Duration::from_millis(10),
        max_retries: 2,
        idle_flush: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn console_transport_connects_and_streams_lines() {
    let env = session_env(ConsoleBehavior::Full).await;
    let session = SessionBridge::with_tuning(
        env.engine.clone(),
        env.record.id.clone(),
        &env.config,
        &env.paths,
        fast_tuning(),
    );

    session.connect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.mode(), ConnectionMode::Console);

    // Guest output shows up in the log.
    {
        let instance = env.platform.instance("test");
        let mut feed = instance.console_feed.lock().unwrap().take().unwrap();
        feed.write_all(b"hello\nworld\n").await.unwrap();
        feed.flush().await.unwrap();
        // Keep the pipe open so the read loop does not see EOF.
        instance.console_feed.lock().unwrap().replace(feed);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let log = session.log_snapshot();
    assert!(log.contains(&"hello".to_string()), "log: {log:?}");
    assert!(log.contains(&"world".to_string()), "log: {log:?}");

    // Input reaches the guest side of the pipe.
    session.send("ls").await;
    let mut sink = env
        .platform
        .instance("test")
        .console_sink
        .lock()
        .unwrap()
        .take()
        .unwrap();
    let mut buf = [0u8; 3];
    sink.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ls\n");

    session.disconnect().await;
    assert_eq!(session.mode(), ConnectionMode::None);
}

#[tokio::test]
async fn output_without_input_falls_back_to_network() {
    let env = session_env(ConsoleBehavior::OutputOnly).await;
    let session = SessionBridge::with_tuning(
        env.engine.clone(),
        env.record.id.clone(),
        &env.config,
        &env.paths,
        fast_tuning(),
    );

    session.connect();

    // Two quick discovery attempts against a nonexistent tap interface,
    // then the session gives up.
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_ne!(
        session.mode(),
        ConnectionMode::Console,
        "console must be abandoned when input is missing"
    );
    let log = session.log_snapshot();
    assert!(
        log.iter().any(|l| l.contains("connecting over the network")),
        "fallback should be announced: {log:?}"
    );
    assert!(
        log.iter().any(|l| l.contains("failed to connect")),
        "exhausted retries should be reported: {log:?}"
    );
}

#[tokio::test]
async fn no_console_at_all_also_goes_to_network() {
    let env = session_env(ConsoleBehavior::None).await;
    let session = SessionBridge::with_tuning(
        env.engine.clone(),
        env.record.id.clone(),
        &env.config,
        &env.paths,
        fast_tuning(),
    );

    session.connect();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(session.mode(), ConnectionMode::None);
    let log = session.log_snapshot();
    assert!(
        log.iter().any(|l| l.contains("connecting over the network")),
        "log: {log:?}"
    );
}

#[tokio::test]
async fn send_while_disconnected_logs_instead_of_failing() {
    let env = session_env(ConsoleBehavior::Full).await;
    let session = SessionBridge::new(
        env.engine.clone(),
        env.record.id.clone(),
        &env.config,
        &env.paths,
    );

    session.send("echo hi").await;

    let log = session.log_snapshot();
    assert!(log.iter().any(|l| l.contains("not connected")), "log: {log:?}");
}
