//! Shared test doubles: a scriptable platform, a record store that keeps a
//! status history, and a scripted broker server on a Unix socket.
//!
//! The fakes implement the real traits, so the engine, builder and session
//! bridge run unmodified against them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use hyperhost::model::{VmRecord, VmStatus};
use hyperhost::platform::{
    ConsoleReader, ConsoleWriter, InstanceStatus, LifecycleListener, PlatformConfig,
    PlatformError, PlatformFeatures, PlatformResult, VirtPlatform, VmInstance,
};
use hyperhost::store::{MemoryStore, RecordStore};

// ---------------------------------------------------------------------------
// Fake platform
// ---------------------------------------------------------------------------

/// How a fake instance's console behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleBehavior {
    /// Both pipes available.
    Full,
    /// Output pipe only — input claims report `Unsupported`.
    OutputOnly,
    /// No console at all.
    None,
}

/// Everything the host "can do", fully enabled.
pub fn full_features() -> PlatformFeatures {
    PlatformFeatures {
        memory_limit: true,
        console_capture: true,
        cpu_match_host: true,
        protected_flag: true,
        graceful_shutdown: true,
        os_catalog: true,
        supports_protected_vm: false,
        supports_non_protected_vm: true,
    }
}

pub struct FakePlatform {
    pub manager: bool,
    pub api_version: u32,
    pub features: PlatformFeatures,
    /// `None` makes the catalog query report `Unsupported`.
    pub os_list: Option<Vec<String>>,
    pub console: ConsoleBehavior,
    pub fail_create: bool,
    pub shutdown_unsupported: bool,

    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    instances: Mutex<HashMap<String, Arc<FakeInstance>>>,
}

impl FakePlatform {
    pub fn new(os_list: &[&str]) -> Self {
        Self {
            manager: true,
            api_version: 5,
            features: full_features(),
            os_list: Some(os_list.iter().map(|s| s.to_string()).collect()),
            console: ConsoleBehavior::Full,
            fail_create: false,
            shutdown_unsupported: false,
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// The live fake instance created under `name`.
    pub fn instance(&self, name: &str) -> Arc<FakeInstance> {
        self.instances
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("no fake instance named {name}"))
    }
}

#[async_trait]
impl VirtPlatform for FakePlatform {
    fn api_version(&self) -> u32 {
        if self.manager { self.api_version } else { 0 }
    }

    fn manager_available(&self) -> bool {
        self.manager
    }

    fn features(&self) -> PlatformFeatures {
        self.features
    }

    async fn supported_guest_os_list(&self) -> PlatformResult<Vec<String>> {
        match &self.os_list {
            Some(list) => Ok(list.clone()),
            None => Err(PlatformError::Unsupported("guest OS catalog")),
        }
    }

    async fn create(
        &self,
        name: &str,
        _config: &PlatformConfig,
    ) -> PlatformResult<Arc<dyn VmInstance>> {
        if self.fail_create {
            return Err(PlatformError::Invocation("create refused by test".into()));
        }
        self.created.lock().unwrap().push(name.to_string());
        let instance = Arc::new(FakeInstance::new(
            name,
            self.console,
            self.shutdown_unsupported,
        ));
        self.instances
            .lock()
            .unwrap()
            .insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    async fn delete(&self, name: &str) -> PlatformResult<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        match self.instances.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound(name.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake instance
// ---------------------------------------------------------------------------

pub struct FakeInstance {
    name: String,
    console: ConsoleBehavior,
    shutdown_unsupported: bool,
    pub status: Mutex<InstanceStatus>,
    listener: Mutex<Option<Arc<dyn LifecycleListener>>>,
    console_out: Mutex<Option<ConsoleReader>>,
    console_in: Mutex<Option<ConsoleWriter>>,
    /// Test side of the output pipe: write here, the session reads it.
    pub console_feed: Mutex<Option<DuplexStream>>,
    /// Test side of the input pipe: read here what the session sent.
    pub console_sink: Mutex<Option<DuplexStream>>,
}

impl FakeInstance {
    fn new(name: &str, console: ConsoleBehavior, shutdown_unsupported: bool) -> Self {
        let (console_out, console_feed) = match console {
            ConsoleBehavior::None => (None, None),
            _ => {
                let (host, guest) = tokio::io::duplex(4096);
                (Some(Box::new(host) as ConsoleReader), Some(guest))
            }
        };
        let (console_in, console_sink) = match console {
            ConsoleBehavior::Full => {
                let (host, guest) = tokio::io::duplex(4096);
                (Some(Box::new(host) as ConsoleWriter), Some(guest))
            }
            _ => (None, None),
        };
        Self {
            name: name.to_string(),
            console,
            shutdown_unsupported,
            status: Mutex::new(InstanceStatus::Stopped),
            listener: Mutex::new(None),
            console_out: Mutex::new(console_out),
            console_in: Mutex::new(console_in),
            console_feed: Mutex::new(console_feed),
            console_sink: Mutex::new(console_sink),
        }
    }

    pub fn set_status(&self, status: InstanceStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn listener(&self) -> Option<Arc<dyn LifecycleListener>> {
        self.listener.lock().unwrap().clone()
    }

    pub fn fire_ready(&self) {
        if let Some(l) = self.listener() {
            l.on_payload_ready();
        }
    }

    pub fn fire_finished(&self, exit_code: i32) {
        self.set_status(InstanceStatus::Stopped);
        if let Some(l) = self.listener() {
            l.on_payload_finished(exit_code);
        }
    }

    pub fn fire_error(&self, code: i32, message: &str) {
        self.set_status(InstanceStatus::Stopped);
        if let Some(l) = self.listener() {
            l.on_error(code, message);
        }
    }

    pub fn fire_stopped(&self) {
        self.set_status(InstanceStatus::Stopped);
        if let Some(l) = self.listener() {
            l.on_stopped();
        }
    }
}

#[async_trait]
impl VmInstance for FakeInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_listener(&self, listener: Arc<dyn LifecycleListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn run(&self) -> PlatformResult<()> {
        self.set_status(InstanceStatus::Running);
        Ok(())
    }

    async fn shutdown(&self) -> PlatformResult<()> {
        if self.shutdown_unsupported {
            return Err(PlatformError::Unsupported("graceful shutdown"));
        }
        self.set_status(InstanceStatus::Stopped);
        Ok(())
    }

    async fn force_stop(&self) -> PlatformResult<()> {
        self.set_status(InstanceStatus::Stopped);
        Ok(())
    }

    async fn status(&self) -> PlatformResult<InstanceStatus> {
        Ok(*self.status.lock().unwrap())
    }

    async fn console_output(&self) -> PlatformResult<ConsoleReader> {
        if self.console == ConsoleBehavior::None {
            return Err(PlatformError::Unsupported("console capture"));
        }
        self.console_out
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PlatformError::Invocation("console output already claimed".into()))
    }

    async fn console_input(&self) -> PlatformResult<ConsoleWriter> {
        if self.console != ConsoleBehavior::Full {
            return Err(PlatformError::Unsupported("console input"));
        }
        self.console_in
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PlatformError::Invocation("console input already claimed".into()))
    }
}

// ---------------------------------------------------------------------------
// History-keeping store
// ---------------------------------------------------------------------------

/// Record store that remembers every status written through `update`, so
/// tests can assert full transition sequences.
#[derive(Default)]
pub struct HistoryStore {
    inner: MemoryStore,
    history: Mutex<Vec<(String, VmStatus)>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_history(&self, id: &str) -> Vec<VmStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(record_id, _)| record_id == id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl RecordStore for HistoryStore {
    async fn list(&self) -> anyhow::Result<Vec<VmRecord>> {
        self.inner.list().await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<VmRecord>> {
        self.inner.get(id).await
    }

    async fn insert(&self, record: VmRecord) -> anyhow::Result<()> {
        self.inner.insert(record).await
    }

    async fn update(&self, record: VmRecord) -> anyhow::Result<()> {
        self.history
            .lock()
            .unwrap()
            .push((record.id.clone(), record.status));
        self.inner.update(record).await
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.inner.delete(id).await
    }
}

// ---------------------------------------------------------------------------
// Scripted broker server
// ---------------------------------------------------------------------------

/// What the scripted broker answers for one op.
pub enum OpOutcome {
    Ok,
    OkData(serde_json::Value),
    UnknownOp,
    Denied(&'static str),
}

pub type OpHandler = Arc<dyn Fn(&str, &serde_json::Value) -> OpOutcome + Send + Sync>;

/// Serve a scripted broker on `socket`. Sends the `connected` event on
/// every accept, then answers each request line via `handler`.
pub fn spawn_broker(socket: &Path, api_version: u32, handler: OpHandler) -> JoinHandle<()> {
    let listener = UnixListener::bind(socket).expect("bind broker socket");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let hello = format!(
                    "{}\n",
                    serde_json::json!({"event": "connected", "api_version": api_version})
                );
                if write_half.write_all(hello.as_bytes()).await.is_err() {
                    return;
                }

                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(request) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };
                    let id = request.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
                    let op = request
                        .get("op")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();

                    let reply = match handler(&op, &request) {
                        OpOutcome::Ok => serde_json::json!({"id": id, "ok": true}),
                        OpOutcome::OkData(data) => {
                            serde_json::json!({"id": id, "ok": true, "data": data})
                        }
                        OpOutcome::UnknownOp => serde_json::json!({
                            "id": id, "ok": false,
                            "error": {"kind": "unknown-op", "message": format!("no such op: {op}")}
                        }),
                        OpOutcome::Denied(message) => serde_json::json!({
                            "id": id, "ok": false,
                            "error": {"kind": "denied", "message": message}
                        }),
                    };
                    let line = format!("{reply}\n");
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    })
}
