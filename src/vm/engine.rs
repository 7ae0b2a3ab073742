//! The VM lifecycle engine.
//!
//! Owns the platform instances, keyed by record id. The platform addresses
//! VMs by name, the engine by id; the id→name mapping is kept consistent
//! here — an id never has two live names, and each live name belongs to
//! exactly one id.
//!
//! Status is written by exactly one place: the lifecycle-event listener and
//! the 3-second status poller both publish `VmEvent`s into a single channel,
//! and one consumer task applies them to the per-VM state machine, the
//! in-memory status map and the record store. That removes the race between
//! the callback and polling paths — neither ever writes status directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use statig::blocking::StateMachine;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{EngineError, VmRecord, VmStatus};
use crate::paths::HostPaths;
use crate::platform::{
    ConsoleReader, ConsoleWriter, InstanceStatus, LifecycleListener, PlatformError, VirtPlatform,
    VmInstance,
};
use crate::signal::ServiceSignals;
use crate::store::RecordStore;
use crate::vm::builder;
use crate::vm::state::{LifecycleEvent, VmLifecycle, status_of};

/// Platform VM names are capped and restricted to a safe character set.
const MAX_VM_NAME_LEN: usize = 50;

/// How often the status poller checks a running instance. The poller is the
/// sole source of truth for custom-image VMs, whose payload events never
/// fire.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Replace everything outside `[A-Za-z0-9_-]` and cap the length.
pub fn sanitize_vm_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_VM_NAME_LEN);
    out
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum VmEventKind {
    StartRequested,
    RunIssued,
    PayloadStarted,
    PayloadReady,
    PayloadFinished { exit_code: i32 },
    Fault { message: String },
    StopObserved,
    /// Engine-side cleanup after a delete: drops status, name mapping and
    /// cached error for the id.
    Deleted,
}

struct VmEvent {
    id: String,
    kind: VmEventKind,
    /// Present when the publisher needs the transition applied before it
    /// continues (engine API paths). Listener and poller publish without.
    ack: Option<oneshot::Sender<()>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct VmEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    platform: Arc<dyn VirtPlatform>,
    store: Arc<dyn RecordStore>,
    signals: Arc<dyn ServiceSignals>,
    paths: HostPaths,
    poll_interval: Duration,

    /// Live platform instances by record id. At most one entry per id.
    running: Mutex<HashMap<String, Arc<dyn VmInstance>>>,
    /// Record id → platform name, kept until delete.
    names: Mutex<HashMap<String, String>>,
    statuses: Mutex<HashMap<String, VmStatus>>,
    machines: Mutex<HashMap<String, StateMachine<VmLifecycle>>>,
    last_errors: Mutex<HashMap<String, String>>,
    /// One status poller per running id.
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Ids with a start currently in flight, so concurrent starts for the
    /// same record cannot both create an instance.
    starts: Mutex<HashSet<String>>,

    events: mpsc::UnboundedSender<VmEvent>,
}

impl VmEngine {
    pub fn new(
        platform: Arc<dyn VirtPlatform>,
        store: Arc<dyn RecordStore>,
        signals: Arc<dyn ServiceSignals>,
        paths: HostPaths,
    ) -> Self {
        Self::with_poll_interval(platform, store, signals, paths, POLL_INTERVAL)
    }

    /// Same as [`new`](Self::new) with an explicit poll interval; tests use
    /// a short one.
    pub fn with_poll_interval(
        platform: Arc<dyn VirtPlatform>,
        store: Arc<dyn RecordStore>,
        signals: Arc<dyn ServiceSignals>,
        paths: HostPaths,
        poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(EngineShared {
            platform,
            store,
            signals,
            paths,
            poll_interval,
            running: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            last_errors: Mutex::new(HashMap::new()),
            pollers: Mutex::new(HashMap::new()),
            starts: Mutex::new(HashSet::new()),
            events: tx,
        });

        tokio::spawn(run_event_loop(shared.clone(), rx));

        Self { shared }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self, id: &str) -> VmStatus {
        self.shared
            .statuses
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(VmStatus::Stopped)
    }

    pub fn statuses(&self) -> HashMap<String, VmStatus> {
        self.shared.statuses.lock().unwrap().clone()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.shared.running.lock().unwrap().contains_key(id)
    }

    pub fn last_error(&self, id: &str) -> Option<String> {
        self.shared.last_errors.lock().unwrap().get(id).cloned()
    }

    pub fn clear_error(&self, id: &str) {
        self.shared.last_errors.lock().unwrap().remove(id);
    }

    /// Take the console output pipe of a running VM, if the instance
    /// provides one.
    pub async fn console_output(&self, id: &str) -> Option<ConsoleReader> {
        let instance = self.running_instance(id)?;
        match instance.console_output().await {
            Ok(reader) => Some(reader),
            Err(e) => {
                debug!(id, error = %e, "console output unavailable");
                None
            }
        }
    }

    /// Take the console input pipe of a running VM.
    pub async fn console_input(&self, id: &str) -> Option<ConsoleWriter> {
        let instance = self.running_instance(id)?;
        match instance.console_input().await {
            Ok(writer) => Some(writer),
            Err(e) => {
                debug!(id, error = %e, "console input unavailable");
                None
            }
        }
    }

    fn running_instance(&self, id: &str) -> Option<Arc<dyn VmInstance>> {
        self.shared.running.lock().unwrap().get(id).cloned()
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Build a platform config for the record, create the instance and run
    /// it. On success the record is optimistically marked running and a
    /// status poller takes over as the safety net.
    pub async fn create_and_start(&self, record: &VmRecord) -> Result<(), EngineError> {
        let id = record.id.clone();

        // One start in flight per id, and never while already live.
        let _guard = StartGuard::acquire(&self.shared, &id)
            .ok_or_else(|| EngineError::AlreadyRunning(id.clone()))?;
        if matches!(self.status(&id), VmStatus::Starting | VmStatus::Running) {
            return Err(EngineError::AlreadyRunning(id));
        }

        self.clear_error(&id);

        if !self.shared.platform.manager_available() {
            return Err(EngineError::CapabilityUnavailable);
        }

        self.publish_waited(&id, VmEventKind::StartRequested).await;

        let config = match builder::build(&*self.shared.platform, &self.shared.paths, record).await
        {
            Ok(config) => config,
            Err(e) => {
                self.publish_waited(
                    &id,
                    VmEventKind::Fault {
                        message: e.reason.clone(),
                    },
                )
                .await;
                return Err(EngineError::ConfigBuildFailure(e.reason));
            }
        };

        let vm_name = sanitize_vm_name(&record.name);

        // A live name must belong to exactly one id.
        if let Some(holder) = self.live_name_holder(&vm_name, &id) {
            let message = format!("platform name {vm_name} is in use by VM {holder}");
            self.publish_waited(
                &id,
                VmEventKind::Fault {
                    message: message.clone(),
                },
            )
            .await;
            return Err(EngineError::PlatformInvocationFailure(message));
        }

        // A stale platform instance may linger under this name from an
        // earlier run; pre-delete it and ignore failure — it may not exist.
        if let Err(e) = self.shared.platform.delete(&vm_name).await {
            debug!(name = %vm_name, error = %e, "stale instance pre-delete");
        }

        let instance = match self.shared.platform.create(&vm_name, &config).await {
            Ok(instance) => instance,
            Err(e) => {
                let message = e.to_string();
                self.publish_waited(
                    &id,
                    VmEventKind::Fault {
                        message: message.clone(),
                    },
                )
                .await;
                return Err(EngineError::PlatformInvocationFailure(message));
            }
        };

        self.shared
            .names
            .lock()
            .unwrap()
            .insert(id.clone(), vm_name.clone());

        instance.set_listener(Arc::new(EngineListener {
            id: id.clone(),
            events: self.shared.events.clone(),
        }));

        if let Err(e) = instance.run().await {
            let message = e.to_string();
            self.publish_waited(
                &id,
                VmEventKind::Fault {
                    message: message.clone(),
                },
            )
            .await;
            return Err(EngineError::PlatformInvocationFailure(message));
        }

        self.shared
            .running
            .lock()
            .unwrap()
            .insert(id.clone(), instance);

        // Payload-ready events only fire for platform-managed payloads, so
        // mark the record running now and let the poller correct us.
        self.publish_waited(&id, VmEventKind::RunIssued).await;
        self.spawn_poller(&id);

        info!(name = %record.name, vm_name = %vm_name, "VM running");
        Ok(())
    }

    /// Stop a running VM: graceful close first, forced stop when the host
    /// version cannot close gracefully. Either way the handle is removed and
    /// the record transitions to stopped.
    pub async fn stop(&self, id: &str) -> Result<(), EngineError> {
        let instance = self
            .running_instance(id)
            .ok_or_else(|| EngineError::VmNotFound(id.to_string()))?;

        if let Err(close_err) = instance.shutdown().await {
            debug!(id, error = %close_err, "graceful close unavailable, forcing stop");
            if let Err(e) = instance.force_stop().await {
                warn!(id, error = %e, "forced stop failed as well");
            }
        }

        self.publish_waited(id, VmEventKind::StopObserved).await;
        info!(id, "VM stopped");
        Ok(())
    }

    /// Delete a VM: stop it if running, drop the platform's state for the
    /// mapped name, and clear all engine-side entries for the id. The record
    /// itself belongs to the store's caller.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        if self.is_running(id) {
            let _ = self.stop(id).await;
        }

        let name = self.shared.names.lock().unwrap().get(id).cloned();
        if let Some(name) = name {
            match self.shared.platform.delete(&name).await {
                Ok(()) => {}
                Err(PlatformError::NotFound(_)) => {
                    debug!(id, name = %name, "platform had no instance under this name");
                }
                Err(e) => warn!(id, name = %name, error = %e, "platform delete failed"),
            }
        }

        self.publish_waited(id, VmEventKind::Deleted).await;
        info!(id, "VM deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Another id currently holding `vm_name` while live.
    fn live_name_holder(&self, vm_name: &str, id: &str) -> Option<String> {
        let names = self.shared.names.lock().unwrap();
        let running = self.shared.running.lock().unwrap();
        names
            .iter()
            .find(|(other, name)| other.as_str() != id && name.as_str() == vm_name && running.contains_key(*other))
            .map(|(other, _)| other.clone())
    }

    async fn publish_waited(&self, id: &str, kind: VmEventKind) {
        let (tx, rx) = oneshot::channel();
        let sent = self.shared.events.send(VmEvent {
            id: id.to_string(),
            kind,
            ack: Some(tx),
        });
        if sent.is_ok() {
            let _ = rx.await;
        }
    }

    fn spawn_poller(&self, id: &str) {
        let mut pollers = self.shared.pollers.lock().unwrap();
        if let Some(old) = pollers.remove(id) {
            old.abort();
        }
        let handle = tokio::spawn(poll_status(self.shared.clone(), id.to_string()));
        pollers.insert(id.to_string(), handle);
    }
}

// ---------------------------------------------------------------------------
// Start guard
// ---------------------------------------------------------------------------

struct StartGuard {
    shared: Arc<EngineShared>,
    id: String,
}

impl StartGuard {
    fn acquire(shared: &Arc<EngineShared>, id: &str) -> Option<Self> {
        if !shared.starts.lock().unwrap().insert(id.to_string()) {
            return None;
        }
        Some(Self {
            shared: shared.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        self.shared.starts.lock().unwrap().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Lifecycle-event listener
// ---------------------------------------------------------------------------

/// Concrete listener registered on every instance; one value per VM. All it
/// does is forward platform events into the engine's channel.
struct EngineListener {
    id: String,
    events: mpsc::UnboundedSender<VmEvent>,
}

impl EngineListener {
    fn publish(&self, kind: VmEventKind) {
        let _ = self.events.send(VmEvent {
            id: self.id.clone(),
            kind,
            ack: None,
        });
    }
}

impl LifecycleListener for EngineListener {
    fn on_payload_started(&self) {
        self.publish(VmEventKind::PayloadStarted);
    }

    fn on_payload_ready(&self) {
        self.publish(VmEventKind::PayloadReady);
    }

    fn on_payload_finished(&self, exit_code: i32) {
        self.publish(VmEventKind::PayloadFinished { exit_code });
    }

    fn on_error(&self, code: i32, message: &str) {
        self.publish(VmEventKind::Fault {
            message: format!("error {code}: {message}"),
        });
    }

    fn on_stopped(&self) {
        self.publish(VmEventKind::StopObserved);
    }
}

// ---------------------------------------------------------------------------
// Status poller
// ---------------------------------------------------------------------------

/// Safety-net poll loop for one running VM. Exits as soon as the id leaves
/// the running set.
async fn poll_status(shared: Arc<EngineShared>, id: String) {
    loop {
        tokio::time::sleep(shared.poll_interval).await;

        let instance = shared.running.lock().unwrap().get(&id).cloned();
        let Some(instance) = instance else {
            debug!(id, "poller exiting, VM no longer running");
            return;
        };

        match instance.status().await {
            Ok(InstanceStatus::Running) => {}
            Ok(status) => {
                info!(id, ?status, "poll observed VM no longer running");
                let _ = shared.events.send(VmEvent {
                    id: id.clone(),
                    kind: VmEventKind::StopObserved,
                    ack: None,
                });
            }
            Err(e) => debug!(id, error = %e, "status poll failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event consumer
// ---------------------------------------------------------------------------

/// The single writer of status state. Applies each event to the per-VM
/// machine, then persists and signals — so the in-memory map and the store
/// can only disagree for the duration of one persist call.
async fn run_event_loop(shared: Arc<EngineShared>, mut rx: mpsc::UnboundedReceiver<VmEvent>) {
    while let Some(event) = rx.recv().await {
        apply_event(&shared, event).await;
    }
}

async fn apply_event(shared: &Arc<EngineShared>, event: VmEvent) {
    let VmEvent { id, kind, ack } = event;

    if matches!(kind, VmEventKind::Deleted) {
        shared.statuses.lock().unwrap().remove(&id);
        shared.machines.lock().unwrap().remove(&id);
        shared.names.lock().unwrap().remove(&id);
        shared.last_errors.lock().unwrap().remove(&id);
        shared.running.lock().unwrap().remove(&id);
        if let Some(poller) = shared.pollers.lock().unwrap().remove(&id) {
            poller.abort();
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        return;
    }

    if let VmEventKind::Fault { message } = &kind {
        shared
            .last_errors
            .lock()
            .unwrap()
            .insert(id.clone(), message.clone());
    }

    let machine_event = match &kind {
        VmEventKind::StartRequested => LifecycleEvent::StartRequested,
        VmEventKind::RunIssued => LifecycleEvent::RunIssued,
        VmEventKind::PayloadStarted => LifecycleEvent::PayloadStarted,
        VmEventKind::PayloadReady => LifecycleEvent::PayloadReady,
        VmEventKind::PayloadFinished { exit_code } => LifecycleEvent::PayloadFinished {
            exit_code: *exit_code,
        },
        VmEventKind::Fault { .. } => LifecycleEvent::Fault,
        VmEventKind::StopObserved => LifecycleEvent::StopObserved,
        VmEventKind::Deleted => unreachable!("handled above"),
    };

    let (old, new) = {
        let mut machines = shared.machines.lock().unwrap();
        let machine = machines
            .entry(id.clone())
            .or_insert_with(|| VmLifecycle::machine(id.clone()));
        let old = status_of(machine.state());
        machine.handle(&machine_event);
        (old, status_of(machine.state()))
    };

    if new != old {
        debug!(id, %old, %new, "status transition");
        shared.statuses.lock().unwrap().insert(id.clone(), new);

        // Terminal transitions drop the handle; the poller notices on its
        // next tick and exits.
        if matches!(new, VmStatus::Stopped | VmStatus::Error) {
            shared.running.lock().unwrap().remove(&id);
        }

        persist_status(shared, &id, old, new).await;
    }

    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

/// Write the new status through to the record store and fire the
/// service-signal sink. Signal failures are the sink's problem.
async fn persist_status(shared: &Arc<EngineShared>, id: &str, old: VmStatus, new: VmStatus) {
    let record = match shared.store.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!(id, "no record for status persist");
            return;
        }
        Err(e) => {
            warn!(id, error = %e, "record lookup failed during status persist");
            return;
        }
    };

    let mut updated = record.clone();
    updated.status = new;
    if new == VmStatus::Running && old == VmStatus::Starting {
        updated.last_started_at = Some(Utc::now());
    }
    if let Err(e) = shared.store.update(updated).await {
        warn!(id, error = %e, "failed to persist VM status");
    }

    match new {
        VmStatus::Running => shared.signals.vm_started(id, &record.name),
        VmStatus::Stopped => shared.signals.vm_stopped(&record.name),
        _ => {}
    }
}
