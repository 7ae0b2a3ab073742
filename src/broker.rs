//! Privilege escalation through the external privileged broker.
//!
//! The calling process does not hold the permissions the virtualization
//! service demands; a separate broker process does, reachable only over a
//! Unix socket (wire format in `crate::protocol`). This module maintains
//! that connection in a background task and exposes the grant operations.
//!
//! `PermissionState` is mutated exclusively by broker-delivered events —
//! connection established, connection lost, grant result — never directly
//! by callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::EngineError;
use crate::protocol::{
    ERROR_UNKNOWN_OP, Event, Incoming, Reply, Request, RequestOp, parse_incoming,
};

/// Permissions the engine needs before it can drive the platform. The first
/// entry is the mandatory one; the second unlocks custom-image VMs.
pub const REQUIRED_PERMISSIONS: &[&str] = &["virt.manage", "virt.custom-image"];

/// Brokers older than this cannot answer permission queries at all.
pub const MIN_BROKER_API: u32 = 11;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Liveness and grant state, as last reported by the broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionState {
    pub binder_alive: bool,
    pub permission_granted: bool,
}

// ---------------------------------------------------------------------------
// Call plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CallError {
    /// No live broker connection.
    Down,
    /// The broker did not answer within the call timeout.
    Timeout,
    /// The broker answered with an error.
    Rejected { kind: String, message: String },
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Down => f.write_str("broker connection is down"),
            CallError::Timeout => f.write_str("broker call timed out"),
            CallError::Rejected { kind, message } => write!(f, "broker rejected call ({kind}): {message}"),
        }
    }
}

impl CallError {
    fn is_unknown_op(&self) -> bool {
        matches!(self, CallError::Rejected { kind, .. } if kind == ERROR_UNKNOWN_OP)
    }
}

// ---------------------------------------------------------------------------
// Escalator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PrivilegeEscalator {
    shared: Arc<BrokerShared>,
}

struct BrokerShared {
    socket_path: PathBuf,
    state: RwLock<PermissionState>,
    api_version: AtomicU32,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PrivilegeEscalator {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                socket_path,
                state: RwLock::new(PermissionState::default()),
                api_version: AtomicU32::new(0),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Start the connection supervisor and attempt the initial liveness
    /// probe. Call once at startup; listeners registered here are torn down
    /// by [`shutdown`](Self::shutdown), never anywhere else, so events are
    /// delivered exactly once.
    pub fn initialize(&self) {
        let mut supervisor = self.shared.supervisor.lock().unwrap();
        if supervisor.is_some() {
            debug!("broker supervisor already running");
            return;
        }
        let escalator = self.clone();
        *supervisor = Some(tokio::spawn(async move {
            escalator.supervise().await;
        }));
    }

    /// Tear down the connection and stop event delivery.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.shared.supervisor.lock().unwrap().take() {
            handle.abort();
        }
        *self.shared.writer.lock().await = None;
        self.shared.pending.lock().unwrap().clear();
        *self.shared.state.write().unwrap() = PermissionState::default();
    }

    pub fn state(&self) -> PermissionState {
        *self.shared.state.read().unwrap()
    }

    pub fn api_version(&self) -> u32 {
        self.shared.api_version.load(Ordering::Relaxed)
    }

    /// Whether the broker is installed on this host at all.
    pub fn is_installed(&self) -> bool {
        self.shared.socket_path.exists()
    }

    /// Liveness check: either the supervised connection is up, or a
    /// transient connect succeeds.
    pub async fn is_running(&self) -> bool {
        if self.state().binder_alive {
            return true;
        }
        matches!(
            tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(&self.shared.socket_path)).await,
            Ok(Ok(_))
        )
    }

    /// Query whether the mandatory permission is currently granted, and
    /// refresh the state flag. Brokers below the minimum API version cannot
    /// answer and report not-granted.
    pub async fn check_permission(&self) -> bool {
        let granted = if self.api_version() < MIN_BROKER_API {
            false
        } else {
            match self
                .call(RequestOp::PermissionCheck {
                    permission: REQUIRED_PERMISSIONS[0].to_string(),
                })
                .await
            {
                Ok(Some(data)) => data
                    .get("granted")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                Ok(None) => false,
                Err(e) => {
                    debug!(error = %e, "permission check failed");
                    false
                }
            }
        };
        self.shared.state.write().unwrap().permission_granted = granted;
        granted
    }

    /// Ask the broker to prompt for the mandatory permission. The outcome
    /// arrives as a `grant-result` event, not as a return value.
    pub fn request_permission(&self) {
        if self.api_version() < MIN_BROKER_API {
            debug!("broker too old to handle permission requests");
            return;
        }
        let escalator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = escalator
                .call(RequestOp::PermissionRequest {
                    permission: REQUIRED_PERMISSIONS[0].to_string(),
                })
                .await
            {
                debug!(error = %e, "permission request not delivered");
            }
        });
    }

    /// Grant every required permission, walking the per-permission fallback
    /// chain: modern protocol call, legacy protocol call, then a shell
    /// command through the broker's process-spawn capability.
    ///
    /// The overall result is success as long as strictly fewer than all
    /// permissions failed.
    pub async fn grant_required_permissions(&self) -> Result<(), EngineError> {
        let mut failures: Vec<(String, String)> = Vec::new();

        for permission in REQUIRED_PERMISSIONS {
            if let Err(detail) = self.grant_single(permission).await {
                warn!(permission, detail, "permission grant failed");
                failures.push((permission.to_string(), detail));
            } else {
                info!(permission, "permission granted");
            }
        }

        if failures.len() < REQUIRED_PERMISSIONS.len() {
            self.check_permission().await;
            Ok(())
        } else {
            let detail = failures
                .iter()
                .map(|(permission, detail)| format!("{permission}: {detail}"))
                .collect::<Vec<_>>()
                .join("\n");
            Err(EngineError::PrivilegeDenied {
                permission: failures[0].0.clone(),
                detail,
            })
        }
    }

    async fn grant_single(&self, permission: &str) -> Result<(), String> {
        // Strategy 1: modern protocol call.
        match self
            .call(RequestOp::PermissionGrant {
                permission: permission.to_string(),
            })
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => debug!(permission, error = %e, "modern grant path unavailable"),
        }

        // Strategy 2: legacy package-manager call.
        match self
            .call(RequestOp::PmGrant {
                permission: permission.to_string(),
            })
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => debug!(permission, error = %e, "legacy grant path unavailable"),
        }

        // Strategy 3: shell command through the broker's spawn capability.
        // Broker builds disagree on the op name; an unknown op falls through
        // to the next spelling, anything else ends the chain.
        let argv = vec![
            "permctl".to_string(),
            "grant".to_string(),
            permission.to_string(),
        ];
        for op in [
            RequestOp::ProcessSpawn { argv: argv.clone() },
            RequestOp::ProcessSpawn2 { argv: argv.clone() },
        ] {
            match self.call(op).await {
                Ok(data) => {
                    let exit_code = data
                        .as_ref()
                        .and_then(|d| d.get("exit_code"))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(-1);
                    if exit_code == 0 {
                        return Ok(());
                    }
                    let stderr = data
                        .as_ref()
                        .and_then(|d| d.get("stderr"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    return Err(format!("permctl grant exit {exit_code}: {stderr}"));
                }
                Err(e) if e.is_unknown_op() => {
                    debug!(permission, error = %e, "spawn op not available in this broker");
                    continue;
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        Err("no spawn op available in this broker version".to_string())
    }

    // -----------------------------------------------------------------------
    // Wire plumbing
    // -----------------------------------------------------------------------

    async fn call(&self, op: RequestOp) -> Result<Option<serde_json::Value>, CallError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id, tx);

        let line = {
            let mut json = serde_json::to_string(&Request { id, op }).expect("request serialises");
            json.push('\n');
            json
        };

        {
            let mut writer = self.shared.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(CallError::Down);
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(CallError::Down);
            }
        }

        let reply = match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(CallError::Down),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(CallError::Timeout);
            }
        };

        if reply.ok {
            Ok(reply.data)
        } else {
            let (kind, message) = reply
                .error
                .map(|e| (e.kind, e.message))
                .unwrap_or_else(|| ("internal".to_string(), "unspecified broker error".into()));
            Err(CallError::Rejected { kind, message })
        }
    }

    /// Reconnecting connection loop. Runs until aborted by `shutdown`.
    async fn supervise(&self) {
        loop {
            match UnixStream::connect(&self.shared.socket_path).await {
                Ok(stream) => {
                    debug!(path = %self.shared.socket_path.display(), "broker socket connected");
                    let (read_half, write_half) = stream.into_split();
                    *self.shared.writer.lock().await = Some(write_half);

                    self.read_loop(read_half).await;

                    // Connection lost: flags drop, in-flight calls fail.
                    info!("broker connection lost");
                    *self.shared.writer.lock().await = None;
                    self.shared.pending.lock().unwrap().clear();
                    *self.shared.state.write().unwrap() = PermissionState::default();
                }
                Err(e) => {
                    debug!(path = %self.shared.socket_path.display(), error = %e, "broker not reachable");
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn read_loop(&self, read_half: OwnedReadHalf) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_incoming(&line) {
                    Some(Incoming::Reply(reply)) => {
                        if let Some(tx) = self.shared.pending.lock().unwrap().remove(&reply.id) {
                            let _ = tx.send(reply);
                        }
                    }
                    Some(Incoming::Event(event)) => self.handle_event(event),
                    None => debug!(line, "unparseable broker line dropped"),
                },
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "broker read error");
                    return;
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Connected { api_version } => {
                info!(api_version, "broker connection established");
                self.shared
                    .api_version
                    .store(api_version, Ordering::Relaxed);
                self.shared.state.write().unwrap().binder_alive = true;

                // Refresh the grant flag now that the broker is back.
                let escalator = self.clone();
                tokio::spawn(async move {
                    escalator.check_permission().await;
                });
            }
            Event::GrantResult {
                permission,
                granted,
                detail,
            } => {
                info!(permission, granted, ?detail, "grant result received");
                self.shared.state.write().unwrap().permission_granted = granted;
            }
        }
    }
}
