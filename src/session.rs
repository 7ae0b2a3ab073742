//! Interactive session bridge to a running VM.
//!
//! Connection order: the **console transport** first — byte pipes to the
//! instance's serial console, available only when the VM was built with
//! console capture. If the output pipe is missing, or input is missing even
//! though output is there, the bridge falls back to the **network
//! transport**: discover the guest's address on the tap subnet, then open
//! an SSH shell with the guest-provisioned key.
//!
//! ```text
//! connect()
//!   └─► session task
//!         ├─ console pipes?  ──yes─► console read loop (line-delimited)
//!         └─ no: discovery every 3 s (≤20 attempts)
//!                  └─► ssh child ─► network read loop (raw bytes,
//!                                   50 ms idle flush of partial lines)
//! ```
//!
//! All output lands in a bounded FIFO log (1000 lines, oldest evicted).
//! Transport write failures become log lines, never errors. Disconnection
//! drops the session to `None` mode and stays there — no auto-reconnect.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::discovery;
use crate::paths::HostPaths;
use crate::platform::ConsoleReader;
use crate::vm::VmEngine;

/// Output log capacity; the oldest line is evicted beyond this.
pub const MAX_LOG_LINES: usize = 1000;

/// Shared SSH options. Guest host keys change on every fresh image boot, so
/// strict checking and known-hosts tracking are off; BatchMode fails fast
/// instead of prompting.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
];

/// Raw byte sequences for interactive control input. Sent with
/// [`SessionBridge::send_raw_bytes`], bypassing line semantics.
pub mod control {
    pub const INTERRUPT: &[u8] = &[0x03];
    pub const EOF: &[u8] = &[0x04];
    pub const SUSPEND: &[u8] = &[0x1a];
    pub const ESCAPE: &[u8] = &[0x1b];
    pub const ARROW_UP: &[u8] = b"\x1b[A";
    pub const ARROW_DOWN: &[u8] = b"\x1b[B";
    pub const ARROW_RIGHT: &[u8] = b"\x1b[C";
    pub const ARROW_LEFT: &[u8] = b"\x1b[D";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    #[default]
    None,
    Console,
    Network,
}

/// Session timing knobs. Tests shrink these; production uses the defaults.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub idle_flush: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(3),
            max_retries: 20,
            idle_flush: Duration::from_millis(50),
        }
    }
}

// ---------------------------------------------------------------------------
// Output log
// ---------------------------------------------------------------------------

/// Bounded FIFO of output lines.
pub struct OutputLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn append(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Line accumulation for the raw-byte network transport
// ---------------------------------------------------------------------------

/// Accumulates raw bytes into lines: emit on `\n`, drop `\r`. The holder
/// flushes the pending partial line via [`take_partial`](Self::take_partial)
/// when the stream goes idle, so prompts without a trailing newline still
/// show up.
#[derive(Default)]
pub struct LineAccumulator {
    partial: Vec<u8>,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' => {
                    let raw = std::mem::take(&mut self.partial);
                    lines.push(String::from_utf8_lossy(&raw).into_owned());
                }
                b'\r' => {}
                _ => self.partial.push(byte),
            }
        }
        lines
    }

    pub fn take_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.partial);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Session bridge
// ---------------------------------------------------------------------------

enum SessionInput {
    None,
    Console(crate::platform::ConsoleWriter),
    Network {
        stdin: ChildStdin,
        // Held so the ssh child dies with the session (kill_on_drop).
        _child: Child,
    },
}

struct SessionShared {
    engine: VmEngine,
    vm_id: String,
    ssh_user: String,
    tap_prefix: String,
    key_path: PathBuf,
    tuning: SessionTuning,

    mode: Mutex<ConnectionMode>,
    log: Mutex<OutputLog>,
    guest_addr: Mutex<Option<Ipv4Addr>>,
    input: tokio::sync::Mutex<SessionInput>,
    reader: Mutex<Option<JoinHandle<()>>>,
    line_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SessionShared {
    fn append(&self, line: impl Into<String>) {
        let line = line.into();
        if let Some(tx) = self.line_tx.lock().unwrap().as_ref() {
            let _ = tx.send(line.clone());
        }
        self.log.lock().unwrap().append(line);
    }

    fn set_mode(&self, mode: ConnectionMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

pub struct SessionBridge {
    shared: Arc<SessionShared>,
}

impl SessionBridge {
    pub fn new(engine: VmEngine, vm_id: String, config: &HostConfig, paths: &HostPaths) -> Self {
        Self::with_tuning(engine, vm_id, config, paths, SessionTuning::default())
    }

    pub fn with_tuning(
        engine: VmEngine,
        vm_id: String,
        config: &HostConfig,
        paths: &HostPaths,
        tuning: SessionTuning,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                engine,
                vm_id,
                ssh_user: config.ssh_user.clone(),
                tap_prefix: config.tap_prefix.clone(),
                key_path: paths.guest_key(),
                tuning,
                mode: Mutex::new(ConnectionMode::None),
                log: Mutex::new(OutputLog::new(MAX_LOG_LINES)),
                guest_addr: Mutex::new(None),
                input: tokio::sync::Mutex::new(SessionInput::None),
                reader: Mutex::new(None),
                line_tx: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.shared.mode.lock().unwrap()
    }

    pub fn guest_addr(&self) -> Option<Ipv4Addr> {
        *self.shared.guest_addr.lock().unwrap()
    }

    pub fn log_snapshot(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().snapshot()
    }

    /// Receive every output line as it is appended. One subscriber at a
    /// time; subscribing again replaces the previous receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.line_tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Open the session in the background: console transport first, network
    /// fallback. Console is always retried first, even if a previous
    /// connect on this record ended up on the network transport.
    pub fn connect(&self) {
        let mut reader = self.shared.reader.lock().unwrap();
        if let Some(old) = reader.take() {
            old.abort();
        }
        let shared = self.shared.clone();
        *reader = Some(tokio::spawn(run_session(shared)));
    }

    /// Tear the session down: cancel the read loop and release the console
    /// pipes or SSH child.
    pub async fn disconnect(&self) {
        if let Some(task) = self.shared.reader.lock().unwrap().take() {
            task.abort();
        }
        *self.shared.input.lock().await = SessionInput::None;
        self.shared.set_mode(ConnectionMode::None);
    }

    /// Send a command line to the active transport. A trailing newline is
    /// appended. Failures are reported as output lines, not errors.
    pub async fn send(&self, text: &str) {
        let mut payload = text.as_bytes().to_vec();
        payload.push(b'\n');
        self.write_bytes(&payload).await;
    }

    /// Send raw bytes, bypassing line semantics — control characters and
    /// ANSI sequences (see [`control`]).
    pub async fn send_raw_bytes(&self, bytes: &[u8]) {
        self.write_bytes(bytes).await;
    }

    async fn write_bytes(&self, bytes: &[u8]) {
        let mut input = self.shared.input.lock().await;
        let result = match &mut *input {
            SessionInput::None => {
                self.shared.append("[not connected]");
                return;
            }
            SessionInput::Console(writer) => async {
                writer.write_all(bytes).await?;
                writer.flush().await
            }
            .await,
            SessionInput::Network { stdin, .. } => async {
                stdin.write_all(bytes).await?;
                stdin.flush().await
            }
            .await,
        };
        if let Err(e) = result {
            self.shared.append(format!("[send failed: {e}]"));
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

async fn run_session(shared: Arc<SessionShared>) {
    match console_attach(&shared).await {
        Some(output) => console_read_loop(&shared, output).await,
        None => {
            shared.append("[console not available on this host, connecting over the network...]");
            if let Some(stdout) = network_attach(&shared).await {
                network_read_loop(&shared, stdout).await;
            }
        }
    }

    *shared.input.lock().await = SessionInput::None;
    shared.set_mode(ConnectionMode::None);
}

/// Claim the console pipes. Output without input is not interactively
/// usable, so that case also falls through to the network transport.
async fn console_attach(shared: &Arc<SessionShared>) -> Option<ConsoleReader> {
    let output = shared.engine.console_output(&shared.vm_id).await?;

    let Some(input) = shared.engine.console_input(&shared.vm_id).await else {
        debug!(id = %shared.vm_id, "console output present but input missing");
        drop(output);
        return None;
    };

    *shared.input.lock().await = SessionInput::Console(input);
    shared.set_mode(ConnectionMode::Console);
    shared.append("[connected to VM console]");
    Some(output)
}

async fn console_read_loop(shared: &Arc<SessionShared>, output: ConsoleReader) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => shared.append(line),
            Ok(None) => {
                shared.append("[console closed]");
                return;
            }
            Err(e) => {
                shared.append(format!("[connection lost: {e}]"));
                return;
            }
        }
    }
}

/// Discover the guest and open an SSH shell, retrying on an interval until
/// the attempt budget runs out.
async fn network_attach(shared: &Arc<SessionShared>) -> Option<tokio::process::ChildStdout> {
    let max_retries = shared.tuning.max_retries;
    let mut last_addr = None;

    for attempt in 1..=max_retries {
        match discovery::discover_guest_address(&shared.tap_prefix).await {
            Some(addr) => {
                if last_addr != Some(addr) {
                    *shared.guest_addr.lock().unwrap() = Some(addr);
                    shared.append(format!("[VM address: {addr}]"));
                    last_addr = Some(addr);
                }

                match open_ssh(shared, addr).await {
                    Ok((child, stdin, stdout)) => {
                        *shared.input.lock().await = SessionInput::Network {
                            stdin,
                            _child: child,
                        };
                        shared.set_mode(ConnectionMode::Network);
                        shared.append(format!("[connected via SSH to {addr}]"));
                        info!(id = %shared.vm_id, %addr, "network session established");
                        return Some(stdout);
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "SSH attempt failed");
                        if attempt < max_retries {
                            shared.append(format!("[SSH connecting... (attempt {attempt})]"));
                        }
                    }
                }
            }
            None => {
                if attempt == 1 {
                    shared.append("[waiting for VM network...]");
                } else if attempt % 5 == 0 {
                    shared.append(format!("[still waiting for VM network... (attempt {attempt})]"));
                }
            }
        }

        tokio::time::sleep(shared.tuning.retry_delay).await;
    }

    shared.append(format!("[failed to connect after {max_retries} attempts]"));
    match last_addr {
        Some(addr) => shared.append(format!("[VM address {addr} found but SSH never accepted]")),
        None => shared.append("[could not discover the VM address]"),
    }
    None
}

async fn open_ssh(
    shared: &Arc<SessionShared>,
    addr: Ipv4Addr,
) -> anyhow::Result<(Child, ChildStdin, tokio::process::ChildStdout)> {
    let mut cmd = Command::new("ssh");
    cmd.args(SSH_OPTS);
    cmd.arg("-o")
        .arg(format!(
            "ConnectTimeout={}",
            shared.tuning.connect_timeout.as_secs().max(1)
        ));
    cmd.arg("-tt");
    cmd.arg("-i").arg(&shared.key_path);
    cmd.arg(format!("{}@{addr}", shared.ssh_user));
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::null());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;

    // BatchMode makes auth/connect failures exit quickly; give the
    // handshake a moment and treat a surviving child as connected.
    tokio::time::sleep(Duration::from_millis(750)).await;
    if let Some(status) = child.try_wait()? {
        anyhow::bail!("ssh exited during connect ({status})");
    }

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("ssh stdin missing"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("ssh stdout missing"))?;
    Ok((child, stdin, stdout))
}

/// Raw-byte read loop for the network transport. Lines are emitted on
/// `\n`; a pending partial line is flushed once the stream idles so shell
/// prompts stay visible.
async fn network_read_loop(shared: &Arc<SessionShared>, mut stdout: tokio::process::ChildStdout) {
    let mut buf = [0u8; 4096];
    let mut accumulator = LineAccumulator::new();

    loop {
        match tokio::time::timeout(shared.tuning.idle_flush, stdout.read(&mut buf)).await {
            Ok(Ok(0)) => {
                shared.append("[connection closed by guest]");
                return;
            }
            Ok(Ok(n)) => {
                for line in accumulator.push(&buf[..n]) {
                    shared.append(line);
                }
            }
            Ok(Err(e)) => {
                shared.append(format!("[connection lost: {e}]"));
                return;
            }
            Err(_) => {
                if let Some(partial) = accumulator.take_partial() {
                    shared.append(partial);
                }
            }
        }
    }
}
