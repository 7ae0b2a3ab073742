//! Production platform adapter: drives VM instances through an external
//! virtualization helper binary (vfkit).
//!
//! One helper process per instance. The adapter probes the helper version
//! once at construction and derives a [`PlatformFeatures`] set from it —
//! everything the running version cannot do surfaces as
//! `PlatformError::Unsupported` so callers can walk their fallback chains.
//!
//! ```text
//! HelperPlatform::create(name, config)
//!     └─► vms/<name>/ state dir + command line
//!             └─► HelperInstance::run()  →  tokio::process helper child
//!                     ├─► exit-watch task   (try_wait every 2 s → listener)
//!                     ├─► status()          (GET /vm/state on the REST port)
//!                     └─► shutdown()        (PUT /vm/state {"state":"Stop"})
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{
    ConsoleReader, ConsoleWriter, CpuTopology, InstanceStatus, LifecycleListener, PayloadSource,
    PlatformConfig, PlatformError, PlatformFeatures, PlatformResult, VirtPlatform, VmInstance,
};
use crate::config::HostConfig;
use crate::paths::HostPaths;

/// Helper binary the adapter looks for.
const HELPER_BIN: &str = "vfkit";

/// Install locations checked after `$PATH` (Homebrew on Intel and Apple
/// Silicon, distro packages).
const HELPER_LOCATIONS: &[&str] = &[
    "/opt/homebrew/bin/vfkit",
    "/usr/local/bin/vfkit",
    "/usr/bin/vfkit",
];

/// Oldest helper version the adapter will drive at all.
pub const MIN_HELPER_VERSION: (u32, u32) = (0, 2);

// ---------------------------------------------------------------------------
// Version probing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HelperVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Parse the helper's `--version` output, e.g. `vfkit version: 0.6.1`.
pub fn parse_helper_version(output: &str) -> Option<HelperVersion> {
    for token in output.split_whitespace() {
        let token = token.trim_start_matches('v');
        let mut parts = token.split('.');
        let (Some(major), Some(minor)) = (parts.next(), parts.next()) else {
            continue;
        };
        let patch = parts.next().unwrap_or("0");
        if let (Ok(major), Ok(minor), Ok(patch)) = (major.parse(), minor.parse(), patch.parse()) {
            return Some(HelperVersion {
                major,
                minor,
                patch,
            });
        }
    }
    None
}

/// Capability set for a given helper version. Later versions grew the REST
/// state endpoint, host-matched CPU topology and the guest catalog; older
/// ones only know how to boot and be killed.
pub fn features_for(version: HelperVersion) -> PlatformFeatures {
    let at_least = |major, minor| version >= HelperVersion { major, minor, patch: 0 };
    PlatformFeatures {
        memory_limit: true,
        console_capture: true,
        cpu_match_host: at_least(0, 4),
        protected_flag: true,
        graceful_shutdown: at_least(0, 3),
        os_catalog: at_least(0, 6),
        supports_protected_vm: false,
        supports_non_protected_vm: true,
    }
}

// ---------------------------------------------------------------------------
// Command-line generation
// ---------------------------------------------------------------------------

/// Disk/boot layout after the payload source has been resolved against the
/// local guest catalog.
#[derive(Debug, Clone)]
pub struct ResolvedDisks {
    pub primary: PathBuf,
    pub kernel: Option<PathBuf>,
    pub seed: Option<PathBuf>,
    pub networking: bool,
}

/// Build the helper command line for one instance.
///
/// `rest_port` is `None` on helper versions without the REST state endpoint.
pub fn build_helper_args(
    config: &PlatformConfig,
    disks: &ResolvedDisks,
    state_dir: &Path,
    rest_port: Option<u16>,
) -> Vec<String> {
    let mut args = Vec::new();

    // Bootloader: explicit kernel when the user supplied one, otherwise the
    // helper's EFI firmware boots the primary disk directly.
    match &disks.kernel {
        Some(kernel) => {
            args.push("--bootloader".into());
            args.push(format!(
                "linux,kernel={},cmdline=console=hvc0 root=/dev/vda rw",
                kernel.display()
            ));
        }
        None => {
            args.push("--bootloader".into());
            args.push(format!(
                "efi,variable-store={},create",
                state_dir.join("efi-vars.fd").display()
            ));
        }
    }

    if let CpuTopology::Cores(cores) = config.cpu {
        args.push("--cpus".into());
        args.push(cores.to_string());
    }

    if let Some(bytes) = config.memory_bytes {
        args.push("--memory".into());
        args.push((bytes / (1024 * 1024)).to_string());
    }

    args.push("--device".into());
    args.push(format!("virtio-blk,path={}", disks.primary.display()));

    if let Some(seed) = &disks.seed {
        args.push("--device".into());
        args.push(format!("virtio-blk,path={},readonly", seed.display()));
    }

    if disks.networking {
        args.push("--device".into());
        args.push("virtio-net,nat".into());
    }

    if config.console_capture {
        args.push("--device".into());
        args.push("virtio-serial,stdio".into());
    }

    // Entropy device (required for kernel RNG).
    args.push("--device".into());
    args.push("virtio-rng".into());

    if let Some(port) = rest_port {
        args.push("--restful-uri".into());
        args.push(format!("tcp://localhost:{port}"));
    }

    args
}

fn map_helper_state(state: &str) -> InstanceStatus {
    match state {
        s if s.ends_with("Stopped") => InstanceStatus::Stopped,
        s if s.ends_with("Deleted") => InstanceStatus::Deleted,
        _ => InstanceStatus::Running,
    }
}

// ---------------------------------------------------------------------------
// Platform manager
// ---------------------------------------------------------------------------

pub struct HelperPlatform {
    binary: Option<PathBuf>,
    version: Option<HelperVersion>,
    features: PlatformFeatures,
    vms_dir: PathBuf,
    guests_dir: PathBuf,
}

impl HelperPlatform {
    /// Locate and version-probe the helper once. Absence of the helper is a
    /// normal outcome — the adapter then reports no manager handle and every
    /// instance call fails with `Unsupported`.
    pub async fn detect(paths: &HostPaths, config: &HostConfig) -> Self {
        let binary = config
            .helper_path
            .clone()
            .filter(|p| p.exists())
            .or_else(find_helper);

        let version = match &binary {
            Some(binary) => probe_version(binary).await,
            None => None,
        };

        match (&binary, version) {
            (Some(binary), Some(version)) => {
                info!(path = %binary.display(), ?version, "virtualization helper found");
            }
            (Some(binary), None) => {
                warn!(path = %binary.display(), "helper did not report a parseable version");
            }
            (None, _) => debug!("no virtualization helper on this host"),
        }

        let features = version.map(features_for).unwrap_or_default();
        Self {
            binary,
            version,
            features,
            vms_dir: paths.vms.clone(),
            guests_dir: paths.guests.clone(),
        }
    }

    fn require_binary(&self) -> PlatformResult<&PathBuf> {
        self.binary
            .as_ref()
            .filter(|_| self.version.is_some())
            .ok_or(PlatformError::Unsupported("virtualization helper"))
    }

    /// Map the payload source onto concrete disks.
    fn resolve_disks(&self, payload: &PayloadSource) -> PlatformResult<ResolvedDisks> {
        match payload {
            PayloadSource::NamedOs { os } => {
                let disk = self.guests_dir.join(os).join("disk.img");
                if !disk.exists() {
                    return Err(PlatformError::Invocation(format!(
                        "bundled guest image for {os} is missing ({})",
                        disk.display()
                    )));
                }
                Ok(ResolvedDisks {
                    primary: disk,
                    kernel: None,
                    seed: None,
                    networking: true,
                })
            }
            PayloadSource::CustomImage {
                image,
                kernel,
                seed,
                networking,
            } => Ok(ResolvedDisks {
                primary: image.clone(),
                kernel: kernel.clone(),
                seed: seed.clone(),
                networking: *networking,
            }),
        }
    }
}

#[async_trait]
impl VirtPlatform for HelperPlatform {
    fn api_version(&self) -> u32 {
        self.version
            .map(|v| v.major * 100 + v.minor)
            .unwrap_or(0)
    }

    fn manager_available(&self) -> bool {
        self.binary.is_some() && self.version.is_some()
    }

    fn features(&self) -> PlatformFeatures {
        self.features
    }

    async fn supported_guest_os_list(&self) -> PlatformResult<Vec<String>> {
        self.require_binary()?;
        if !self.features.os_catalog {
            return Err(PlatformError::Unsupported("guest OS catalog"));
        }
        let mut list = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.guests_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(list),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.join("disk.img").exists() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    list.push(name.to_string());
                }
            }
        }
        list.sort();
        Ok(list)
    }

    async fn create(
        &self,
        name: &str,
        config: &PlatformConfig,
    ) -> PlatformResult<Arc<dyn VmInstance>> {
        let binary = self.require_binary()?.clone();

        if config.protected && !self.features.supports_protected_vm {
            return Err(PlatformError::Invocation(
                "this helper cannot run protected VMs".into(),
            ));
        }

        let disks = self.resolve_disks(&config.payload)?;

        let state_dir = self.vms_dir.join(name);
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| PlatformError::Invocation(format!("creating instance state dir: {e}")))?;

        let rest_port = if self.features.graceful_shutdown {
            Some(allocate_local_port()?)
        } else {
            None
        };

        let args = build_helper_args(config, &disks, &state_dir, rest_port);

        // Persist the descriptor so a stale instance is inspectable after a
        // crash, and so delete() has something to find.
        let meta = serde_json::json!({
            "name": name,
            "rest_port": rest_port,
            "config": config,
        });
        tokio::fs::write(
            state_dir.join("instance.json"),
            serde_json::to_vec_pretty(&meta).expect("instance metadata serialises"),
        )
        .await
        .map_err(|e| PlatformError::Invocation(format!("writing instance metadata: {e}")))?;

        debug!(name, ?rest_port, "instance created");

        Ok(Arc::new(HelperInstance {
            name: name.to_string(),
            binary,
            args,
            rest_port,
            console_capture: config.console_capture,
            graceful: self.features.graceful_shutdown,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client build failed"),
            child: Arc::new(RwLock::new(None)),
            console_out: Mutex::new(None),
            console_in: Mutex::new(None),
            listener: Arc::new(Mutex::new(None)),
        }))
    }

    async fn delete(&self, name: &str) -> PlatformResult<()> {
        let dir = self.vms_dir.join(name);
        if !dir.exists() {
            return Err(PlatformError::NotFound(name.to_string()));
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| PlatformError::Invocation(format!("removing instance state: {e}")))?;
        info!(name, "instance state deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

type SharedListener = Arc<Mutex<Option<Arc<dyn LifecycleListener>>>>;

pub struct HelperInstance {
    name: String,
    binary: PathBuf,
    args: Vec<String>,
    rest_port: Option<u16>,
    console_capture: bool,
    graceful: bool,
    http: reqwest::Client,
    child: Arc<RwLock<Option<Child>>>,
    console_out: Mutex<Option<ConsoleReader>>,
    console_in: Mutex<Option<ConsoleWriter>>,
    listener: SharedListener,
}

impl HelperInstance {
    fn state_url(&self) -> Option<String> {
        self.rest_port
            .map(|port| format!("http://localhost:{port}/vm/state"))
    }
}

#[async_trait]
impl VmInstance for HelperInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_listener(&self, listener: Arc<dyn LifecycleListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn run(&self) -> PlatformResult<()> {
        let mut guard = self.child.write().await;
        if guard.is_some() {
            return Err(PlatformError::Invocation(
                "instance is already running".into(),
            ));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);
        if self.console_capture {
            cmd.stdin(std::process::Stdio::piped());
            cmd.stdout(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
            cmd.stdout(std::process::Stdio::null());
        }
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| PlatformError::Invocation(format!("failed to spawn helper: {e}")))?;

        if self.console_capture {
            *self.console_out.lock().unwrap() = child
                .stdout
                .take()
                .map(|out| Box::new(out) as ConsoleReader);
            *self.console_in.lock().unwrap() = child
                .stdin
                .take()
                .map(|stdin| Box::new(stdin) as ConsoleWriter);
        }

        info!(name = %self.name, "helper process spawned");
        *guard = Some(child);
        drop(guard);

        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_payload_started();
        }

        tokio::spawn(watch_exit(
            self.name.clone(),
            self.child.clone(),
            self.listener.clone(),
        ));

        Ok(())
    }

    async fn shutdown(&self) -> PlatformResult<()> {
        if !self.graceful {
            return Err(PlatformError::Unsupported("graceful shutdown"));
        }
        let url = self
            .state_url()
            .ok_or(PlatformError::Unsupported("graceful shutdown"))?;

        self.http
            .put(&url)
            .json(&serde_json::json!({"state": "Stop"}))
            .send()
            .await
            .map_err(|e| PlatformError::Invocation(format!("stop request failed: {e}")))?;

        // Wait for the process to exit (up to 30 s), then give up and kill.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            {
                let mut guard = self.child.write().await;
                match guard.as_mut() {
                    None => return Ok(()),
                    Some(proc) => match proc.try_wait() {
                        Ok(Some(status)) => {
                            info!(name = %self.name, exit_status = ?status, "helper exited");
                            *guard = None;
                            return Ok(());
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(name = %self.name, error = %e, "error waiting for helper");
                            *guard = None;
                            return Err(PlatformError::Invocation(e.to_string()));
                        }
                    },
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(name = %self.name, "helper did not exit within 30 s — killing");
                if let Some(proc) = self.child.write().await.as_mut() {
                    let _ = proc.kill().await;
                }
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn force_stop(&self) -> PlatformResult<()> {
        let mut guard = self.child.write().await;
        if let Some(proc) = guard.as_mut() {
            proc.kill()
                .await
                .map_err(|e| PlatformError::Invocation(format!("kill failed: {e}")))?;
            *guard = None;
        }
        Ok(())
    }

    async fn status(&self) -> PlatformResult<InstanceStatus> {
        {
            let mut guard = self.child.write().await;
            match guard.as_mut() {
                None => return Ok(InstanceStatus::Stopped),
                Some(proc) => {
                    if let Ok(Some(_)) = proc.try_wait() {
                        return Ok(InstanceStatus::Stopped);
                    }
                }
            }
        }

        let Some(url) = self.state_url() else {
            // No state endpoint on this helper version; a live process is
            // the best signal available.
            return Ok(InstanceStatus::Running);
        };

        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let state = body.get("state").and_then(|s| s.as_str()).unwrap_or("");
                Ok(map_helper_state(state))
            }
            Ok(resp) => Err(PlatformError::Invocation(format!(
                "state query returned HTTP {}",
                resp.status().as_u16()
            ))),
            Err(e) => {
                // The guest may still be booting its REST endpoint.
                debug!(name = %self.name, error = %e, "state query failed, assuming running");
                Ok(InstanceStatus::Running)
            }
        }
    }

    async fn console_output(&self) -> PlatformResult<ConsoleReader> {
        if !self.console_capture {
            return Err(PlatformError::Unsupported("console capture"));
        }
        self.console_out
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PlatformError::Invocation("console output pipe unavailable".into()))
    }

    async fn console_input(&self) -> PlatformResult<ConsoleWriter> {
        if !self.console_capture {
            return Err(PlatformError::Unsupported("console capture"));
        }
        self.console_in
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PlatformError::Invocation("console input pipe unavailable".into()))
    }
}

/// Poll `try_wait` until the helper process exits, then tell the listener.
async fn watch_exit(name: String, child: Arc<RwLock<Option<Child>>>, listener: SharedListener) {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;

        let exit_code = {
            let mut guard = child.write().await;
            let Some(proc) = guard.as_mut() else { return };
            match proc.try_wait() {
                Ok(Some(status)) => {
                    *guard = None;
                    Some(status.code().unwrap_or(-1))
                }
                Ok(None) => None,
                Err(e) => {
                    error!(name, error = %e, "try_wait error in exit watch");
                    None
                }
            }
        };

        if let Some(code) = exit_code {
            info!(name, code, "helper process exited");
            let listener = listener.lock().unwrap().clone();
            if let Some(listener) = listener {
                if code == 0 {
                    listener.on_stopped();
                } else {
                    listener.on_error(code, "helper process exited unexpectedly");
                }
            }
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Host probing helpers
// ---------------------------------------------------------------------------

/// Resolve the helper binary, honouring `$PATH` first.
fn find_helper() -> Option<PathBuf> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join(HELPER_BIN);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    HELPER_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

async fn probe_version(binary: &Path) -> Option<HelperVersion> {
    let output = Command::new(binary).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    parse_helper_version(&String::from_utf8_lossy(&output.stdout))
}

/// Grab a free localhost port for the instance's REST endpoint.
fn allocate_local_port() -> PlatformResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| PlatformError::Invocation(format!("allocating REST port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| PlatformError::Invocation(format!("allocating REST port: {e}")))?
        .port();
    Ok(port)
}
