//! Application directory structure for hyperhost.
//!
//! Provides a single `HostPaths` struct that resolves all standard
//! directories and ensures they exist on first launch:
//!
//! - Config:   `~/.config/hyperhost/`  (human-editable, XDG-style)
//! - Data:     platform data dir (`~/.local/share/hyperhost/` on Linux,
//!   `~/Library/Application Support/…` on macOS)
//! - Logs:     platform log dir
//!
//! Runtime artifacts live under the data dir: per-instance state in `vms/`,
//! the seed/auto-configuration disk and user disk images in `images/`,
//! bundled guest images in `guests/`, the guest SSH key in `keys/`, and the
//! record store in `db/`.

use std::path::{Path, PathBuf};

use tracing::info;

const BUNDLE_ID: &str = "com.hyperhost.hyperhost";
const APP_NAME: &str = "hyperhost";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct HostPaths {
    /// Human-editable config: `~/.config/hyperhost/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Per-instance platform state (one subdirectory per live VM name)
    pub vms: PathBuf,
    /// Seed disk and user-managed disk images
    pub images: PathBuf,
    /// Bundled guest images the platform advertises as natively supported
    pub guests: PathBuf,
    /// Guest-provisioned SSH credentials
    pub keys: PathBuf,
    /// Record store
    pub db: PathBuf,
    /// Regenerable cache data
    pub cache: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl HostPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories — call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let config = resolve_config_dir(&home);
        let data = resolve_data_dir(&home);
        let cache = resolve_cache_dir(&home);
        let logs = resolve_log_dir(&home);

        Some(Self::from_parts(config, data, cache, logs))
    }

    /// Root every directory under `root`. Used by tests and `--data-dir`
    /// overrides; skips the per-platform conventions entirely.
    pub fn rooted(root: &Path) -> Self {
        Self::from_parts(
            root.join("config"),
            root.join("data"),
            root.join("cache"),
            root.join("logs"),
        )
    }

    fn from_parts(config: PathBuf, data: PathBuf, cache: PathBuf, logs: PathBuf) -> Self {
        Self {
            config,
            vms: data.join("vms"),
            images: data.join("images"),
            guests: data.join("guests"),
            keys: data.join("keys"),
            db: data.join("db"),
            data,
            cache,
            logs,
        }
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [
            &self.config,
            &self.data,
            &self.vms,
            &self.images,
            &self.guests,
            &self.keys,
            &self.db,
            &self.cache,
            &self.logs,
        ];

        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        // Exclude large/regenerable directories from Time Machine
        #[cfg(target_os = "macos")]
        {
            let tm_exclude = [&self.vms, &self.images, &self.guests, &self.cache];
            for dir in &tm_exclude {
                exclude_from_time_machine(dir);
            }
        }

        Ok(())
    }

    /// The main config file.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// The record store file.
    pub fn records_db(&self) -> PathBuf {
        self.db.join("records.json")
    }

    /// The seed/auto-configuration disk artifact, attached read-only to
    /// custom-image VMs when present. Carries guest login credentials and
    /// network config consumed at first boot.
    pub fn seed_iso(&self) -> PathBuf {
        self.images.join("seed.iso")
    }

    /// Private key matching the public key the seed disk installs in the
    /// guest. The session bridge authenticates SSH sessions with it.
    pub fn guest_key(&self) -> PathBuf {
        self.keys.join("guest_key")
    }

    /// Per-instance state directory for a platform VM name.
    pub fn vm_state_dir(&self, vm_name: &str) -> PathBuf {
        self.vms.join(vm_name)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Caches").join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".cache").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    use std::process::Command;
    use tracing::warn;
    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {
            info!("TM-excluded: {}", path.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "tmutil addexclusion failed for {}: {}",
                path.display(),
                stderr.trim()
            );
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}
