//! Core data model: VM records and the engine error taxonomy.
//!
//! `VmRecord` is owned by the record store (`crate::store`); the lifecycle
//! engine only reads it and writes status transitions back. Everything here
//! is plain data with serde derives so the store can persist records as JSON.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Guest OS selection
// ---------------------------------------------------------------------------

/// Guest operating system family selected for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Debian,
    Ubuntu,
    Alpine,
    Fedora,
    Arch,
    Custom,
}

impl OsType {
    /// Human-readable label for listings.
    pub fn label(self) -> &'static str {
        match self {
            OsType::Debian => "Debian",
            OsType::Ubuntu => "Ubuntu",
            OsType::Alpine => "Alpine",
            OsType::Fedora => "Fedora",
            OsType::Arch => "Arch",
            OsType::Custom => "Custom",
        }
    }

    /// Identifier used when asking the platform for native guest support.
    /// `Custom` has no identifier — custom VMs always boot a user image.
    pub fn identifier(self) -> Option<&'static str> {
        match self {
            OsType::Debian => Some("debian"),
            OsType::Ubuntu => Some("ubuntu"),
            OsType::Alpine => Some("alpine"),
            OsType::Fedora => Some("fedora"),
            OsType::Arch => Some("arch"),
            OsType::Custom => None,
        }
    }

    pub fn is_debian_based(self) -> bool {
        matches!(self, OsType::Debian | OsType::Ubuntu)
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debian" => Ok(OsType::Debian),
            "ubuntu" => Ok(OsType::Ubuntu),
            "alpine" => Ok(OsType::Alpine),
            "fedora" => Ok(OsType::Fedora),
            "arch" => Ok(OsType::Arch),
            "custom" => Ok(OsType::Custom),
            other => Err(format!("unknown OS type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle status
// ---------------------------------------------------------------------------

/// Observed lifecycle status of a VM record.
///
/// Valid transitions: `Stopped → Starting → Running → {Stopped, Error}`,
/// `Error → Starting` (retry) and `Running → Stopped`. The transition table
/// itself lives in `crate::vm::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// VM record
// ---------------------------------------------------------------------------

/// A user-defined virtual machine, as persisted by the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// Stable identifier; the engine keys all runtime state by this.
    pub id: String,
    pub name: String,
    pub os_type: OsType,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
    pub networking_enabled: bool,
    pub status: VmStatus,
    pub created_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    /// User-supplied bootable disk image; required for `OsType::Custom`,
    /// optional otherwise.
    pub image_path: Option<PathBuf>,
    /// Explicit guest kernel. When unset, the platform supplies its own
    /// default bootloader.
    pub kernel_path: Option<PathBuf>,
}

impl VmRecord {
    /// Create a new record with defaults matching a small interactive guest.
    pub fn new(name: impl Into<String>, os_type: OsType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            os_type,
            cpu_cores: 2,
            memory_mb: 2048,
            disk_size_gb: 16,
            networking_enabled: true,
            status: VmStatus::Stopped,
            created_at: Utc::now(),
            last_started_at: None,
            image_path: None,
            kernel_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Failures surfaced by the lifecycle engine and the privilege escalator.
///
/// Internal multi-strategy fallbacks (config build, permission grant, disk
/// attachment) retry silently; only the final, most specific failure is
/// carried here. Session-level conditions (connection lost, discovery
/// timeout) surface as output-log lines instead, never as an `EngineError`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The host has no reachable virtualization manager. Permanent.
    #[error("virtualization is not available on this host")]
    CapabilityUnavailable,

    /// No platform configuration could be produced for the record.
    /// Recoverable: the user can change the OS or image selection and retry.
    #[error("failed to build VM configuration: {0}")]
    ConfigBuildFailure(String),

    /// The privileged broker could not grant a required permission.
    #[error("permission {permission} denied: {detail}")]
    PrivilegeDenied { permission: String, detail: String },

    /// A platform call failed after every available fallback was tried.
    #[error("platform call failed: {0}")]
    PlatformInvocationFailure(String),

    /// The caller addressed a VM that is not in the running set.
    #[error("VM {0} is not running")]
    VmNotFound(String),

    /// A start was issued for an id that is already starting or running.
    #[error("VM {0} is already starting or running")]
    AlreadyRunning(String),
}
