//! Platform virtualization handle: the host-owned API surface that actually
//! creates and runs guest VMs.
//!
//! The surface is versioned and only partially available depending on the
//! host, so the engine binds to it through these traits. Every call against
//! a capability the running host version lacks returns
//! [`PlatformError::Unsupported`] — a normal outcome, never a crash. One
//! adapter is selected at probe time and used for the life of the process;
//! `helper.rs` implements the production adapter over an external helper
//! binary, tests supply their own fakes.

pub mod helper;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use helper::HelperPlatform;

// ---------------------------------------------------------------------------
// Errors and shared types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The capability is absent on this host version.
    #[error("not supported by this host version: {0}")]
    Unsupported(&'static str),

    /// The platform has no instance under the given name.
    #[error("no VM instance named {0}")]
    NotFound(String),

    /// The call reached the platform and failed there.
    #[error("{0}")]
    Invocation(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Byte pipes to a running instance's serial console.
pub type ConsoleReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ConsoleWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Instance status as reported by the platform's own query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Stopped,
    Running,
    Deleted,
}

/// What the selected adapter can do on this host version. Queried once at
/// probe time; the config builder consults it before emitting each
/// cross-cutting descriptor setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformFeatures {
    /// Explicit memory cap can be set on a descriptor.
    pub memory_limit: bool,
    /// Serial console capture (required for the console transport).
    pub console_capture: bool,
    /// CPU topology can be matched to the host instead of a fixed count.
    pub cpu_match_host: bool,
    /// The protected-mode flag is accepted on descriptors.
    pub protected_flag: bool,
    /// Instances accept a graceful close, not just a forced kill.
    pub graceful_shutdown: bool,
    /// The platform can enumerate natively supported guest OS identifiers.
    pub os_catalog: bool,
    /// Protected VMs can actually run.
    pub supports_protected_vm: bool,
    /// Non-protected VMs can actually run.
    pub supports_non_protected_vm: bool,
}

// ---------------------------------------------------------------------------
// Configuration descriptor
// ---------------------------------------------------------------------------

/// CPU topology requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuTopology {
    /// Let the platform mirror the host topology.
    MatchHost,
    /// Explicit virtual core count.
    Cores(u32),
}

/// What the instance boots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadSource {
    /// A guest the platform supports natively, addressed by identifier.
    NamedOs { os: String },
    /// A user-supplied bootable disk image.
    CustomImage {
        /// Primary read-write disk.
        image: PathBuf,
        /// Explicit kernel; `None` lets the host provide its own default
        /// bootloader.
        kernel: Option<PathBuf>,
        /// Seed/auto-configuration disk, attached read-only.
        seed: Option<PathBuf>,
        networking: bool,
    },
}

/// Fully built platform configuration descriptor, produced by
/// `crate::vm::builder` and consumed by [`VirtPlatform::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Memory cap in bytes; `None` when the host cannot apply one.
    pub memory_bytes: Option<u64>,
    /// Whether the serial console is captured for interactive sessions.
    pub console_capture: bool,
    pub cpu: CpuTopology,
    /// Always set explicitly; the builder refuses to emit a descriptor
    /// without it.
    pub protected: bool,
    pub payload: PayloadSource,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Receiver for instance lifecycle events. The engine registers one concrete
/// listener per instance; adapters invoke it from their own watch tasks.
pub trait LifecycleListener: Send + Sync {
    fn on_payload_started(&self);
    fn on_payload_ready(&self);
    fn on_payload_finished(&self, exit_code: i32);
    fn on_error(&self, code: i32, message: &str);
    fn on_stopped(&self);
}

/// The platform manager: creates and deletes instances, addressed by name.
#[async_trait]
pub trait VirtPlatform: Send + Sync {
    /// Host API version, `0` when no manager is reachable.
    fn api_version(&self) -> u32;

    /// Whether a manager handle could be obtained at all.
    fn manager_available(&self) -> bool;

    /// Capability set of this host version.
    fn features(&self) -> PlatformFeatures;

    /// Guest OS identifiers the platform supports natively.
    async fn supported_guest_os_list(&self) -> PlatformResult<Vec<String>>;

    /// Create an instance under `name`. The instance is not running until
    /// [`VmInstance::run`] is called.
    async fn create(
        &self,
        name: &str,
        config: &PlatformConfig,
    ) -> PlatformResult<Arc<dyn VmInstance>>;

    /// Delete the platform's state for `name`.
    async fn delete(&self, name: &str) -> PlatformResult<()>;
}

/// A single platform VM instance.
#[async_trait]
pub trait VmInstance: Send + Sync {
    fn name(&self) -> &str;

    /// Register the lifecycle listener. Must be called before `run` so no
    /// event is lost.
    fn set_listener(&self, listener: Arc<dyn LifecycleListener>);

    async fn run(&self) -> PlatformResult<()>;

    /// Graceful close. `Unsupported` on hosts without it.
    async fn shutdown(&self) -> PlatformResult<()>;

    /// Hard stop.
    async fn force_stop(&self) -> PlatformResult<()>;

    async fn status(&self) -> PlatformResult<InstanceStatus>;

    /// Take the console output pipe. Each pipe can be claimed once.
    async fn console_output(&self) -> PlatformResult<ConsoleReader>;

    /// Take the console input pipe.
    async fn console_input(&self) -> PlatformResult<ConsoleWriter>;
}
