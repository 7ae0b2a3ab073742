//! Host virtualization capability probing.
//!
//! Three independent signals make up the verdict: a kernel feature flag, a
//! hardware acceleration device node, and a reachable platform manager
//! handle. Any one of them marks the host as supported; the probe itself is
//! stateless and free of side effects beyond the reads.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::broker::PrivilegeEscalator;
use crate::platform::{PlatformError, VirtPlatform};

/// Default marker for kernel-level virtualization support.
const FEATURE_FLAG_PATH: &str = "/sys/module/kvm";

/// Hardware acceleration device node.
const ACCEL_DEVICE_PATH: &str = "/dev/kvm";

/// Oldest platform API version the engine drives.
pub const MIN_API_VERSION: u32 = 2;

/// Snapshot of what the host can do. Cached by the permission coordinator,
/// explicitly refreshable.
#[derive(Debug, Clone, Default)]
pub struct CapabilityStatus {
    pub is_supported: bool,
    pub has_hardware_accel: bool,
    pub has_native_feature_flag: bool,
    pub has_manager_handle: bool,
    pub supports_protected: bool,
    pub supports_non_protected: bool,
    pub failure_reason: Option<String>,
}

pub struct CapabilityProbe {
    platform: Arc<dyn VirtPlatform>,
    feature_flag_path: PathBuf,
    accel_device_path: PathBuf,
}

impl CapabilityProbe {
    pub fn new(platform: Arc<dyn VirtPlatform>) -> Self {
        Self {
            platform,
            feature_flag_path: PathBuf::from(FEATURE_FLAG_PATH),
            accel_device_path: PathBuf::from(ACCEL_DEVICE_PATH),
        }
    }

    /// Override the probed host paths. Tests point these at scratch files.
    pub fn with_probe_paths(mut self, feature_flag: PathBuf, accel_device: PathBuf) -> Self {
        self.feature_flag_path = feature_flag;
        self.accel_device_path = accel_device;
        self
    }

    /// Run the full probe.
    pub fn probe(&self) -> CapabilityStatus {
        let has_native_feature_flag = self.feature_flag_path.exists();
        let has_hardware_accel = self.accel_device_path.exists();
        let has_manager_handle = self.platform.manager_available();

        let features = self.platform.features();
        let is_supported = has_native_feature_flag || has_hardware_accel || has_manager_handle;

        let api_version = self.platform.api_version();
        let failure_reason = if has_manager_handle && api_version < MIN_API_VERSION {
            Some(format!(
                "host virtualization API v{api_version} is below the required v{MIN_API_VERSION}"
            ))
        } else if !is_supported {
            Some("this host does not support virtualization".to_string())
        } else {
            None
        };

        debug!(
            has_native_feature_flag,
            has_hardware_accel, has_manager_handle, "capability probe complete"
        );

        CapabilityStatus {
            is_supported,
            has_hardware_accel,
            has_native_feature_flag,
            has_manager_handle,
            supports_protected: features.supports_protected_vm,
            supports_non_protected: features.supports_non_protected_vm,
            failure_reason,
        }
    }

    /// Guest OS identifiers the platform supports natively. An unsupported
    /// catalog query is an empty list, not an error.
    pub async fn supported_guest_os_list(&self) -> Vec<String> {
        match self.platform.supported_guest_os_list().await {
            Ok(list) => list,
            Err(PlatformError::Unsupported(what)) => {
                debug!(what, "guest catalog query unavailable on this host");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "guest catalog query failed");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Setup-stage coordination
// ---------------------------------------------------------------------------

/// Where the user is in the privilege setup sequence. Stages are ordered:
/// the first unmet prerequisite wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Unsupported,
    BrokerNotInstalled,
    BrokerNotRunning,
    PermissionRequired,
    Granted,
}

/// Caches the capability probe and folds the broker state into a single
/// user-facing setup stage.
pub struct PermissionCoordinator {
    probe: CapabilityProbe,
    escalator: Arc<PrivilegeEscalator>,
    cached: Mutex<Option<CapabilityStatus>>,
}

impl PermissionCoordinator {
    pub fn new(probe: CapabilityProbe, escalator: Arc<PrivilegeEscalator>) -> Self {
        Self {
            probe,
            escalator,
            cached: Mutex::new(None),
        }
    }

    /// Cached capability status, probing on first use.
    pub fn capability(&self) -> CapabilityStatus {
        let mut cached = self.cached.lock().unwrap();
        cached.get_or_insert_with(|| self.probe.probe()).clone()
    }

    pub async fn supported_guest_os_list(&self) -> Vec<String> {
        self.probe.supported_guest_os_list().await
    }

    /// Re-probe everything and compute the current setup stage.
    pub async fn refresh_stage(&self) -> SetupStage {
        let status = self.probe.probe();
        let supported = status.is_supported;
        *self.cached.lock().unwrap() = Some(status);

        if !supported {
            return SetupStage::Unsupported;
        }
        if !self.escalator.is_installed() {
            return SetupStage::BrokerNotInstalled;
        }
        if !self.escalator.is_running().await {
            return SetupStage::BrokerNotRunning;
        }
        if !self.escalator.check_permission().await {
            return SetupStage::PermissionRequired;
        }
        SetupStage::Granted
    }
}
