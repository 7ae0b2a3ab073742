//! Builds a platform configuration descriptor from a VM record.
//!
//! Two strategies, tried in order, first success wins:
//!
//! 1. **Named OS** — the record's OS type is one the platform supports
//!    natively; the descriptor just references the identifier.
//! 2. **Custom image** — the record carries a user-supplied bootable disk
//!    image; the host provides its own bootloader unless an explicit kernel
//!    is set, and the seed disk is attached read-only when present.
//!
//! Cross-cutting descriptor settings (memory, console capture, CPU
//! topology) are applied before strategy dispatch, each gated on the host's
//! feature set — a missing capability is a normal, debug-logged outcome.
//! The protected-mode flag is the exception: it must always be set
//! explicitly, so a host that cannot accept it fails the build outright.

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::VmRecord;
use crate::paths::HostPaths;
use crate::platform::{CpuTopology, PayloadSource, PlatformConfig, VirtPlatform};

#[derive(Debug, Error)]
#[error("{reason}")]
pub struct BuildError {
    pub reason: String,
}

pub async fn build(
    platform: &dyn VirtPlatform,
    paths: &HostPaths,
    record: &VmRecord,
) -> Result<PlatformConfig, BuildError> {
    let features = platform.features();

    // -----------------------------------------------------------------------
    // Cross-cutting settings
    // -----------------------------------------------------------------------

    let memory_bytes = if features.memory_limit {
        Some(record.memory_mb * 1024 * 1024)
    } else {
        debug!("host cannot cap instance memory; leaving it unbounded");
        None
    };

    let console_capture = features.console_capture;
    if !console_capture {
        debug!("console capture unavailable; sessions will use the network transport");
    }

    let cpu = if features.cpu_match_host {
        CpuTopology::MatchHost
    } else {
        CpuTopology::Cores(record.cpu_cores)
    };

    // Must be declared explicitly on every descriptor; a host that cannot
    // take the flag cannot build at all.
    if !features.protected_flag {
        return Err(BuildError {
            reason: "host cannot accept an explicit protected-mode flag".into(),
        });
    }
    let protected = false;

    let assemble = |payload: PayloadSource| PlatformConfig {
        memory_bytes,
        console_capture,
        cpu,
        protected,
        payload,
    };

    // -----------------------------------------------------------------------
    // Strategy 1: named OS
    // -----------------------------------------------------------------------

    if let Some(identifier) = record.os_type.identifier() {
        match platform.supported_guest_os_list().await {
            Ok(list) => {
                if list.iter().any(|s| s == identifier) {
                    debug!(os = identifier, "using native guest support");
                    return Ok(assemble(PayloadSource::NamedOs {
                        os: identifier.to_string(),
                    }));
                }
                debug!(os = identifier, "no native support for this guest");
            }
            Err(e) => {
                // Fall through to the custom-image strategy rather than
                // erroring here.
                warn!(os = identifier, error = %e, "guest catalog query failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Strategy 2: custom image
    // -----------------------------------------------------------------------

    if let Some(image) = &record.image_path {
        if !image.exists() {
            warn!(image = %image.display(), "configured disk image does not exist");
        } else if record.kernel_path.as_ref().is_some_and(|k| !k.exists()) {
            warn!("configured kernel path does not exist");
        } else {
            let seed = paths.seed_iso();
            let seed = if seed.exists() {
                debug!(seed = %seed.display(), "attaching seed disk read-only");
                Some(seed)
            } else {
                None
            };
            return Ok(assemble(PayloadSource::CustomImage {
                image: image.clone(),
                // No explicit kernel means the host supplies its own default
                // bootloader.
                kernel: record.kernel_path.clone(),
                seed,
                networking: record.networking_enabled,
            }));
        }
    }

    // -----------------------------------------------------------------------
    // Neither strategy produced a descriptor
    // -----------------------------------------------------------------------

    // Reaching this point with no image means the named-OS strategy did not
    // fire either, so the host has no native support for the selection.
    let reason = if record.image_path.is_none() {
        "no bootable disk image selected and the host has no native guest support; \
         an EFI-bootable raw disk image is required"
            .to_string()
    } else {
        "failed to build a VM configuration; check the OS selection, image and kernel paths"
            .to_string()
    };
    Err(BuildError { reason })
}
