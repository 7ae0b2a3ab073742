//! Fire-and-forget service signals emitted on VM start/stop transitions.
//!
//! Consumers (system notifications, foreground services) hang off this
//! narrow interface; delivery failures are their problem, never the
//! engine's.

use tracing::info;

pub trait ServiceSignals: Send + Sync {
    fn vm_started(&self, id: &str, name: &str);
    fn vm_stopped(&self, name: &str);
}

/// Default sink: just logs the signal.
pub struct LogSignals;

impl ServiceSignals for LogSignals {
    fn vm_started(&self, id: &str, name: &str) {
        info!(id, name, "VM started");
    }

    fn vm_stopped(&self, name: &str) {
        info!(name, "VM stopped");
    }
}
