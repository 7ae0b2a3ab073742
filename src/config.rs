//! User configuration loaded from `<config_dir>/config.toml`.
//!
//! Every key has a default; an absent config file is a normal first-run
//! state, not an error. A malformed file is logged and ignored so a typo
//! never bricks the tool.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::paths::HostPaths;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Socket path of the privileged broker. Defaults to
    /// `$XDG_RUNTIME_DIR/hyperhost-broker.sock`.
    pub broker_socket: Option<PathBuf>,

    /// Remote user for network sessions into guests.
    pub ssh_user: String,

    /// Name prefix of the virtual tap interface guests attach to.
    pub tap_prefix: String,

    /// Explicit path to the virtualization helper binary, overriding the
    /// PATH search.
    pub helper_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            broker_socket: None,
            ssh_user: "root".to_string(),
            tap_prefix: "vmtap".to_string(),
            helper_path: None,
        }
    }
}

impl HostConfig {
    /// Load the config file, falling back to defaults when it is absent or
    /// unparseable.
    pub async fn load(paths: &HostPaths) -> Self {
        let file = paths.config_file();
        match tokio::fs::read_to_string(&file).await {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "ignoring malformed config file");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %file.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %file.display(), error = %e, "could not read config file");
                Self::default()
            }
        }
    }

    /// Resolve the broker socket path, applying the default when the config
    /// does not override it.
    pub fn broker_socket_path(&self) -> PathBuf {
        if let Some(path) = &self.broker_socket {
            return path.clone();
        }
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            return PathBuf::from(runtime_dir).join("hyperhost-broker.sock");
        }
        PathBuf::from("/tmp/hyperhost-broker.sock")
    }
}
