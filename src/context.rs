//! Application context: every shared component, constructed once at startup
//! and passed by reference after that. All cross-component state (running
//! VM map, status map, broker flags) lives behind these handles with a
//! single owner each.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::broker::PrivilegeEscalator;
use crate::capability::{CapabilityProbe, PermissionCoordinator};
use crate::config::HostConfig;
use crate::paths::HostPaths;
use crate::platform::{HelperPlatform, VirtPlatform};
use crate::signal::LogSignals;
use crate::store::{JsonFileStore, RecordStore};
use crate::vm::VmEngine;

pub struct HostContext {
    pub paths: HostPaths,
    pub config: HostConfig,
    pub store: Arc<dyn RecordStore>,
    pub platform: Arc<dyn VirtPlatform>,
    pub escalator: Arc<PrivilegeEscalator>,
    pub coordinator: PermissionCoordinator,
    pub engine: VmEngine,
}

impl HostContext {
    /// Build the full context from the standard directories, or from
    /// `data_root` when given.
    pub async fn init(data_root: Option<&Path>) -> Result<Self> {
        let paths = match data_root {
            Some(root) => HostPaths::rooted(root),
            None => HostPaths::resolve().context("HOME is not set")?,
        };
        paths.ensure().context("creating application directories")?;

        let config = HostConfig::load(&paths).await;
        let store: Arc<dyn RecordStore> = Arc::new(JsonFileStore::open(paths.records_db()).await?);
        let platform: Arc<dyn VirtPlatform> =
            Arc::new(HelperPlatform::detect(&paths, &config).await);
        let escalator = Arc::new(PrivilegeEscalator::new(config.broker_socket_path()));
        let coordinator = PermissionCoordinator::new(
            CapabilityProbe::new(platform.clone()),
            escalator.clone(),
        );
        let engine = VmEngine::new(
            platform.clone(),
            store.clone(),
            Arc::new(LogSignals),
            paths.clone(),
        );

        Ok(Self {
            paths,
            config,
            store,
            platform,
            escalator,
            coordinator,
            engine,
        })
    }
}
