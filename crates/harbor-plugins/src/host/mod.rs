//! Host orchestrator
//!
//! [`PluginHost`] is the public surface of the runtime. [`HostRuntime`] implements
//! it directly; the decorators in [`crate::decorators`] wrap any host behind the
//! same trait.

mod loaded;
mod runtime;

pub use loaded::{LoadedPlugin, PluginSummary};
pub use runtime::{HostBuilder, HostRuntime};

use crate::descriptor::PluginDescriptor;
use crate::discovery::{DiscoveryIssue, DiscoveryReport};
use crate::health::HealthSnapshot;
use crate::permissions::AuditRecord;
use crate::validation::Rejection;
use crate::{PluginError, PluginResult};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What to load: a manifest locator or an already built descriptor
#[derive(Debug, Clone)]
pub enum PluginSource {
    Manifest(PathBuf),
    Descriptor(PluginDescriptor),
}

impl From<PluginDescriptor> for PluginSource {
    fn from(descriptor: PluginDescriptor) -> Self {
        Self::Descriptor(descriptor)
    }
}

impl From<PathBuf> for PluginSource {
    fn from(path: PathBuf) -> Self {
        Self::Manifest(path)
    }
}

impl From<&Path> for PluginSource {
    fn from(path: &Path) -> Self {
        Self::Manifest(path.to_path_buf())
    }
}

/// A plugin that failed to load in a batch
#[derive(Debug, Clone, Serialize)]
pub struct PluginFailure {
    pub plugin_id: String,
    pub code: &'static str,
    pub phase: &'static str,
    pub message: String,
    #[serde(skip)]
    pub error: PluginError,
}

impl PluginFailure {
    pub fn new(plugin_id: impl Into<String>, error: PluginError) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            code: error.code(),
            phase: error.phase(),
            message: error.to_string(),
            error,
        }
    }
}

/// Outcome of a batch load
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Dependency order computed for the admitted descriptors
    pub order: Vec<String>,
    /// Plugins now Running, in completion order
    pub loaded: Vec<String>,
    pub failures: Vec<PluginFailure>,
    /// Descriptors excluded by the validator pipeline
    pub rejected: Vec<Rejection>,
    /// Plugins not started because the batch was cancelled
    pub cancelled: Vec<String>,
    /// Plugins not attempted because a required dependency did not load
    pub skipped: Vec<String>,
    pub discovery_issues: Vec<DiscoveryIssue>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
            && self.rejected.is_empty()
            && self.cancelled.is_empty()
            && self.skipped.is_empty()
            && self.discovery_issues.is_empty()
    }

    pub fn failure(&self, plugin_id: &str) -> Option<&PluginFailure> {
        self.failures.iter().find(|f| f.plugin_id == plugin_id)
    }
}

/// Plugin host operations
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Scan a directory for plugin manifests
    async fn discover(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> PluginResult<DiscoveryReport>;

    /// Validate, order and load a batch of descriptors
    ///
    /// Graph-level errors (missing required dependency, version mismatch,
    /// duplicate id, cycle) fail the whole batch before anything loads.
    async fn load_discovered(
        &self,
        descriptors: Vec<PluginDescriptor>,
        cancel: &CancellationToken,
    ) -> PluginResult<LoadReport>;

    async fn discover_and_load(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> PluginResult<LoadReport> {
        let discovery = self.discover(dir, cancel).await?;
        let mut report = self.load_discovered(discovery.descriptors, cancel).await?;
        report.discovery_issues = discovery.issues;
        Ok(report)
    }

    /// Load one plugin; returns the running instance if the id is already loaded
    async fn load_plugin(
        &self,
        source: PluginSource,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>>;

    /// Unload a plugin; `Ok(false)` when it was not loaded
    async fn unload_plugin(&self, id: &str, cancel: &CancellationToken) -> PluginResult<bool>;

    /// Unload and load again from the same source
    async fn reload_plugin(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>>;

    /// Unload everything, dependents first; returns the unloaded ids in order
    async fn unload_all(&self, cancel: &CancellationToken) -> PluginResult<Vec<String>>;

    /// Resolve a service from the host registry
    fn get_service<T: Send + Sync + 'static>(&self) -> PluginResult<Arc<T>>
    where
        Self: Sized;

    async fn plugin(&self, id: &str) -> Option<Arc<LoadedPlugin>>;

    /// Ids of loaded plugins, sorted
    async fn loaded_ids(&self) -> Vec<String>;

    /// Counter bumped by every unload and reload
    fn lifecycle_generation(&self) -> u64;

    /// Drop invalid module cache entries; returns the purged artifact paths
    fn sweep_module_cache(&self) -> Vec<PathBuf>;

    fn audit_log(&self) -> Vec<AuditRecord>;

    fn health_snapshot(&self) -> HealthSnapshot;
}
