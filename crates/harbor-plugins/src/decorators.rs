//! Host decorators
//!
//! Both wrap any [`PluginHost`] and expose the same trait, so callers can stack
//! them: `CachingHost<ConcurrencyLimitedHost<HostRuntime>>`.

use crate::descriptor::{PluginDescriptor, normalize_path};
use crate::discovery::DiscoveryReport;
use crate::health::HealthSnapshot;
use crate::host::{HostRuntime, LoadReport, LoadedPlugin, PluginHost, PluginSource};
use crate::permissions::AuditRecord;
use crate::{PluginError, PluginResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounds the number of lifecycle operations running at once
pub struct ConcurrencyLimitedHost<H> {
    inner: Arc<H>,
    permits: Semaphore,
    limit: usize,
}

impl<H: PluginHost> ConcurrencyLimitedHost<H> {
    pub fn new(inner: Arc<H>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner,
            permits: Semaphore::new(limit),
            limit,
        }
    }

    pub fn inner(&self) -> &Arc<H> {
        &self.inner
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a permit; cancellation while waiting fails with `Cancelled`
    async fn acquire(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> PluginResult<SemaphorePermit<'_>> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PluginError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| PluginError::Cancelled)?,
        };
        debug!(
            operation,
            available = self.permits.available_permits(),
            "Acquired host operation permit"
        );
        Ok(permit)
    }
}

impl ConcurrencyLimitedHost<HostRuntime> {
    /// Limit taken from `loading.max_concurrent_operations`
    pub fn from_runtime(host: Arc<HostRuntime>) -> Self {
        let limit = host.config().loading.max_concurrent_operations;
        Self::new(host, limit)
    }
}

#[async_trait]
impl<H: PluginHost> PluginHost for ConcurrencyLimitedHost<H> {
    async fn discover(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> PluginResult<DiscoveryReport> {
        self.inner.discover(dir, cancel).await
    }

    async fn load_discovered(
        &self,
        descriptors: Vec<PluginDescriptor>,
        cancel: &CancellationToken,
    ) -> PluginResult<LoadReport> {
        let _permit = self.acquire("load_discovered", cancel).await?;
        self.inner.load_discovered(descriptors, cancel).await
    }

    async fn load_plugin(
        &self,
        source: PluginSource,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        let _permit = self.acquire("load_plugin", cancel).await?;
        self.inner.load_plugin(source, cancel).await
    }

    async fn unload_plugin(&self, id: &str, cancel: &CancellationToken) -> PluginResult<bool> {
        let _permit = self.acquire("unload_plugin", cancel).await?;
        self.inner.unload_plugin(id, cancel).await
    }

    async fn reload_plugin(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        let _permit = self.acquire("reload_plugin", cancel).await?;
        self.inner.reload_plugin(id, cancel).await
    }

    async fn unload_all(&self, cancel: &CancellationToken) -> PluginResult<Vec<String>> {
        let _permit = self.acquire("unload_all", cancel).await?;
        self.inner.unload_all(cancel).await
    }

    fn get_service<T: Send + Sync + 'static>(&self) -> PluginResult<Arc<T>> {
        self.inner.get_service::<T>()
    }

    async fn plugin(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        self.inner.plugin(id).await
    }

    async fn loaded_ids(&self) -> Vec<String> {
        self.inner.loaded_ids().await
    }

    fn lifecycle_generation(&self) -> u64 {
        self.inner.lifecycle_generation()
    }

    fn sweep_module_cache(&self) -> Vec<PathBuf> {
        self.inner.sweep_module_cache()
    }

    fn audit_log(&self) -> Vec<AuditRecord> {
        self.inner.audit_log()
    }

    fn health_snapshot(&self) -> HealthSnapshot {
        self.inner.health_snapshot()
    }
}

struct CachedDiscovery {
    report: DiscoveryReport,
    cached_at: Instant,
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoizes discovery results per directory
///
/// An entry is served while it is younger than the TTL and the inner host's
/// lifecycle generation has not moved since it was stored.
pub struct CachingHost<H> {
    inner: Arc<H>,
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, CachedDiscovery>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<H: PluginHost> CachingHost<H> {
    pub fn new(inner: Arc<H>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<H> {
        &self.inner
    }

    /// Drop every cached discovery result
    pub fn invalidate(&self) {
        let dropped = {
            let mut entries = self.entries.lock();
            let dropped = entries.len();
            entries.clear();
            dropped
        };
        debug!(dropped, "Discovery cache invalidated");
    }

    /// Drop the cached result for one directory
    pub fn invalidate_dir(&self, dir: &Path) -> bool {
        self.entries.lock().remove(&normalize_path(dir)).is_some()
    }

    pub fn stats(&self) -> DiscoveryCacheStats {
        DiscoveryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    fn cached(&self, key: &Path) -> Option<DiscoveryReport> {
        let generation = self.inner.lifecycle_generation();
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.generation == generation && entry.cached_at.elapsed() < self.ttl {
            return Some(entry.report.clone());
        }
        entries.remove(key);
        None
    }
}

impl CachingHost<HostRuntime> {
    /// TTL taken from `cache.discovery_ttl_secs`
    pub fn from_runtime(host: Arc<HostRuntime>) -> Self {
        let ttl = host.config().cache.discovery_ttl();
        Self::new(host, ttl)
    }
}

#[async_trait]
impl<H: PluginHost> PluginHost for CachingHost<H> {
    async fn discover(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> PluginResult<DiscoveryReport> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        let key = normalize_path(dir);
        if let Some(report) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(dir = %key.display(), plugins = report.descriptors.len(), "Discovery cache hit");
            return Ok(report);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        // Generation read before the scan so a concurrent unload invalidates the entry
        let generation = self.inner.lifecycle_generation();
        let report = self.inner.discover(dir, cancel).await?;
        self.entries.lock().insert(
            key,
            CachedDiscovery {
                report: report.clone(),
                cached_at: Instant::now(),
                generation,
            },
        );
        Ok(report)
    }

    async fn load_discovered(
        &self,
        descriptors: Vec<PluginDescriptor>,
        cancel: &CancellationToken,
    ) -> PluginResult<LoadReport> {
        self.inner.load_discovered(descriptors, cancel).await
    }

    async fn load_plugin(
        &self,
        source: PluginSource,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        self.inner.load_plugin(source, cancel).await
    }

    async fn unload_plugin(&self, id: &str, cancel: &CancellationToken) -> PluginResult<bool> {
        self.inner.unload_plugin(id, cancel).await
    }

    async fn reload_plugin(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        self.inner.reload_plugin(id, cancel).await
    }

    async fn unload_all(&self, cancel: &CancellationToken) -> PluginResult<Vec<String>> {
        self.inner.unload_all(cancel).await
    }

    fn get_service<T: Send + Sync + 'static>(&self) -> PluginResult<Arc<T>> {
        self.inner.get_service::<T>()
    }

    async fn plugin(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        self.inner.plugin(id).await
    }

    async fn loaded_ids(&self) -> Vec<String> {
        self.inner.loaded_ids().await
    }

    fn lifecycle_generation(&self) -> u64 {
        self.inner.lifecycle_generation()
    }

    fn sweep_module_cache(&self) -> Vec<PathBuf> {
        self.inner.sweep_module_cache()
    }

    fn audit_log(&self) -> Vec<AuditRecord> {
        self.inner.audit_log()
    }

    fn health_snapshot(&self) -> HealthSnapshot {
        self.inner.health_snapshot()
    }
}
