//! Module and factory caches
//!
//! The module cache only holds weak handles: a module stays resident while a
//! loaded plugin or an isolation unit keeps it alive. Stale entries (timestamp
//! changed, handle dead) are dropped lazily at lookup or by [`ModuleCache::sweep`].

use super::backend::LoadedModule;
use crate::contract::PluginFactory;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tracing::debug;

/// Identity of one loaded copy of a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModuleKey {
    pub path: PathBuf,
    /// Bumped every time the path is loaded afresh
    pub generation: u64,
}

struct ModuleEntry {
    module: Weak<dyn LoadedModule>,
    modified: SystemTime,
    key: ModuleKey,
    isolated: bool,
}

/// A cache hit
pub struct CachedModule {
    pub module: Arc<dyn LoadedModule>,
    pub key: ModuleKey,
}

#[derive(Default)]
pub struct ModuleCache {
    entries: RwLock<HashMap<PathBuf, ModuleEntry>>,
    generation: AtomicU64,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live module for `path` loaded from a file with timestamp `modified`
    pub fn lookup(&self, path: &Path, modified: SystemTime) -> Option<CachedModule> {
        {
            let entries = self.entries.read();
            let entry = entries.get(path)?;
            if entry.modified == modified {
                if let Some(module) = entry.module.upgrade() {
                    debug!(artifact = %path.display(), generation = entry.key.generation, "Module cache hit");
                    return Some(CachedModule {
                        module,
                        key: entry.key.clone(),
                    });
                }
            }
        }

        // Stale: timestamp changed or nothing keeps the module alive
        if self.entries.write().remove(path).is_some() {
            debug!(artifact = %path.display(), "Evicted stale module cache entry");
        }
        None
    }

    /// Cache a freshly loaded module and return its key
    pub fn insert(
        &self,
        path: &Path,
        module: &Arc<dyn LoadedModule>,
        modified: SystemTime,
        isolated: bool,
    ) -> ModuleKey {
        let key = ModuleKey {
            path: path.to_path_buf(),
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        self.entries.write().insert(
            path.to_path_buf(),
            ModuleEntry {
                module: Arc::downgrade(module),
                modified,
                key: key.clone(),
                isolated,
            },
        );
        key
    }

    /// Drop the entry for `path`; returns whether one existed
    pub fn purge(&self, path: &Path) -> bool {
        self.entries.write().remove(path).is_some()
    }

    /// Remove entries whose module is gone or whose file changed or vanished
    pub fn sweep(&self) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        self.entries.write().retain(|path, entry| {
            let current = std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
            let valid = entry.module.strong_count() > 0 && current == Some(entry.modified);
            if !valid {
                removed.push(path.clone());
            }
            valid
        });
        removed.sort();
        removed
    }

    /// Whether the cached module for `path` was loaded into its own isolation unit
    pub fn is_isolated(&self, path: &Path) -> Option<bool> {
        self.entries.read().get(path).map(|entry| entry.isolated)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("entries", &self.len())
            .finish()
    }
}

/// Hit and miss counters of the factory cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FactoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Resolved constructors keyed by module copy and entry type
#[derive(Default)]
pub struct FactoryCache {
    factories: RwLock<HashMap<(ModuleKey, String), PluginFactory>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FactoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached constructor, resolving it from `module` on a miss
    pub fn get_or_resolve(
        &self,
        key: &ModuleKey,
        entry_type: &str,
        module: &dyn LoadedModule,
    ) -> Option<PluginFactory> {
        let cache_key = (key.clone(), entry_type.to_string());
        if let Some(factory) = self.factories.read().get(&cache_key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(Arc::clone(factory));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let factory = module.resolve(entry_type)?;
        self.factories
            .write()
            .entry(cache_key)
            .or_insert_with(|| Arc::clone(&factory));
        Some(factory)
    }

    /// Drop every constructor resolved from modules loaded from `path`
    pub fn purge_path(&self, path: &Path) -> usize {
        let mut factories = self.factories.write();
        let before = factories.len();
        factories.retain(|(key, _), _| key.path != path);
        before - factories.len()
    }

    pub fn stats(&self) -> FactoryCacheStats {
        FactoryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.factories.read().len(),
        }
    }
}

impl std::fmt::Debug for FactoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PluginContext;
    use crate::contract::{FactoryTable, Plugin, PluginRegistrar, factory};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {
        async fn initialize(
            &mut self,
            _ctx: Arc<PluginContext>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Module counting how often it is asked to resolve
    struct CountingModule {
        table: FactoryTable,
        resolves: AtomicUsize,
    }

    impl CountingModule {
        fn new() -> Arc<Self> {
            let mut table = FactoryTable::new();
            table.register("Noop", factory(|| Noop));
            Arc::new(Self {
                table,
                resolves: AtomicUsize::new(0),
            })
        }
    }

    impl LoadedModule for CountingModule {
        fn backend(&self) -> &'static str {
            "test"
        }

        fn entry_types(&self) -> Vec<String> {
            self.table.entry_types()
        }

        fn resolve(&self, entry_type: &str) -> Option<PluginFactory> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            self.table.get(entry_type)
        }
    }

    fn artifact(dir: &TempDir) -> (PathBuf, SystemTime) {
        let path = dir.path().join("noop.plugin");
        std::fs::write(&path, b"module").expect("write");
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .expect("mtime");
        (path, modified)
    }

    #[test]
    fn test_lookup_reuses_live_module() {
        let dir = TempDir::new().expect("temp dir");
        let (path, modified) = artifact(&dir);
        let cache = ModuleCache::new();
        let module: Arc<dyn LoadedModule> = CountingModule::new();

        let key = cache.insert(&path, &module, modified, true);
        let hit = cache.lookup(&path, modified).expect("hit");
        assert!(Arc::ptr_eq(&hit.module, &module));
        assert_eq!(hit.key, key);
        assert_eq!(cache.is_isolated(&path), Some(true));
    }

    #[test]
    fn test_changed_timestamp_evicts() {
        let dir = TempDir::new().expect("temp dir");
        let (path, modified) = artifact(&dir);
        let cache = ModuleCache::new();
        let module: Arc<dyn LoadedModule> = CountingModule::new();
        cache.insert(&path, &module, modified, true);

        assert!(cache.lookup(&path, modified + Duration::from_secs(1)).is_none());
        assert!(cache.is_empty(), "stale entry is discarded");
    }

    #[test]
    fn test_dead_handle_evicts() {
        let dir = TempDir::new().expect("temp dir");
        let (path, modified) = artifact(&dir);
        let cache = ModuleCache::new();
        let module: Arc<dyn LoadedModule> = CountingModule::new();
        cache.insert(&path, &module, modified, false);
        drop(module);

        assert!(cache.lookup(&path, modified).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_sweep_removes_invalid_entries() {
        let dir = TempDir::new().expect("temp dir");
        let (path, modified) = artifact(&dir);
        let missing = dir.path().join("gone.plugin");
        let cache = ModuleCache::new();

        let live: Arc<dyn LoadedModule> = CountingModule::new();
        let orphan: Arc<dyn LoadedModule> = CountingModule::new();
        cache.insert(&path, &live, modified, true);
        cache.insert(&missing, &orphan, modified, true);

        assert_eq!(cache.sweep(), vec![missing]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_generations_increase() {
        let dir = TempDir::new().expect("temp dir");
        let (path, modified) = artifact(&dir);
        let cache = ModuleCache::new();
        let module: Arc<dyn LoadedModule> = CountingModule::new();
        let first = cache.insert(&path, &module, modified, true);
        let second = cache.insert(&path, &module, modified, true);
        assert!(second.generation > first.generation);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn test_factory_cache_resolves_once() {
        let module = CountingModule::new();
        let cache = FactoryCache::new();
        let key = ModuleKey {
            path: PathBuf::from("/p/noop.plugin"),
            generation: 1,
        };

        for _ in 0..3 {
            assert!(cache.get_or_resolve(&key, "Noop", module.as_ref()).is_some());
        }
        assert!(cache.get_or_resolve(&key, "Missing", module.as_ref()).is_none());

        assert_eq!(module.resolves.load(Ordering::SeqCst), 2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 1);

        assert_eq!(cache.purge_path(Path::new("/p/noop.plugin")), 1);
        assert_eq!(cache.stats().entries, 0);
    }
}
