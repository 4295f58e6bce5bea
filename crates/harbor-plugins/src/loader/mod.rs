//! Isolated module loading
//!
//! Resolves a descriptor's artifact to a resident module, either by reusing a
//! live cached copy or by loading it through the first accepting backend into a
//! fresh isolation unit, and instantiates entry types through the factory cache.

pub mod backend;
pub mod cache;
pub mod isolation;
pub mod native;
pub mod wasm;

pub use backend::{BuiltinBackend, LoadedModule, ModuleBackend};
pub use cache::{FactoryCache, FactoryCacheStats, ModuleCache, ModuleKey};
pub use isolation::{IsolationArena, IsolationHandle, IsolationInfo};
pub use native::NativeBackend;
pub use wasm::WasmBackend;

use crate::contract::Plugin;
use crate::descriptor::{PluginDescriptor, normalize_path};
use crate::sync::KeyedLocks;
use crate::{PluginError, PluginResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A module ready to instantiate from
pub struct ModuleLoad {
    pub module: Arc<dyn LoadedModule>,
    pub key: ModuleKey,
    /// `None` when a resident module was reused
    pub isolation: Option<IsolationHandle>,
}

impl ModuleLoad {
    pub fn reused(&self) -> bool {
        self.isolation.is_none()
    }
}

pub struct IsolatedLoader {
    backends: Vec<Arc<dyn ModuleBackend>>,
    modules: ModuleCache,
    factories: FactoryCache,
    arena: IsolationArena,
    path_locks: KeyedLocks<PathBuf>,
    prefer_resident: bool,
}

impl IsolatedLoader {
    pub fn new(backends: Vec<Arc<dyn ModuleBackend>>, prefer_resident: bool) -> Self {
        Self {
            backends,
            modules: ModuleCache::new(),
            factories: FactoryCache::new(),
            arena: IsolationArena::new(),
            path_locks: KeyedLocks::new("artifact"),
            prefer_resident,
        }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    pub fn module_cache(&self) -> &ModuleCache {
        &self.modules
    }

    pub fn factory_cache(&self) -> &FactoryCache {
        &self.factories
    }

    pub fn arena(&self) -> &IsolationArena {
        &self.arena
    }

    /// Resolve the descriptor's artifact to a resident module
    pub async fn load_module(&self, descriptor: &PluginDescriptor) -> PluginResult<ModuleLoad> {
        let path = normalize_path(&descriptor.artifact);
        let _guard = self.path_locks.lock(&path).await;

        let modified = match tokio::fs::metadata(&path)
            .await
            .and_then(|meta| meta.modified())
        {
            Ok(modified) => modified,
            Err(e) => {
                self.purge(&path);
                return Err(PluginError::load_failure(
                    &descriptor.id,
                    format!("artifact unavailable: {e}"),
                ));
            }
        };

        if self.prefer_resident {
            if let Some(hit) = self.modules.lookup(&path, modified) {
                info!(
                    plugin_id = %descriptor.id,
                    backend = hit.module.backend(),
                    generation = hit.key.generation,
                    "Reusing resident module"
                );
                return Ok(ModuleLoad {
                    module: hit.module,
                    key: hit.key,
                    isolation: None,
                });
            }
        }

        let backend = self
            .backends
            .iter()
            .find(|backend| backend.accepts(&path))
            .cloned()
            .ok_or_else(|| {
                PluginError::load_failure(
                    &descriptor.id,
                    format!("no module backend accepts {}", path.display()),
                )
            })?;

        let start = Instant::now();
        let artifact = path.clone();
        let module = tokio::task::spawn_blocking(move || backend.load(&artifact))
            .await
            .map_err(|e| {
                PluginError::load_failure(&descriptor.id, format!("module loader task failed: {e}"))
            })?
            .map_err(|e| attribute(e, &descriptor.id))?;

        // Constructors of an older copy must not be served for the new one
        self.factories.purge_path(&path);
        let isolation = self.arena.create(&descriptor.id, Arc::clone(&module));
        let key = self.modules.insert(&path, &module, modified, true);

        info!(
            plugin_id = %descriptor.id,
            backend = module.backend(),
            generation = key.generation,
            isolation = %isolation,
            elapsed_ms = start.elapsed().as_millis(),
            "Module loaded into isolation unit"
        );

        Ok(ModuleLoad {
            module,
            key,
            isolation: Some(isolation),
        })
    }

    /// Construct the descriptor's entry type
    pub fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        load: &ModuleLoad,
    ) -> PluginResult<Box<dyn Plugin>> {
        let factory = self
            .factories
            .get_or_resolve(&load.key, &descriptor.entry_type, load.module.as_ref())
            .ok_or_else(|| {
                PluginError::load_failure(
                    &descriptor.id,
                    format!(
                        "entry type '{}' not found (module provides: {})",
                        descriptor.entry_type,
                        load.module.entry_types().join(", ")
                    ),
                )
            })?;
        Ok(factory())
    }

    /// Purge cached state for the artifact and release the isolation unit
    pub fn release(
        &self,
        plugin_id: &str,
        artifact: &Path,
        isolation: Option<IsolationHandle>,
    ) -> PluginResult<()> {
        self.purge(&normalize_path(artifact));
        if let Some(handle) = isolation {
            self.arena.unload(handle, plugin_id)?;
        }
        Ok(())
    }

    /// Proactively drop invalid module cache entries
    pub fn sweep(&self) -> Vec<PathBuf> {
        let removed = self.modules.sweep();
        for path in &removed {
            self.factories.purge_path(path);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "Module cache swept");
        }
        removed
    }

    fn purge(&self, path: &Path) {
        let module = self.modules.purge(path);
        let factories = self.factories.purge_path(path);
        if module || factories > 0 {
            debug!(artifact = %path.display(), factories, "Purged cached module");
        }
    }
}

impl std::fmt::Debug for IsolatedLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedLoader")
            .field("backends", &self.backend_names())
            .field("modules", &self.modules)
            .field("factories", &self.factories)
            .field("arena", &self.arena)
            .field("prefer_resident", &self.prefer_resident)
            .finish()
    }
}

/// Backends name failures after the artifact; report them against the plugin
fn attribute(err: PluginError, plugin_id: &str) -> PluginError {
    match err {
        PluginError::LoadFailure { detail, .. } => PluginError::LoadFailure {
            plugin_id: plugin_id.to_string(),
            detail,
        },
        PluginError::NotFound(what) => PluginError::load_failure(plugin_id, format!("{what} not found")),
        other => other,
    }
}
