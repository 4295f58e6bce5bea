//! Module backends
//!
//! A backend turns an artifact file into a [`LoadedModule`] that can construct
//! plugin instances by entry type name.

use crate::contract::{FactoryTable, PluginFactory, PluginRegistrar};
use crate::{PluginError, PluginResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A module resident in the host process
pub trait LoadedModule: Send + Sync + 'static {
    /// Name of the backend that produced the module
    fn backend(&self) -> &'static str;

    fn entry_types(&self) -> Vec<String>;

    /// Constructor for `entry_type`, if the module provides it
    fn resolve(&self, entry_type: &str) -> Option<PluginFactory>;
}

/// Loader strategy for one kind of artifact
pub trait ModuleBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, artifact: &Path) -> bool;

    /// Load the artifact; runs on a blocking worker
    fn load(&self, artifact: &Path) -> PluginResult<Arc<dyn LoadedModule>>;
}

type RegisterFn = Arc<dyn Fn(&mut dyn PluginRegistrar) + Send + Sync>;

/// Statically linked modules, keyed by artifact file name
///
/// The artifact file still has to exist: its modification time drives module
/// cache invalidation exactly as for dynamically loaded modules.
#[derive(Default)]
pub struct BuiltinBackend {
    modules: HashMap<String, RegisterFn>,
    loads: AtomicUsize,
}

impl BuiltinBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the module served for artifacts named `file_name`
    pub fn with_module(
        mut self,
        file_name: impl Into<String>,
        register: impl Fn(&mut dyn PluginRegistrar) + Send + Sync + 'static,
    ) -> Self {
        self.modules.insert(file_name.into(), Arc::new(register));
        self
    }

    /// Number of modules produced so far
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn file_name(artifact: &Path) -> Option<&str> {
        artifact.file_name().and_then(|name| name.to_str())
    }
}

impl ModuleBackend for BuiltinBackend {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn accepts(&self, artifact: &Path) -> bool {
        Self::file_name(artifact).is_some_and(|name| self.modules.contains_key(name))
    }

    fn load(&self, artifact: &Path) -> PluginResult<Arc<dyn LoadedModule>> {
        let name = Self::file_name(artifact).unwrap_or_default();
        let register = self
            .modules
            .get(name)
            .ok_or_else(|| PluginError::NotFound(format!("builtin module '{name}'")))?;

        let mut factories = FactoryTable::new();
        register(&mut factories);
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(BuiltinModule { factories }))
    }
}

impl std::fmt::Debug for BuiltinBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.modules.keys().collect();
        names.sort();
        f.debug_struct("BuiltinBackend")
            .field("modules", &names)
            .field("loads", &self.load_count())
            .finish()
    }
}

#[derive(Debug)]
struct BuiltinModule {
    factories: FactoryTable,
}

impl LoadedModule for BuiltinModule {
    fn backend(&self) -> &'static str {
        "builtin"
    }

    fn entry_types(&self) -> Vec<String> {
        self.factories.entry_types()
    }

    fn resolve(&self, entry_type: &str) -> Option<PluginFactory> {
        self.factories.get(entry_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PluginContext;
    use crate::contract::{Plugin, default_factory};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        async fn initialize(
            &mut self,
            _ctx: Arc<PluginContext>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builtin_backend() {
        let backend = BuiltinBackend::new().with_module("echo.plugin", |r: &mut dyn PluginRegistrar| {
            r.register("Echo", default_factory::<Echo>())
        });

        assert!(backend.accepts(Path::new("/plugins/echo/echo.plugin")));
        assert!(!backend.accepts(Path::new("/plugins/echo/other.plugin")));

        let module = backend
            .load(Path::new("/plugins/echo/echo.plugin"))
            .expect("load");
        assert_eq!(module.backend(), "builtin");
        assert_eq!(module.entry_types(), vec!["Echo"]);
        assert!(module.resolve("Echo").is_some());
        assert!(module.resolve("Nope").is_none());
        assert_eq!(backend.load_count(), 1);

        let again = backend
            .load(Path::new("/elsewhere/echo.plugin"))
            .expect("load");
        assert!(!Arc::ptr_eq(&module, &again), "each load yields a fresh module");
        assert_eq!(backend.load_count(), 2);
    }
}
