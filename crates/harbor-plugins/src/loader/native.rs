//! Native shared-library modules (`.so`, `.dylib`, `.dll`)
//!
//! The library must export a [`PluginDeclaration`] under
//! [`DECLARATION_SYMBOL`], normally through [`declare_plugin!`](crate::declare_plugin).
//! Instances keep the library mapped until they are dropped.

use super::backend::{LoadedModule, ModuleBackend};
use crate::context::PluginContext;
use crate::contract::{
    ABI_VERSION, CORE_VERSION, DECLARATION_SYMBOL, FactoryTable, HealthStatus, Plugin,
    PluginDeclaration, PluginFactory,
};
use crate::{PluginError, PluginResult};
use async_trait::async_trait;
use libloading::Library;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const EXTENSIONS: &[&str] = &["so", "dylib", "dll"];

#[derive(Debug, Default)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn accepts(&self, artifact: &Path) -> bool {
        artifact
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    fn load(&self, artifact: &Path) -> PluginResult<Arc<dyn LoadedModule>> {
        let id = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        // SAFETY: loading a library runs its initializers; artifacts reaching this
        // point passed the validator pipeline.
        let library = unsafe { Library::new(artifact) }
            .map_err(|e| PluginError::load_failure(&id, format!("failed to load library: {e}")))?;

        let declaration: &PluginDeclaration = unsafe {
            let symbol = library
                .get::<*const PluginDeclaration>(DECLARATION_SYMBOL)
                .map_err(|e| {
                    PluginError::load_failure(&id, format!("missing plugin declaration: {e}"))
                })?;
            let pointer: *const PluginDeclaration = *symbol;
            pointer
                .as_ref()
                .ok_or_else(|| PluginError::load_failure(&id, "null plugin declaration"))?
        };

        if declaration.abi_version != ABI_VERSION {
            return Err(PluginError::load_failure(
                &id,
                format!(
                    "ABI version {} is not supported (expected {})",
                    declaration.abi_version, ABI_VERSION
                ),
            ));
        }
        if declaration.core_version != CORE_VERSION {
            return Err(PluginError::load_failure(
                &id,
                format!(
                    "built against harbor-plugins {} but host runs {}",
                    declaration.core_version, CORE_VERSION
                ),
            ));
        }

        let mut factories = FactoryTable::new();
        (declaration.register)(&mut factories);

        Ok(Arc::new(NativeModule {
            factories,
            library: Arc::new(library),
        }))
    }
}

struct NativeModule {
    // Dropped before the library
    factories: FactoryTable,
    library: Arc<Library>,
}

impl LoadedModule for NativeModule {
    fn backend(&self) -> &'static str {
        "native"
    }

    fn entry_types(&self) -> Vec<String> {
        self.factories.entry_types()
    }

    fn resolve(&self, entry_type: &str) -> Option<PluginFactory> {
        let inner = self.factories.get(entry_type)?;
        let library = Arc::clone(&self.library);
        Some(Arc::new(move || -> Box<dyn Plugin> {
            Box::new(LibraryBound {
                instance: inner(),
                _library: Arc::clone(&library),
            })
        }))
    }
}

/// Plugin instance that keeps its library mapped
struct LibraryBound {
    instance: Box<dyn Plugin>,
    _library: Arc<Library>,
}

#[async_trait]
impl Plugin for LibraryBound {
    async fn initialize(
        &mut self,
        ctx: Arc<PluginContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.instance.initialize(ctx, cancel).await
    }

    async fn on_enable(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.instance.on_enable(cancel).await
    }

    async fn on_disable(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.instance.on_disable(cancel).await
    }

    async fn health_check(&self) -> HealthStatus {
        self.instance.health_check().await
    }

    async fn dispose(&mut self) -> anyhow::Result<()> {
        self.instance.dispose().await
    }
}
