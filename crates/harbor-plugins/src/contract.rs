//! Plugin contract
//!
//! Everything an extension implements: the [`Plugin`] lifecycle trait, factory
//! registration through [`PluginRegistrar`], and the [`PluginDeclaration`] a native
//! library exports (use [`declare_plugin!`](crate::declare_plugin)).

use crate::context::PluginContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// ABI revision of [`PluginDeclaration`]
pub const ABI_VERSION: u32 = 1;

/// Crate version a native plugin was built against
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exported symbol name of the declaration in native libraries
pub const DECLARATION_SYMBOL: &[u8] = b"harbor_plugin_declaration\0";

/// Result of a health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Working with reduced function; not counted as a failure
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

/// Lifecycle implemented by every plugin
///
/// The host calls these in order: `initialize`, `on_enable`, then (any number of)
/// `health_check`, then `on_disable` and `dispose` on unload. Only the host invokes
/// lifecycle methods, one at a time.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn initialize(
        &mut self,
        ctx: Arc<PluginContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    async fn on_enable(&mut self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disable(&mut self, _cancel: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    async fn dispose(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Parameterless constructor of a plugin entry type
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Factory for a plugin type built with `Default`
pub fn default_factory<P: Plugin + Default + 'static>() -> PluginFactory {
    Arc::new(|| -> Box<dyn Plugin> { Box::new(P::default()) })
}

/// Factory from a constructor closure
pub fn factory<P, F>(constructor: F) -> PluginFactory
where
    P: Plugin + 'static,
    F: Fn() -> P + Send + Sync + 'static,
{
    Arc::new(move || -> Box<dyn Plugin> { Box::new(constructor()) })
}

/// Receives the entry types a module provides
pub trait PluginRegistrar {
    fn register(&mut self, entry_type: &str, factory: PluginFactory);
}

/// Entry types collected from one module
#[derive(Default)]
pub struct FactoryTable {
    factories: BTreeMap<String, PluginFactory>,
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entry_type: &str) -> Option<PluginFactory> {
        self.factories.get(entry_type).cloned()
    }

    pub fn entry_types(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl PluginRegistrar for FactoryTable {
    fn register(&mut self, entry_type: &str, factory: PluginFactory) {
        if self.factories.insert(entry_type.to_string(), factory).is_some() {
            tracing::warn!(entry_type, "Entry type registered twice; keeping the last one");
        }
    }
}

impl std::fmt::Debug for FactoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryTable")
            .field("entry_types", &self.entry_types())
            .finish()
    }
}

/// Declaration exported by native plugin libraries
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub core_version: &'static str,
    pub register: fn(&mut dyn PluginRegistrar),
}

/// Export a [`PluginDeclaration`] from a `cdylib` plugin crate
///
/// ```ignore
/// fn register(registrar: &mut dyn PluginRegistrar) {
///     registrar.register("Meter", default_factory::<Meter>());
/// }
/// harbor_plugins::declare_plugin!(register);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($register:path) => {
        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        #[unsafe(no_mangle)]
        pub static harbor_plugin_declaration: $crate::contract::PluginDeclaration =
            $crate::contract::PluginDeclaration {
                abi_version: $crate::contract::ABI_VERSION,
                core_version: $crate::contract::CORE_VERSION,
                register: $register,
            };
    };
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn register(registrar: &mut dyn PluginRegistrar) {
        registrar.register("Noop", factory(|| Noop));
    }

    mod exported {
        use super::register;
        crate::declare_plugin!(register);
    }

    #[test]
    fn test_declaration_registers_factories() {
        let declaration = &exported::harbor_plugin_declaration;
        assert_eq!(declaration.abi_version, ABI_VERSION);
        assert_eq!(declaration.core_version, CORE_VERSION);

        let mut table = FactoryTable::new();
        (declaration.register)(&mut table);
        assert_eq!(table.entry_types(), vec!["Noop"]);
        assert!(table.get("Missing").is_none());
    }

    #[tokio::test]
    async fn test_default_lifecycle_hooks() {
        let mut plugin = Noop;
        assert_eq!(plugin.health_check().await, HealthStatus::Healthy);
        plugin.on_enable(CancellationToken::new()).await.expect("enable");
        plugin.on_disable(CancellationToken::new()).await.expect("disable");
        plugin.dispose().await.expect("dispose");
    }

    #[test]
    fn test_health_status_failure() {
        assert!(!HealthStatus::Degraded("slow".into()).is_failure());
        assert!(HealthStatus::Unhealthy("down".into()).is_failure());
    }
}
