//! Per-plugin context handed to [`Plugin::initialize`](crate::Plugin::initialize)
//!
//! Every sensitive operation goes through the plugin's permission handle, so a
//! plugin can only use what its manifest requested and the host granted.

use crate::capability::Capabilities;
use crate::descriptor::PluginDescriptor;
use crate::host::HostRuntime;
use crate::permissions::PermissionHandle;
use crate::{PluginError, PluginResult};
use harbor_core::bus::{BusMessage, MessageBus, Subscription};
use harbor_core::config::HostConfig;
use harbor_core::services::ServiceRegistry;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::Span;

pub struct PluginContext {
    descriptor: Arc<PluginDescriptor>,
    services: Arc<ServiceRegistry>,
    bus: MessageBus,
    span: Span,
    permissions: PermissionHandle,
    config: Arc<HostConfig>,
    plugin_config: toml::Table,
    host: Weak<HostRuntime>,
}

impl PluginContext {
    pub(crate) fn new(
        descriptor: Arc<PluginDescriptor>,
        services: Arc<ServiceRegistry>,
        bus: MessageBus,
        permissions: PermissionHandle,
        config: Arc<HostConfig>,
        host: Weak<HostRuntime>,
    ) -> Self {
        let span = tracing::info_span!("plugin", plugin_id = %descriptor.id);
        let plugin_config = config
            .plugin_section(descriptor.config_key())
            .cloned()
            .unwrap_or_default();
        Self {
            descriptor,
            services,
            bus,
            span,
            permissions,
            config,
            plugin_config,
            host,
        }
    }

    /// Context with no grants, no host and an empty service scope
    #[cfg(test)]
    pub(crate) fn detached(descriptor: PluginDescriptor) -> Arc<Self> {
        let gateway = Arc::new(crate::permissions::PermissionGateway::unrestricted());
        let handle = gateway.handle(descriptor.id.clone());
        Arc::new(Self::new(
            Arc::new(descriptor),
            Arc::new(ServiceRegistry::new()),
            MessageBus::new(),
            handle,
            Arc::new(HostConfig::default()),
            Weak::new(),
        ))
    }

    pub fn plugin_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Tracing span carrying the plugin id; enter it around plugin work
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn permissions(&self) -> &PermissionHandle {
        &self.permissions
    }

    /// Host configuration root
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// This plugin's `[plugins.<id>]` configuration section
    pub fn plugin_config(&self) -> &toml::Table {
        &self.plugin_config
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.descriptor.plugin_dir
    }

    /// Fail unless the plugin holds `capability`
    pub fn require(&self, capability: Capabilities) -> PluginResult<()> {
        self.permissions.check(capability)
    }

    /// The plugin's service scope
    pub fn services(&self) -> PluginResult<&Arc<ServiceRegistry>> {
        self.require(Capabilities::SERVICES)?;
        Ok(&self.services)
    }

    /// Resolve a service from the plugin scope or the host registry
    pub fn service<T: Send + Sync + 'static>(&self) -> PluginResult<Arc<T>> {
        self.services()?
            .get::<T>()
            .ok_or_else(|| PluginError::NotFound(std::any::type_name::<T>().to_string()))
    }

    /// The service scope without a capability check, for host bookkeeping
    pub(crate) fn scope(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Register a service in the plugin scope; dropped when the plugin unloads
    pub fn register_service<T: Send + Sync + 'static>(&self, service: T) -> PluginResult<()> {
        self.services()?
            .register(service)
            .map_err(|e| PluginError::load_failure(self.plugin_id(), e))
    }

    /// Publish on the message bus as this plugin
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> PluginResult<usize> {
        self.require(Capabilities::MESSAGE_BUS)?;
        Ok(self
            .bus
            .publish(BusMessage::new(topic, self.plugin_id(), payload)))
    }

    pub fn subscribe(&self, filter: &str) -> PluginResult<Subscription> {
        self.require(Capabilities::MESSAGE_BUS)?;
        Ok(self.bus.subscribe_to(filter))
    }

    /// Read a file inside the plugin directory
    pub async fn read_file(&self, relative: impl AsRef<Path>) -> PluginResult<Vec<u8>> {
        self.require(Capabilities::FILE_READ)?;
        let path = self.resolve_in_plugin_dir(relative.as_ref())?;
        Ok(tokio::fs::read(path).await?)
    }

    /// Write a file inside the plugin directory
    pub async fn write_file(
        &self,
        relative: impl AsRef<Path>,
        contents: impl AsRef<[u8]>,
    ) -> PluginResult<()> {
        self.require(Capabilities::FILE_WRITE)?;
        let path = self.resolve_in_plugin_dir(relative.as_ref())?;
        Ok(tokio::fs::write(path, contents).await?)
    }

    /// Read an environment variable
    pub fn env_var(&self, name: &str) -> PluginResult<Option<String>> {
        self.require(Capabilities::ENVIRONMENT)?;
        Ok(std::env::var(name).ok())
    }

    /// Back-reference to the host
    pub fn host(&self) -> PluginResult<Arc<HostRuntime>> {
        self.require(Capabilities::HOST_CONTROL)?;
        self.host
            .upgrade()
            .ok_or_else(|| PluginError::NotFound("host".to_string()))
    }

    fn resolve_in_plugin_dir(&self, relative: &Path) -> PluginResult<PathBuf> {
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if escapes {
            return Err(PluginError::PermissionDenied {
                plugin_id: self.plugin_id().to_string(),
                capability: format!("access outside plugin directory ({})", relative.display()),
            });
        }
        Ok(self.descriptor.plugin_dir.join(relative))
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id())
            .field("plugin_dir", &self.plugin_dir())
            .field("permissions", &self.permissions.granted())
            .finish()
    }
}
