//! Host runtime
//!
//! Sequences discovery, validation, dependency ordering and loading, and owns
//! every loaded plugin's lifecycle. Writers are serialized per plugin id; the
//! plugin table itself is read concurrently.

use super::{LoadReport, LoadedPlugin, PluginFailure, PluginHost, PluginSource, PluginSummary};
use crate::capability::Capabilities;
use crate::context::PluginContext;
use crate::descriptor::{PluginDescriptor, PluginState};
use crate::discovery::{Discovery, DiscoveryReport};
use crate::graph::{DependencyGraph, version_satisfies};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::loader::{IsolatedLoader, ModuleBackend, ModuleLoad, NativeBackend, WasmBackend};
use crate::manifest::{ManifestSerializer, SerializerRegistry};
use crate::permissions::{AuditRecord, PermissionGateway};
use crate::sync::KeyedLocks;
use crate::validation::ValidatorPipeline;
use crate::{PluginError, PluginResult};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use harbor_core::bus::{BusMessage, MessageBus};
use harbor_core::config::HostConfig;
use harbor_core::services::ServiceRegistry;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Assembles a [`HostRuntime`]
pub struct HostBuilder {
    config: HostConfig,
    backends: Vec<Arc<dyn ModuleBackend>>,
    services: Arc<ServiceRegistry>,
    serializers: SerializerRegistry,
    validator: Option<ValidatorPipeline>,
    bus: MessageBus,
}

impl HostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            backends: Vec::new(),
            services: Arc::new(ServiceRegistry::new()),
            serializers: SerializerRegistry::with_defaults(),
            validator: None,
            bus: MessageBus::new(),
        }
    }

    /// Add a module backend; backends are tried in registration order
    pub fn with_backend<B: ModuleBackend + 'static>(mut self, backend: Arc<B>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Native shared libraries and WebAssembly modules
    pub fn with_default_backends(self) -> PluginResult<Self> {
        let wasm = WasmBackend::new(self.config.loading.wasm_fuel)?;
        Ok(self
            .with_backend(Arc::new(NativeBackend::new()))
            .with_backend(Arc::new(wasm)))
    }

    /// Register a service in the host registry
    pub fn with_service<T: Send + Sync + 'static>(self, service: T) -> Self {
        if let Err(e) = self.services.register(service) {
            warn!(service = std::any::type_name::<T>(), error = %e, "Failed to register host service");
        }
        self
    }

    /// Add a manifest serializer; it takes precedence for its extensions
    pub fn with_serializer(mut self, serializer: Arc<dyn ManifestSerializer>) -> Self {
        self.serializers.register(serializer);
        self
    }

    /// Replace the validator pipeline built from the configuration
    pub fn with_validator(mut self, validator: ValidatorPipeline) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn build(self) -> PluginResult<Arc<HostRuntime>> {
        self.config.validate()?;

        let ceiling = match &self.config.loading.permission_ceiling {
            Some(names) => Some(Capabilities::parse_names(names).map_err(PluginError::Config)?),
            None => None,
        };
        if self.backends.is_empty() {
            warn!("Plugin host has no module backends; every load will fail");
        }

        let config = Arc::new(self.config);
        let validator = self
            .validator
            .unwrap_or_else(|| ValidatorPipeline::from_config(&config.validation));
        let serializers = Arc::new(self.serializers);
        let backends = self.backends;
        let services = self.services;
        let bus = self.bus;

        let host = Arc::new_cyclic(|this: &Weak<HostRuntime>| HostRuntime {
            discovery: Discovery::new(config.discovery.clone(), serializers),
            validator,
            loader: IsolatedLoader::new(backends, config.loading.prefer_resident_modules),
            permissions: Arc::new(PermissionGateway::new(ceiling, config.loading.audit_capacity)),
            services,
            bus,
            plugins: RwLock::new(HashMap::new()),
            plugin_locks: KeyedLocks::new("plugin"),
            generation: AtomicU64::new(0),
            health: HealthMonitor::new(config.health.clone(), this.clone()),
            this: this.clone(),
            config,
        });

        info!(
            backends = ?host.loader.backend_names(),
            rules = ?host.validator.rule_names(),
            ceiling = ?host.permissions.ceiling().map(|c| c.to_string()),
            "Plugin host ready"
        );
        Ok(host)
    }
}

/// The plugin host
pub struct HostRuntime {
    discovery: Discovery,
    validator: ValidatorPipeline,
    loader: IsolatedLoader,
    permissions: Arc<PermissionGateway>,
    services: Arc<ServiceRegistry>,
    bus: MessageBus,
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
    plugin_locks: KeyedLocks<String>,
    generation: AtomicU64,
    health: HealthMonitor,
    this: Weak<HostRuntime>,
    config: Arc<HostConfig>,
}

impl HostRuntime {
    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder::new(config)
    }

    pub fn config(&self) -> &Arc<HostConfig> {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Root service registry shared by every plugin scope
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn loader(&self) -> &IsolatedLoader {
        &self.loader
    }

    pub fn permissions(&self) -> &Arc<PermissionGateway> {
        &self.permissions
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn validator(&self) -> &ValidatorPipeline {
        &self.validator
    }

    /// Summaries of loaded plugins, sorted by id
    pub async fn summaries(&self) -> Vec<PluginSummary> {
        let mut summaries: Vec<_> = self
            .plugins
            .read()
            .await
            .values()
            .map(|plugin| plugin.summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    async fn running_versions(&self) -> HashMap<String, String> {
        self.plugins
            .read()
            .await
            .values()
            .filter(|plugin| plugin.state() == PluginState::Running)
            .map(|plugin| (plugin.id().to_string(), plugin.descriptor().version.clone()))
            .collect()
    }

    async fn check_dependencies(&self, descriptor: &PluginDescriptor) -> PluginResult<()> {
        let plugins = self.plugins.read().await;
        for dep in descriptor.required_dependencies() {
            let running = plugins
                .get(&dep.plugin_id)
                .filter(|plugin| plugin.state() == PluginState::Running);
            let Some(running) = running else {
                return Err(PluginError::DependencyMissing {
                    plugin_id: descriptor.id.clone(),
                    dependency: dep.plugin_id.clone(),
                });
            };
            if let Some(req) = &dep.version_req {
                let found = &running.descriptor().version;
                if !version_satisfies(req, found) {
                    return Err(PluginError::DependencyVersionMismatch {
                        plugin_id: descriptor.id.clone(),
                        dependency: dep.plugin_id.clone(),
                        required: req.clone(),
                        found: found.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Running dependents must accept the version a reload would bring in
    async fn check_dependents_accept(&self, replacement: &PluginDescriptor) -> PluginResult<()> {
        let plugins = self.plugins.read().await;
        for plugin in plugins.values() {
            let requirement = plugin
                .descriptor()
                .required_dependencies()
                .filter(|dep| dep.plugin_id == replacement.id)
                .find_map(|dep| dep.version_req.as_ref())
                .filter(|req| !version_satisfies(req, &replacement.version));
            if let Some(req) = requirement {
                return Err(PluginError::DependencyVersionMismatch {
                    plugin_id: plugin.id().to_string(),
                    dependency: replacement.id.clone(),
                    required: req.clone(),
                    found: replacement.version.clone(),
                });
            }
        }
        Ok(())
    }

    /// Load a validated descriptor
    async fn load_descriptor(
        &self,
        descriptor: PluginDescriptor,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        let id = descriptor.id.clone();
        let _guard = self.plugin_locks.lock(&id).await;

        if let Some(existing) = self.plugins.read().await.get(&id).cloned() {
            debug!(plugin_id = %id, instance_id = %existing.instance_id(), "Plugin already running");
            return Ok(existing);
        }
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        self.check_dependencies(&descriptor).await?;

        let start = Instant::now();
        info!(
            plugin_id = %id,
            version = %descriptor.version,
            capabilities = %descriptor.permissions,
            phase = "authorize",
            "Loading plugin"
        );
        self.permissions.grant(&id, descriptor.permissions)?;

        match self.activate(descriptor, cancel).await {
            Ok(plugin) => {
                info!(
                    plugin_id = %id,
                    phase = "running",
                    instance_id = %plugin.instance_id(),
                    reused_module = plugin.reused_module(),
                    elapsed_ms = start.elapsed().as_millis(),
                    "Plugin running"
                );
                Ok(plugin)
            }
            Err(e) => {
                self.permissions.revoke(&id);
                warn!(
                    plugin_id = %id,
                    phase = e.phase(),
                    code = e.code(),
                    error = %e,
                    "Plugin failed to load"
                );
                Err(e)
            }
        }
    }

    async fn activate(
        &self,
        mut descriptor: PluginDescriptor,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        let id = descriptor.id.clone();
        let module = self.loader.load_module(&descriptor).await?;
        let instance = match self.loader.instantiate(&descriptor, &module) {
            Ok(instance) => instance,
            Err(e) => {
                self.discard_module(&descriptor, module);
                return Err(e);
            }
        };

        descriptor.advance(PluginState::Initializing);
        let descriptor = Arc::new(descriptor);
        let scope = self.services.create_scope(format!("plugin:{id}"));
        let context = Arc::new(PluginContext::new(
            Arc::clone(&descriptor),
            scope,
            self.bus.clone(),
            self.permissions.handle(id.clone()),
            Arc::clone(&self.config),
            self.this.clone(),
        ));
        let ModuleLoad {
            module, isolation, ..
        } = module;
        let plugin = Arc::new(LoadedPlugin::new(
            descriptor, instance, module, isolation, context,
        ));

        if let Err(e) = self.start(&plugin, cancel).await {
            self.discard(&plugin).await;
            return Err(e);
        }

        plugin.advance(PluginState::Running);
        self.plugins
            .write()
            .await
            .insert(id.clone(), Arc::clone(&plugin));
        self.health.register(&plugin);
        self.publish(
            "host.plugin.loaded",
            json!({
                "plugin_id": id,
                "version": plugin.descriptor().version,
                "instance_id": plugin.instance_id(),
            }),
        );
        Ok(plugin)
    }

    /// Initialize then enable
    async fn start(&self, plugin: &LoadedPlugin, cancel: &CancellationToken) -> PluginResult<()> {
        let id = plugin.id();
        let span = plugin.context().span().clone();
        let mut instance = plugin.instance.lock().await;

        debug!(plugin_id = %id, phase = "initialize", "Initializing plugin");
        instance
            .initialize(Arc::clone(plugin.context()), cancel.child_token())
            .instrument(span.clone())
            .await
            .map_err(|e| PluginError::initialization(id, &e))?;

        // Not started yet, so cancellation still applies
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        debug!(plugin_id = %id, phase = "enable", "Enabling plugin");
        instance
            .on_enable(cancel.child_token())
            .instrument(span)
            .await
            .map_err(|e| PluginError::start(id, &e))
    }

    /// Tear down a plugin that never reached Running
    async fn discard(&self, plugin: &LoadedPlugin) {
        let id = plugin.id();
        plugin.advance(PluginState::Unloading);
        plugin.context().scope().dispose();
        if let Err(err) = plugin.instance.lock().await.dispose().await {
            let e = PluginError::dispose(id, &err);
            warn!(plugin_id = %id, phase = e.phase(), code = e.code(), error = %e, "Dispose failed");
        }
        if plugin.isolation().is_some() {
            if let Err(e) = self
                .loader
                .release(id, &plugin.descriptor().artifact, plugin.isolation())
            {
                warn!(plugin_id = %id, code = e.code(), error = %e, "Failed to release isolation unit");
            }
        }
    }

    fn discard_module(&self, descriptor: &PluginDescriptor, module: ModuleLoad) {
        if module.isolation.is_some() {
            if let Err(e) = self
                .loader
                .release(&descriptor.id, &descriptor.artifact, module.isolation)
            {
                warn!(plugin_id = %descriptor.id, code = e.code(), error = %e, "Failed to release isolation unit");
            }
        }
    }

    /// Unload sequence; individual step failures are logged and never stop it
    async fn teardown(&self, plugin: Arc<LoadedPlugin>, cancel: &CancellationToken) {
        let id = plugin.id().to_string();
        let start = Instant::now();
        plugin.advance(PluginState::Stopping);

        let dependents = self.running_dependents(&id).await;
        if !dependents.is_empty() {
            warn!(plugin_id = %id, dependents = ?dependents, "Unloading a plugin that running plugins depend on");
        }
        info!(plugin_id = %id, phase = "disable", "Unloading plugin");

        {
            let span = plugin.context().span().clone();
            let mut instance = plugin.instance.lock().await;
            if let Err(err) = instance.on_disable(cancel.child_token()).instrument(span).await {
                let e = PluginError::stop(&id, &err);
                warn!(plugin_id = %id, phase = e.phase(), code = e.code(), error = %e, "Plugin failed to stop; continuing unload");
            }

            plugin.advance(PluginState::Unloading);
            let services = plugin.context().scope().dispose();
            debug!(plugin_id = %id, services, "Service scope disposed");

            if let Err(err) = instance.dispose().await {
                let e = PluginError::dispose(&id, &err);
                warn!(plugin_id = %id, phase = e.phase(), code = e.code(), error = %e, "Plugin failed to dispose; continuing unload");
            }
        }

        if let Err(e) = self
            .loader
            .release(&id, &plugin.descriptor().artifact, plugin.isolation())
        {
            warn!(plugin_id = %id, phase = e.phase(), code = e.code(), error = %e, "Failed to unload isolation unit");
        }
        self.permissions.revoke(&id);
        self.plugins.write().await.remove(&id);
        self.health.unregister(&id);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.publish(
            "host.plugin.unloaded",
            json!({ "plugin_id": id, "instance_id": plugin.instance_id() }),
        );
        info!(
            plugin_id = %id,
            phase = "unloaded",
            generation,
            elapsed_ms = start.elapsed().as_millis(),
            "Plugin unloaded"
        );
    }

    async fn running_dependents(&self, id: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .plugins
            .read()
            .await
            .values()
            .filter(|plugin| {
                plugin
                    .descriptor()
                    .required_dependencies()
                    .any(|dep| dep.plugin_id == id)
            })
            .map(|plugin| plugin.id().to_string())
            .collect();
        dependents.sort();
        dependents
    }

    async fn load_entry(
        &self,
        descriptor: PluginDescriptor,
        cancel: &CancellationToken,
    ) -> (String, PluginResult<Arc<LoadedPlugin>>) {
        let id = descriptor.id.clone();
        let result = self.load_descriptor(descriptor, cancel).await;
        (id, result)
    }

    /// Descriptor for a fresh load of a running plugin
    async fn reload_source(&self, plugin: &LoadedPlugin) -> PluginResult<PluginDescriptor> {
        match &plugin.descriptor().manifest_path {
            Some(path) => self.discovery.load_manifest(path).await,
            None => {
                let mut descriptor = PluginDescriptor::clone(plugin.descriptor());
                // A new load starts the lifecycle over
                descriptor.state = PluginState::Discovered;
                Ok(descriptor)
            }
        }
    }

    fn publish(&self, topic: &str, payload: serde_json::Value) {
        self.bus.publish(BusMessage::new(topic, "host", payload));
    }
}

impl std::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("loader", &self.loader)
            .field("validator", &self.validator)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl PluginHost for HostRuntime {
    async fn discover(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> PluginResult<DiscoveryReport> {
        self.discovery.discover(dir, cancel).await
    }

    async fn load_discovered(
        &self,
        descriptors: Vec<PluginDescriptor>,
        cancel: &CancellationToken,
    ) -> PluginResult<LoadReport> {
        let mut report = LoadReport::default();
        if cancel.is_cancelled() {
            report.cancelled = descriptors.into_iter().map(|d| d.id).collect();
            return Ok(report);
        }

        let start = Instant::now();
        let resident = self.running_versions().await;
        let resident_ids: HashSet<String> = resident.keys().cloned().collect();
        let outcome = self.validator.validate(descriptors, &resident_ids);
        report.rejected = outcome.rejected;

        let graph = DependencyGraph::build_with_resident(&outcome.admitted, &resident)?;
        report.order = graph.topological_order()?;

        let limit = self.config.loading.max_parallel_loads.max(1);
        let waves: Vec<Vec<String>> = if limit == 1 {
            report.order.iter().map(|id| vec![id.clone()]).collect()
        } else {
            graph.load_waves()?
        };
        info!(
            plugins = report.order.len(),
            rejected = report.rejected.len(),
            waves = waves.len(),
            max_parallel_loads = limit,
            "Loading plugin batch"
        );

        // Ids that will not be Running after this batch
        let mut not_running: HashSet<String> = HashSet::new();
        for wave in waves {
            let mut ready = Vec::with_capacity(wave.len());
            for id in wave {
                let Some(descriptor) = graph.descriptor(&id).cloned() else {
                    continue;
                };
                if cancel.is_cancelled() {
                    report.cancelled.push(id.clone());
                    not_running.insert(id);
                    continue;
                }

                let blocked_by = descriptor
                    .required_dependencies()
                    .find(|dep| not_running.contains(&dep.plugin_id))
                    .map(|dep| dep.plugin_id.clone());
                if let Some(dependency) = blocked_by {
                    warn!(plugin_id = %id, dependency = %dependency, "Skipping plugin; required dependency did not load");
                    let error = PluginError::load_failure(
                        &id,
                        format!("required dependency '{dependency}' did not load"),
                    );
                    report.skipped.push(id.clone());
                    report.failures.push(PluginFailure::new(&id, error));
                    not_running.insert(id);
                    continue;
                }
                ready.push(descriptor);
            }

            let pending: Vec<_> = ready
                .into_iter()
                .map(|descriptor| self.load_entry(descriptor, cancel))
                .collect();
            let results: Vec<_> = stream::iter(pending).buffer_unordered(limit).collect().await;

            for (id, result) in results {
                match result {
                    Ok(_) => report.loaded.push(id),
                    Err(PluginError::Cancelled) => {
                        report.cancelled.push(id.clone());
                        not_running.insert(id);
                    }
                    Err(e) => {
                        report.failures.push(PluginFailure::new(&id, e));
                        not_running.insert(id);
                    }
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Plugin batch complete"
        );
        Ok(report)
    }

    async fn load_plugin(
        &self,
        source: PluginSource,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        let descriptor = match source {
            PluginSource::Manifest(path) => self.discovery.load_manifest(&path).await?,
            PluginSource::Descriptor(descriptor) => descriptor,
        };
        if let Some(existing) = self.plugin(&descriptor.id).await {
            return Ok(existing);
        }

        let resident: HashSet<String> = self.running_versions().await.into_keys().collect();
        let descriptor = self.validator.validate_one(descriptor, &resident)?;
        self.load_descriptor(descriptor, cancel).await
    }

    async fn unload_plugin(&self, id: &str, cancel: &CancellationToken) -> PluginResult<bool> {
        let key = id.to_string();
        let _guard = self.plugin_locks.lock(&key).await;

        let Some(plugin) = self.plugins.read().await.get(id).cloned() else {
            debug!(plugin_id = %id, "Unload requested for a plugin that is not loaded");
            return Ok(false);
        };
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        self.teardown(plugin, cancel).await;
        Ok(true)
    }

    async fn reload_plugin(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<LoadedPlugin>> {
        let current = self
            .plugin(id)
            .await
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let descriptor = self.reload_source(&current).await?;
        self.check_dependents_accept(&descriptor).await?;
        let previous_instance = current.instance_id();
        drop(current);

        info!(plugin_id = %id, %previous_instance, "Reloading plugin");
        self.unload_plugin(id, cancel).await?;

        let resident: HashSet<String> = self.running_versions().await.into_keys().collect();
        let descriptor = self.validator.validate_one(descriptor, &resident)?;
        self.load_descriptor(descriptor, cancel).await
    }

    async fn unload_all(&self, cancel: &CancellationToken) -> PluginResult<Vec<String>> {
        let mut loaded: Vec<Arc<LoadedPlugin>> =
            self.plugins.read().await.values().cloned().collect();
        loaded.sort_by(|a, b| a.loaded_at().cmp(&b.loaded_at()).then_with(|| a.id().cmp(b.id())));

        let ids: HashSet<&str> = loaded.iter().map(|p| p.id()).collect();
        let descriptors: Vec<PluginDescriptor> = loaded
            .iter()
            .map(|plugin| {
                let mut descriptor = PluginDescriptor::clone(plugin.descriptor());
                // Shutdown needs the edges only
                descriptor
                    .dependencies
                    .retain(|dep| ids.contains(dep.plugin_id.as_str()));
                for dep in &mut descriptor.dependencies {
                    dep.version_req = None;
                }
                descriptor
            })
            .collect();

        let order = DependencyGraph::build(&descriptors)?.shutdown_order()?;
        let mut unloaded = Vec::with_capacity(order.len());
        for id in order {
            if cancel.is_cancelled() {
                warn!(remaining = descriptors.len() - unloaded.len(), "Shutdown cancelled");
                return Err(PluginError::Cancelled);
            }
            if self.unload_plugin(&id, cancel).await? {
                unloaded.push(id);
            }
        }
        Ok(unloaded)
    }

    fn get_service<T: Send + Sync + 'static>(&self) -> PluginResult<Arc<T>> {
        self.services
            .get::<T>()
            .ok_or_else(|| PluginError::NotFound(std::any::type_name::<T>().to_string()))
    }

    async fn plugin(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins.read().await.get(id).cloned()
    }

    async fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lifecycle_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn sweep_module_cache(&self) -> Vec<PathBuf> {
        self.loader.sweep()
    }

    fn audit_log(&self) -> Vec<AuditRecord> {
        self.permissions.audit_log()
    }

    fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }
}
