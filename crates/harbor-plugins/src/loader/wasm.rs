//! WebAssembly modules (`.wasm`, `.wat`) via wasmtime
//!
//! An entry type `T` is the set of exports `T.initialize`, `T.enable`,
//! `T.disable` and `T.health`, each `() -> i32`. Lifecycle hooks return 0 on
//! success; `health` returns 0 for healthy, 1 for degraded and anything else for
//! unhealthy. Missing hooks are treated as successful no-ops. Modules may not
//! import anything, and each instance runs in its own store; every hook call
//! is limited to the backend's fuel budget.

use super::backend::{LoadedModule, ModuleBackend};
use crate::context::PluginContext;
use crate::contract::{HealthStatus, Plugin, PluginFactory};
use crate::{PluginError, PluginResult};
use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wasmtime::{
    Config, Engine, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, WasmBacktraceDetails,
};

const EXTENSIONS: &[&str] = &["wasm", "wat"];
const HOOKS: &[&str] = &["initialize", "enable", "disable", "health"];

pub struct WasmBackend {
    engine: Engine,
    fuel_limit: u64,
    memory_limit_bytes: usize,
}

impl WasmBackend {
    pub fn new(fuel_limit: u64) -> PluginResult<Self> {
        if fuel_limit == 0 {
            return Err(PluginError::load_failure(
                "wasm",
                "fuel limit must be greater than zero",
            ));
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_threads(false);
        config.async_support(false);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);

        let engine = Engine::new(&config).map_err(|e| {
            PluginError::load_failure("wasm", format!("failed to initialize wasmtime engine: {e}"))
        })?;

        Ok(Self {
            engine,
            fuel_limit,
            memory_limit_bytes: 16 * 1024 * 1024,
        })
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }
}

impl std::fmt::Debug for WasmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmBackend")
            .field("fuel_limit", &self.fuel_limit)
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .finish()
    }
}

impl ModuleBackend for WasmBackend {
    fn name(&self) -> &'static str {
        "wasm"
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

        let module = Module::from_file(&self.engine, artifact)
            .map_err(|e| PluginError::load_failure(&id, format!("invalid module: {e}")))?;

        if module.imports().next().is_some() {
            return Err(PluginError::load_failure(
                &id,
                "imports are not allowed in plugin modules",
            ));
        }

        let entry_types: BTreeSet<String> = module
            .exports()
            .filter_map(|export| {
                let (entry, hook) = export.name().rsplit_once('.')?;
                (HOOKS.contains(&hook) && !entry.is_empty()).then(|| entry.to_string())
            })
            .collect();

        Ok(Arc::new(WasmModule {
            shared: Arc::new(WasmShared {
                engine: self.engine.clone(),
                module,
                fuel_limit: self.fuel_limit,
                memory_limit_bytes: self.memory_limit_bytes,
            }),
            entry_types,
        }))
    }
}

struct WasmShared {
    engine: Engine,
    module: Module,
    fuel_limit: u64,
    memory_limit_bytes: usize,
}

struct WasmModule {
    shared: Arc<WasmShared>,
    entry_types: BTreeSet<String>,
}

impl LoadedModule for WasmModule {
    fn backend(&self) -> &'static str {
        "wasm"
    }

    fn entry_types(&self) -> Vec<String> {
        self.entry_types.iter().cloned().collect()
    }

    fn resolve(&self, entry_type: &str) -> Option<PluginFactory> {
        if !self.entry_types.contains(entry_type) {
            return None;
        }
        let shared = Arc::clone(&self.shared);
        let entry_type = entry_type.to_string();
        Some(Arc::new(move || -> Box<dyn Plugin> {
            Box::new(WasmPlugin {
                shared: Arc::clone(&shared),
                entry_type: entry_type.clone(),
                runtime: Mutex::new(None),
            })
        }))
    }
}

struct StoreState {
    limits: StoreLimits,
}

struct WasmRuntime {
    store: Store<StoreState>,
    instance: Instance,
}

struct WasmPlugin {
    shared: Arc<WasmShared>,
    entry_type: String,
    runtime: Mutex<Option<WasmRuntime>>,
}

impl WasmPlugin {
    fn instantiate(&self) -> anyhow::Result<()> {
        let mut store = Store::new(
            &self.shared.engine,
            StoreState {
                limits: StoreLimitsBuilder::new()
                    .memory_size(self.shared.memory_limit_bytes)
                    .instances(1)
                    .trap_on_grow_failure(true)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.shared.fuel_limit)
            .context("failed to add fuel")?;

        let instance =
            Instance::new(&mut store, &self.shared.module, &[]).context("instantiation failed")?;
        *self.runtime.lock() = Some(WasmRuntime { store, instance });
        Ok(())
    }

    /// Call `<entry>.<hook>`; `None` when the module does not export it
    fn call_hook(&self, hook: &str) -> anyhow::Result<Option<i32>> {
        let mut guard = self.runtime.lock();
        let runtime = guard
            .as_mut()
            .ok_or_else(|| anyhow!("module instance is not running"))?;

        let name = format!("{}.{}", self.entry_type, hook);
        if runtime
            .instance
            .get_export(&mut runtime.store, &name)
            .is_none()
        {
            return Ok(None);
        }

        let func = runtime
            .instance
            .get_typed_func::<(), i32>(&mut runtime.store, &name)
            .with_context(|| format!("export '{name}' must have type () -> i32"))?;
        // Every hook call gets the full budget
        runtime
            .store
            .set_fuel(self.shared.fuel_limit)
            .context("failed to refuel store")?;
        let status = func
            .call(&mut runtime.store, ())
            .with_context(|| format!("'{name}' trapped"))?;
        Ok(Some(status))
    }

    fn lifecycle_hook(&self, hook: &str) -> anyhow::Result<()> {
        match self.call_hook(hook)? {
            None | Some(0) => Ok(()),
            Some(code) => Err(anyhow!("{}.{} returned status {}", self.entry_type, hook, code)),
        }
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    async fn initialize(
        &mut self,
        _ctx: Arc<PluginContext>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.instantiate()?;
        self.lifecycle_hook("initialize")
    }

    async fn on_enable(&mut self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.lifecycle_hook("enable")
    }

    async fn on_disable(&mut self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.lifecycle_hook("disable")
    }

    async fn health_check(&self) -> HealthStatus {
        match self.call_hook("health") {
            Ok(None) | Ok(Some(0)) => HealthStatus::Healthy,
            Ok(Some(1)) => HealthStatus::Degraded(format!("{} reported degraded", self.entry_type)),
            Ok(Some(code)) => HealthStatus::Unhealthy(format!("health status {code}")),
            Err(e) => HealthStatus::Unhealthy(format!("{e:#}")),
        }
    }

    async fn dispose(&mut self) -> anyhow::Result<()> {
        self.runtime.lock().take();
        Ok(())
    }
}
