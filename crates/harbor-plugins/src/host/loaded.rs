//! A plugin the host has loaded

use crate::context::PluginContext;
use crate::contract::{HealthStatus, Plugin};
use crate::descriptor::{PluginDescriptor, PluginState, StateCell};
use crate::loader::{IsolationHandle, LoadedModule};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct LoadedPlugin {
    descriptor: Arc<PluginDescriptor>,
    // Field order matters: the instance is dropped before the module it came from
    pub(crate) instance: Mutex<Box<dyn Plugin>>,
    module: Arc<dyn LoadedModule>,
    isolation: Option<IsolationHandle>,
    context: Arc<PluginContext>,
    state: StateCell,
    instance_id: Uuid,
    loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    pub(crate) fn new(
        descriptor: Arc<PluginDescriptor>,
        instance: Box<dyn Plugin>,
        module: Arc<dyn LoadedModule>,
        isolation: Option<IsolationHandle>,
        context: Arc<PluginContext>,
    ) -> Self {
        Self {
            descriptor,
            instance: Mutex::new(instance),
            module,
            isolation,
            context,
            state: StateCell::new(PluginState::Initializing),
            instance_id: Uuid::new_v4(),
            loaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> PluginState {
        self.state.get()
    }

    pub(crate) fn advance(&self, next: PluginState) -> bool {
        self.state.advance(next)
    }

    /// Unique per instantiation; a reload yields a new id
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Isolation unit created for this load, `None` when a resident module was reused
    pub fn isolation(&self) -> Option<IsolationHandle> {
        self.isolation
    }

    pub fn reused_module(&self) -> bool {
        self.isolation.is_none()
    }

    pub fn backend(&self) -> &'static str {
        self.module.backend()
    }

    pub(crate) fn module(&self) -> &Arc<dyn LoadedModule> {
        &self.module
    }

    pub fn context(&self) -> &Arc<PluginContext> {
        &self.context
    }

    /// Run the plugin's health check; waits for any lifecycle call in progress
    pub async fn health_check(&self) -> HealthStatus {
        if self.state() != PluginState::Running {
            return HealthStatus::Unhealthy(format!("plugin is {}", self.state()));
        }
        self.instance.lock().await.health_check().await
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.descriptor.id.clone(),
            version: self.descriptor.version.clone(),
            state: self.state(),
            backend: self.backend(),
            instance_id: self.instance_id,
            isolation: self.isolation,
            loaded_at: self.loaded_at,
        }
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("instance_id", &self.instance_id)
            .field("isolation", &self.isolation)
            .finish()
    }
}

/// Serializable view of a loaded plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub version: String,
    pub state: PluginState,
    pub backend: &'static str,
    pub instance_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationHandle>,
    pub loaded_at: DateTime<Utc>,
}
