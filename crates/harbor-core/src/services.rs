//! Service registry with scoped lifetimes
//!
//! The host owns a root [`ServiceRegistry`]. Every loaded plugin receives a child
//! scope created with [`ServiceRegistry::create_scope`]: lookups fall back to the
//! parent, registrations stay local to the scope, and disposing the scope drops
//! everything the plugin registered without touching the root.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type ServiceMap = HashMap<TypeId, (&'static str, Arc<dyn Any + Send + Sync>)>;

/// Type-keyed service registry
pub struct ServiceRegistry {
    name: String,
    services: RwLock<ServiceMap>,
    parent: Option<Arc<ServiceRegistry>>,
    disposed: AtomicBool,
}

impl ServiceRegistry {
    /// Create a new root registry
    pub fn new() -> Self {
        Self {
            name: "root".to_string(),
            services: RwLock::new(HashMap::new()),
            parent: None,
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a child scope that resolves through this registry
    pub fn create_scope(self: &Arc<Self>, name: impl Into<String>) -> Arc<ServiceRegistry> {
        Arc::new(Self {
            name: name.into(),
            services: RwLock::new(HashMap::new()),
            parent: Some(Arc::clone(self)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Scope name ("root" for the host registry)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a service value, replacing any previous registration of the same type
    pub fn register<T: Send + Sync + 'static>(&self, service: T) -> Result<()> {
        self.register_arc(Arc::new(service))
    }

    /// Register an already shared service
    pub fn register_arc<T: Send + Sync + 'static>(&self, service: Arc<T>) -> Result<()> {
        self.ensure_live()?;
        let previous = self
            .services
            .write()
            .insert(TypeId::of::<T>(), (type_name::<T>(), service));
        if previous.is_some() {
            tracing::debug!(scope = %self.name, service = type_name::<T>(), "Service replaced");
        }
        Ok(())
    }

    /// Resolve a service, falling back to parent scopes
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        if self.is_disposed() {
            return None;
        }
        let local = self
            .services
            .read()
            .get(&TypeId::of::<T>())
            .map(|(_, service)| Arc::clone(service));

        match local {
            Some(service) => service.downcast::<T>().ok(),
            None => self.parent.as_ref().and_then(|parent| parent.get::<T>()),
        }
    }

    /// Resolve a service or fail with [`Error::ServiceNotRegistered`]
    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.get::<T>()
            .ok_or(Error::ServiceNotRegistered(type_name::<T>()))
    }

    /// Whether a service of this type resolves from this scope
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.get::<T>().is_some()
    }

    /// Names of the services registered directly in this scope
    pub fn local_service_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.services.read().values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names
    }

    /// Drop every service registered in this scope; later lookups return `None`
    pub fn dispose(&self) -> usize {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mut services = self.services.write();
        let count = services.len();
        services.clear();
        tracing::debug!(scope = %self.name, services = count, "Service scope disposed");
        count
    }

    /// Whether this scope was disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::ScopeDisposed(self.name.clone()));
        }
        Ok(())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("name", &self.name)
            .field("services", &self.local_service_names())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
