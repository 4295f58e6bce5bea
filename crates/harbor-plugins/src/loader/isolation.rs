//! Isolation units
//!
//! Every freshly loaded module is placed in an arena slot owned by exactly one
//! plugin id. Handles carry the slot generation, so a handle kept past unload
//! is detected instead of freeing whatever reused the slot.

use super::backend::LoadedModule;
use crate::{PluginError, PluginResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Generation-checked reference to an isolation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IsolationHandle {
    pub index: usize,
    pub generation: u64,
}

impl std::fmt::Display for IsolationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit#{}@{}", self.index, self.generation)
    }
}

struct Unit {
    plugin_id: String,
    module: Arc<dyn LoadedModule>,
    created_at: DateTime<Utc>,
}

struct Slot {
    generation: u64,
    unit: Option<Unit>,
}

/// Summary of a live unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationInfo {
    pub handle: IsolationHandle,
    pub plugin_id: String,
    pub backend: &'static str,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct IsolationArena {
    slots: Mutex<Vec<Slot>>,
    free: Mutex<Vec<usize>>,
}

impl IsolationArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `module` in a unit owned by `plugin_id`
    pub fn create(&self, plugin_id: &str, module: Arc<dyn LoadedModule>) -> IsolationHandle {
        let unit = Unit {
            plugin_id: plugin_id.to_string(),
            module,
            created_at: Utc::now(),
        };

        let mut slots = self.slots.lock();
        let handle = match self.free.lock().pop() {
            Some(index) => {
                let slot = &mut slots[index];
                slot.generation += 1;
                slot.unit = Some(unit);
                IsolationHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                slots.push(Slot {
                    generation: 1,
                    unit: Some(unit),
                });
                IsolationHandle {
                    index: slots.len() - 1,
                    generation: 1,
                }
            }
        };

        debug!(plugin_id = %plugin_id, handle = %handle, "Isolation unit created");
        handle
    }

    /// Release the unit; only its owner may do so
    ///
    /// The module is dropped once no plugin instance references it anymore.
    pub fn unload(&self, handle: IsolationHandle, owner: &str) -> PluginResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| PluginError::unload(owner, format!("stale isolation handle {handle}")))?;

        match &slot.unit {
            None => {
                return Err(PluginError::unload(
                    owner,
                    format!("isolation unit {handle} is already unloaded"),
                ));
            }
            Some(unit) if unit.plugin_id != owner => {
                return Err(PluginError::unload(
                    owner,
                    format!("isolation unit {handle} belongs to another plugin"),
                ));
            }
            Some(_) => {}
        }

        // Module reference goes out of scope after the arena lock is released
        let unit = slot.unit.take();
        drop(slots);
        self.free.lock().push(handle.index);
        drop(unit);

        info!(plugin_id = %owner, handle = %handle, "Isolation unit unloaded");
        Ok(())
    }

    pub fn is_live(&self, handle: IsolationHandle) -> bool {
        self.slots
            .lock()
            .get(handle.index)
            .is_some_and(|slot| slot.generation == handle.generation && slot.unit.is_some())
    }

    /// Live units, by slot index
    pub fn units(&self) -> Vec<IsolationInfo> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.unit.as_ref().map(|unit| IsolationInfo {
                    handle: IsolationHandle {
                        index,
                        generation: slot.generation,
                    },
                    plugin_id: unit.plugin_id.clone(),
                    backend: unit.module.backend(),
                    created_at: unit.created_at,
                })
            })
            .collect()
    }

    /// Number of live units
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.unit.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for IsolationArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationArena")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::PluginFactory;

    struct EmptyModule;

    impl LoadedModule for EmptyModule {
        fn backend(&self) -> &'static str {
            "test"
        }

        fn entry_types(&self) -> Vec<String> {
            Vec::new()
        }

        fn resolve(&self, _entry_type: &str) -> Option<PluginFactory> {
            None
        }
    }

    #[test]
    fn test_unload_releases_module() {
        let arena = IsolationArena::new();
        let module: Arc<dyn LoadedModule> = Arc::new(EmptyModule);
        let weak = Arc::downgrade(&module);

        let handle = arena.create("alpha", module);
        assert!(arena.is_live(handle));
        assert_eq!(arena.units()[0].plugin_id, "alpha");

        arena.unload(handle, "alpha").expect("unload");
        assert!(!arena.is_live(handle));
        assert!(weak.upgrade().is_none(), "module reclaimed with its unit");
        assert!(arena.is_empty());
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let arena = IsolationArena::new();
        let first = arena.create("alpha", Arc::new(EmptyModule));
        arena.unload(first, "alpha").expect("unload");

        let second = arena.create("beta", Arc::new(EmptyModule));
        assert_eq!(second.index, first.index, "slot is reused");
        assert_ne!(second.generation, first.generation);

        let err = arena.unload(first, "alpha").unwrap_err();
        assert_eq!(err.code(), "E504");
        assert!(arena.is_live(second), "reused slot is untouched");
    }

    #[test]
    fn test_only_owner_may_unload() {
        let arena = IsolationArena::new();
        let handle = arena.create("alpha", Arc::new(EmptyModule));
        assert!(arena.unload(handle, "mallory").is_err());
        assert!(arena.is_live(handle));
        arena.unload(handle, "alpha").expect("owner unload");
    }
}
