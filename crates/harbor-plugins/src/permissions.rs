//! Permission gateway
//!
//! Each plugin's capability set is granted once at load, checked against an
//! optional ceiling, and revoked wholesale at unload. Every check made on a
//! plugin's behalf is recorded in a bounded audit log.

use crate::capability::Capabilities;
use crate::{PluginError, PluginResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allowed,
    Denied,
}

/// One audited permission decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub plugin_id: String,
    pub capability: Capabilities,
    pub verdict: Verdict,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PermissionGateway {
    ceiling: Option<Capabilities>,
    grants: RwLock<HashMap<String, Capabilities>>,
    audit: Mutex<VecDeque<AuditRecord>>,
    audit_capacity: usize,
}

impl PermissionGateway {
    pub fn new(ceiling: Option<Capabilities>, audit_capacity: usize) -> Self {
        Self {
            ceiling,
            grants: RwLock::new(HashMap::new()),
            audit: Mutex::new(VecDeque::with_capacity(audit_capacity.min(1024))),
            audit_capacity: audit_capacity.max(1),
        }
    }

    /// Gateway without a ceiling
    pub fn unrestricted() -> Self {
        Self::new(None, 1024)
    }

    pub fn ceiling(&self) -> Option<Capabilities> {
        self.ceiling
    }

    /// Grant `requested` to `plugin_id`, all or nothing
    pub fn grant(&self, plugin_id: &str, requested: Capabilities) -> PluginResult<()> {
        if let Some(ceiling) = self.ceiling {
            let excess = requested - ceiling;
            if !excess.is_empty() {
                self.record(plugin_id, excess, Verdict::Denied);
                warn!(
                    plugin_id = %plugin_id,
                    requested = %requested,
                    excess = %excess,
                    "Requested capabilities exceed the ceiling"
                );
                return Err(PluginError::PermissionDenied {
                    plugin_id: plugin_id.to_string(),
                    capability: excess.to_string(),
                });
            }
        }

        let mut grants = self.grants.write();
        if grants.contains_key(plugin_id) {
            return Err(PluginError::load_failure(
                plugin_id,
                "permissions are already granted for this plugin id",
            ));
        }
        grants.insert(plugin_id.to_string(), requested);
        info!(plugin_id = %plugin_id, capabilities = %requested, "Permissions granted");
        Ok(())
    }

    /// Check a capability on a plugin's behalf
    pub fn check(&self, plugin_id: &str, capability: Capabilities) -> PluginResult<()> {
        let granted = self
            .grants
            .read()
            .get(plugin_id)
            .is_some_and(|caps| caps.contains(capability));

        if granted {
            self.record(plugin_id, capability, Verdict::Allowed);
            debug!(plugin_id = %plugin_id, capability = %capability, "Permission allowed");
            Ok(())
        } else {
            self.record(plugin_id, capability, Verdict::Denied);
            warn!(plugin_id = %plugin_id, capability = %capability, "Permission denied");
            Err(PluginError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                capability: capability.to_string(),
            })
        }
    }

    /// Revoke everything granted to `plugin_id`
    pub fn revoke(&self, plugin_id: &str) -> Option<Capabilities> {
        let revoked = self.grants.write().remove(plugin_id);
        if let Some(caps) = revoked {
            info!(plugin_id = %plugin_id, capabilities = %caps, "Permissions revoked");
        }
        revoked
    }

    pub fn granted(&self, plugin_id: &str) -> Option<Capabilities> {
        self.grants.read().get(plugin_id).copied()
    }

    /// Audit records, oldest first
    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit.lock().iter().cloned().collect()
    }

    /// Per-plugin view handed to the plugin context
    pub fn handle(self: &Arc<Self>, plugin_id: impl Into<String>) -> PermissionHandle {
        PermissionHandle {
            gateway: Arc::clone(self),
            plugin_id: plugin_id.into(),
        }
    }

    fn record(&self, plugin_id: &str, capability: Capabilities, verdict: Verdict) {
        let mut audit = self.audit.lock();
        if audit.len() == self.audit_capacity {
            audit.pop_front();
        }
        audit.push_back(AuditRecord {
            plugin_id: plugin_id.to_string(),
            capability,
            verdict,
            timestamp: Utc::now(),
        });
    }
}

/// Permission checks bound to one plugin
#[derive(Debug, Clone)]
pub struct PermissionHandle {
    gateway: Arc<PermissionGateway>,
    plugin_id: String,
}

impl PermissionHandle {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn check(&self, capability: Capabilities) -> PluginResult<()> {
        self.gateway.check(&self.plugin_id, capability)
    }

    /// Whether the capability is granted, without auditing
    pub fn has(&self, capability: Capabilities) -> bool {
        self.gateway
            .granted(&self.plugin_id)
            .is_some_and(|caps| caps.contains(capability))
    }

    pub fn granted(&self) -> Capabilities {
        self.gateway.granted(&self.plugin_id).unwrap_or_default()
    }
}
