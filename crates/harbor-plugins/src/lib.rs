//! Harbor Plugin Runtime
//!
//! Hosts independently built extension modules inside a long-running process:
//! - Manifest discovery with pluggable serializers (JSON, TOML, YAML)
//! - Validator pipeline (artifact, version, dependency, signature, whitelist rules)
//! - Dependency graph with deterministic topological ordering
//! - Isolated loading through module backends (builtin, native libraries, WebAssembly)
//! - Permission gateway with an audit trail
//! - Host orchestrator plus concurrency-limiting and caching decorators
//! - Health probes with automatic recovery

pub mod capability;
pub mod context;
pub mod contract;
pub mod decorators;
pub mod descriptor;
pub mod discovery;
pub mod graph;
pub mod health;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod permissions;
pub mod signature;
pub mod sync;
pub mod validation;

use harbor_core::sanitize::sanitize_detail;
use thiserror::Error;

pub use capability::Capabilities;
pub use context::PluginContext;
pub use contract::{HealthStatus, Plugin, PluginDeclaration, PluginFactory, PluginRegistrar};
pub use decorators::{CachingHost, ConcurrencyLimitedHost, DiscoveryCacheStats};
pub use descriptor::{DependencySpec, PluginDescriptor, PluginState};
pub use discovery::{Discovery, DiscoveryIssue, DiscoveryReport};
pub use graph::DependencyGraph;
pub use health::{HealthMonitor, HealthSnapshot};
pub use host::{
    HostBuilder, HostRuntime, LoadReport, LoadedPlugin, PluginFailure, PluginHost, PluginSource,
    PluginSummary,
};
pub use permissions::{AuditRecord, PermissionGateway, Verdict};

/// Plugin runtime errors
///
/// Detail strings are sanitized when built through the helper constructors, so
/// they are safe to log and to show in load reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Plugin '{plugin_id}' failed validation: {}", reasons.join("; "))]
    ValidationFailure {
        plugin_id: String,
        reasons: Vec<String>,
    },

    #[error("Plugin '{plugin_id}' requires missing dependency '{dependency}'")]
    DependencyMissing {
        plugin_id: String,
        dependency: String,
    },

    #[error("Plugin '{plugin_id}' requires '{dependency}' {required}, found {found}")]
    DependencyVersionMismatch {
        plugin_id: String,
        dependency: String,
        required: String,
        found: String,
    },

    #[error("Duplicate plugin id '{0}'")]
    DuplicatePlugin(String),

    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Failed to load plugin '{plugin_id}': {detail}")]
    LoadFailure { plugin_id: String, detail: String },

    #[error("Plugin '{plugin_id}' is not permitted to use {capability}")]
    PermissionDenied {
        plugin_id: String,
        capability: String,
    },

    #[error("Plugin '{plugin_id}' failed to initialize: {detail}")]
    InitializationFailure { plugin_id: String, detail: String },

    #[error("Plugin '{plugin_id}' failed to start: {detail}")]
    StartFailure { plugin_id: String, detail: String },

    #[error("Plugin '{plugin_id}' failed to stop: {detail}")]
    StopFailure { plugin_id: String, detail: String },

    #[error("Plugin '{plugin_id}' failed to dispose: {detail}")]
    DisposeFailure { plugin_id: String, detail: String },

    #[error("Failed to unload plugin '{plugin_id}': {detail}")]
    UnloadFailure { plugin_id: String, detail: String },

    #[error("Invalid manifest {path}: {detail}")]
    Manifest { path: String, detail: String },

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Host configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Plugin IO error: {0}")]
    Io(String),
}

pub type PluginResult<T> = Result<T, PluginError>;

impl PluginError {
    pub fn load_failure(plugin_id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::LoadFailure {
            plugin_id: plugin_id.into(),
            detail: sanitize_detail(&detail.to_string()),
        }
    }

    pub fn initialization(plugin_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::InitializationFailure {
            plugin_id: plugin_id.into(),
            detail: sanitize_detail(&format!("{err:#}")),
        }
    }

    pub fn start(plugin_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::StartFailure {
            plugin_id: plugin_id.into(),
            detail: sanitize_detail(&format!("{err:#}")),
        }
    }

    pub fn stop(plugin_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::StopFailure {
            plugin_id: plugin_id.into(),
            detail: sanitize_detail(&format!("{err:#}")),
        }
    }

    pub fn dispose(plugin_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::DisposeFailure {
            plugin_id: plugin_id.into(),
            detail: sanitize_detail(&format!("{err:#}")),
        }
    }

    pub fn unload(plugin_id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::UnloadFailure {
            plugin_id: plugin_id.into(),
            detail: sanitize_detail(&detail.to_string()),
        }
    }

    pub fn manifest(path: &std::path::Path, detail: impl std::fmt::Display) -> Self {
        Self::Manifest {
            path: sanitize_detail(&path.display().to_string()),
            detail: sanitize_detail(&detail.to_string()),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailure { .. } => "E100",
            Self::Manifest { .. } => "E101",
            Self::DependencyMissing { .. } => "E200",
            Self::DependencyVersionMismatch { .. } => "E201",
            Self::DuplicatePlugin(_) => "E202",
            Self::CycleDetected { .. } => "E203",
            Self::LoadFailure { .. } => "E300",
            Self::NotFound(_) => "E301",
            Self::PermissionDenied { .. } => "E400",
            Self::InitializationFailure { .. } => "E500",
            Self::StartFailure { .. } => "E501",
            Self::StopFailure { .. } => "E502",
            Self::DisposeFailure { .. } => "E503",
            Self::UnloadFailure { .. } => "E504",
            Self::Cancelled => "E900",
            Self::Io(_) => "E901",
            Self::Config(_) => "E902",
        }
    }

    /// Plugin the error is about, when there is one
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::ValidationFailure { plugin_id, .. }
            | Self::DependencyMissing { plugin_id, .. }
            | Self::DependencyVersionMismatch { plugin_id, .. }
            | Self::LoadFailure { plugin_id, .. }
            | Self::PermissionDenied { plugin_id, .. }
            | Self::InitializationFailure { plugin_id, .. }
            | Self::StartFailure { plugin_id, .. }
            | Self::StopFailure { plugin_id, .. }
            | Self::DisposeFailure { plugin_id, .. }
            | Self::UnloadFailure { plugin_id, .. } => Some(plugin_id),
            Self::DuplicatePlugin(id) | Self::NotFound(id) => Some(id),
            Self::CycleDetected { .. }
            | Self::Manifest { .. }
            | Self::Cancelled
            | Self::Io(_)
            | Self::Config(_) => None,
        }
    }

    /// Graph-level errors abort a whole batch before anything loads
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::DependencyMissing { .. }
                | Self::DependencyVersionMismatch { .. }
                | Self::DuplicatePlugin(_)
                | Self::CycleDetected { .. }
        )
    }

    /// Lifecycle phase in which the error occurred, for logs and reports
    pub fn phase(&self) -> &'static str {
        match self {
            Self::ValidationFailure { .. } | Self::Manifest { .. } => "validate",
            Self::DependencyMissing { .. }
            | Self::DependencyVersionMismatch { .. }
            | Self::DuplicatePlugin(_)
            | Self::CycleDetected { .. } => "resolve",
            Self::LoadFailure { .. } | Self::NotFound(_) | Self::Io(_) => "load",
            Self::PermissionDenied { .. } => "authorize",
            Self::InitializationFailure { .. } => "initialize",
            Self::StartFailure { .. } => "enable",
            Self::StopFailure { .. } => "disable",
            Self::DisposeFailure { .. } => "dispose",
            Self::UnloadFailure { .. } => "unload",
            Self::Cancelled => "cancel",
            Self::Config(_) => "configure",
        }
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(sanitize_detail(&err.to_string()))
    }
}

impl From<harbor_core::Error> for PluginError {
    fn from(err: harbor_core::Error) -> Self {
        Self::Config(sanitize_detail(&err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(PluginError::Cancelled.code(), "E900");
        assert_eq!(PluginError::DuplicatePlugin("a".into()).code(), "E202");
        assert_eq!(
            PluginError::CycleDetected {
                cycle: vec!["a".into(), "b".into(), "a".into()]
            }
            .code(),
            "E203"
        );
    }

    #[test]
    fn test_cycle_display_names_members() {
        let err = PluginError::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert!(err.is_graph_error());
        assert!(err.plugin_id().is_none());
    }

    #[test]
    fn test_lifecycle_errors_are_sanitized() {
        let cause = anyhow::anyhow!("cannot open /opt/harbor/secret/state.db: password=hunter2");
        let err = PluginError::initialization("alpha", &cause);
        let text = err.to_string();
        assert!(!text.contains("/opt/harbor"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("state.db"));
        assert_eq!(err.phase(), "initialize");
        assert_eq!(err.plugin_id(), Some("alpha"));
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing /var/lib/harbor/x.so");
        let err = PluginError::from(io);
        assert_eq!(err.code(), "E901");
        assert_eq!(err.to_string(), "Plugin IO error: missing x.so");
    }
}
