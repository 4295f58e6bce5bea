//! Plugin descriptors and lifecycle state

use crate::capability::Capabilities;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a plugin
///
/// States only move forward; skipping states is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Validated,
    Initializing,
    Running,
    Stopping,
    Unloading,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validated => "validated",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Unloading => "unloading",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Discovered,
            1 => Self::Validated,
            2 => Self::Initializing,
            3 => Self::Running,
            4 => Self::Stopping,
            _ => Self::Unloading,
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, forward-only state cell owned by the host
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: PluginState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> PluginState {
        PluginState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Advance to `next`; returns false when `next` is not ahead of the current state
    pub fn advance(&self, next: PluginState) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }
}

/// A declared dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub plugin_id: String,
    #[serde(default)]
    pub optional: bool,
    /// Semver requirement the dependency's version must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_req: Option<String>,
}

impl DependencySpec {
    pub fn required(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            optional: false,
            version_req: None,
        }
    }

    pub fn optional(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            optional: true,
            version_req: None,
        }
    }

    pub fn with_version_req(mut self, req: impl Into<String>) -> Self {
        self.version_req = Some(req.into());
        self
    }
}

/// Static metadata describing an installable plugin before it is loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Normalized absolute path of the module artifact
    pub artifact: PathBuf,
    /// Type name resolved inside the artifact
    pub entry_type: String,
    pub dependencies: Vec<DependencySpec>,
    pub permissions: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Base64 ed25519 signature over the artifact's SHA-256 digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    pub plugin_dir: PathBuf,
    /// Name of the configuration section, defaults to the plugin id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_section: Option<String>,
    pub state: PluginState,
}

impl PluginDescriptor {
    /// Build a descriptor programmatically; the plugin directory defaults to the artifact's parent
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        artifact: impl AsRef<Path>,
        entry_type: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let artifact = normalize_path(artifact.as_ref());
        let plugin_dir = artifact
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            name: id.clone(),
            id,
            version: version.into(),
            artifact,
            entry_type: entry_type.into(),
            dependencies: Vec::new(),
            permissions: Capabilities::empty(),
            description: None,
            publisher: None,
            signature: None,
            manifest_path: None,
            plugin_dir,
            config_section: None,
            state: PluginState::Discovered,
        }
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_permissions(mut self, permissions: Capabilities) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Required dependency ids, in declaration order
    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(|dep| !dep.optional)
    }

    /// Configuration section name for this plugin
    pub fn config_key(&self) -> &str {
        self.config_section.as_deref().unwrap_or(&self.id)
    }

    /// Advance the descriptor's own state; returns false on a backwards move
    pub fn advance(&mut self, next: PluginState) -> bool {
        if next > self.state {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// Normalize a path: canonical if it exists, otherwise lexically cleaned
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
