//! Plugin manifests and their serializers
//!
//! A manifest is the on-disk form of a [`PluginDescriptor`]. The format is chosen by
//! file extension through a [`SerializerRegistry`]; JSON, TOML and YAML ship by
//! default and further formats can be registered by the embedding application.

use crate::capability::Capabilities;
use crate::descriptor::{DependencySpec, PluginDescriptor, PluginState, normalize_path};
use crate::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Manifest file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: String,
    /// Artifact path, relative to the manifest's directory
    pub artifact: String,
    pub entry_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ManifestDependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Configuration section name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDependency {
    pub id: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PluginManifest {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        artifact: impl Into<String>,
        entry_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            version: version.into(),
            artifact: artifact.into(),
            entry_type: entry_type.into(),
            dependencies: Vec::new(),
            permissions: Vec::new(),
            description: None,
            publisher: None,
            signature: None,
            config: None,
        }
    }

    /// Convert into a descriptor, resolving paths relative to the manifest file
    pub fn into_descriptor(self, manifest_path: &Path) -> PluginResult<PluginDescriptor> {
        self.check_fields(manifest_path)?;

        let permissions = Capabilities::parse_names(&self.permissions)
            .map_err(|e| PluginError::manifest(manifest_path, e))?;

        let manifest_path = normalize_path(manifest_path);
        let plugin_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| PluginError::manifest(&manifest_path, "manifest path has no parent"))?;
        let artifact = normalize_path(&plugin_dir.join(&self.artifact));

        let dependencies = self
            .dependencies
            .into_iter()
            .map(|dep| DependencySpec {
                plugin_id: dep.id,
                optional: dep.optional,
                version_req: dep.version,
            })
            .collect();

        Ok(PluginDescriptor {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            version: self.version,
            artifact,
            entry_type: self.entry_type,
            dependencies,
            permissions,
            description: self.description,
            publisher: self.publisher,
            signature: self.signature,
            manifest_path: Some(manifest_path),
            plugin_dir,
            config_section: self.config,
            state: PluginState::Discovered,
        })
    }

    fn check_fields(&self, manifest_path: &Path) -> PluginResult<()> {
        for (field, value) in [
            ("id", &self.id),
            ("version", &self.version),
            ("artifact", &self.artifact),
            ("entry_type", &self.entry_type),
        ] {
            if value.trim().is_empty() {
                return Err(PluginError::manifest(
                    manifest_path,
                    format!("field '{}' cannot be empty", field),
                ));
            }
        }

        if !is_valid_id(&self.id) {
            return Err(PluginError::manifest(
                manifest_path,
                format!(
                    "invalid plugin id '{}': use letters, digits, '.', '-' or '_'",
                    self.id
                ),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep.id.as_str()) {
                return Err(PluginError::manifest(
                    manifest_path,
                    format!("dependency '{}' is declared twice", dep.id),
                ));
            }
        }

        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

impl From<&PluginDescriptor> for PluginManifest {
    fn from(descriptor: &PluginDescriptor) -> Self {
        let artifact = descriptor
            .artifact
            .strip_prefix(&descriptor.plugin_dir)
            .unwrap_or(&descriptor.artifact)
            .display()
            .to_string();
        Self {
            id: descriptor.id.clone(),
            name: Some(descriptor.name.clone()),
            version: descriptor.version.clone(),
            artifact,
            entry_type: descriptor.entry_type.clone(),
            dependencies: descriptor
                .dependencies
                .iter()
                .map(|dep| ManifestDependency {
                    id: dep.plugin_id.clone(),
                    optional: dep.optional,
                    version: dep.version_req.clone(),
                })
                .collect(),
            permissions: descriptor
                .permissions
                .names()
                .into_iter()
                .map(String::from)
                .collect(),
            description: descriptor.description.clone(),
            publisher: descriptor.publisher.clone(),
            signature: descriptor.signature.clone(),
            config: descriptor.config_section.clone(),
        }
    }
}

/// A manifest format
pub trait ManifestSerializer: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extensions handled, without the dot
    fn extensions(&self) -> &'static [&'static str];

    fn parse(&self, contents: &str) -> Result<PluginManifest, String>;

    fn render(&self, manifest: &PluginManifest) -> Result<String, String>;
}

pub struct JsonSerializer;

impl ManifestSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn parse(&self, contents: &str) -> Result<PluginManifest, String> {
        serde_json::from_str(contents).map_err(|e| format!("invalid JSON: {e}"))
    }

    fn render(&self, manifest: &PluginManifest) -> Result<String, String> {
        serde_json::to_string_pretty(manifest).map_err(|e| e.to_string())
    }
}

pub struct TomlSerializer;

impl ManifestSerializer for TomlSerializer {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["toml"]
    }

    fn parse(&self, contents: &str) -> Result<PluginManifest, String> {
        toml::from_str(contents).map_err(|e| format!("invalid TOML: {}", e.message()))
    }

    fn render(&self, manifest: &PluginManifest) -> Result<String, String> {
        toml::to_string_pretty(manifest).map_err(|e| e.to_string())
    }
}

pub struct YamlSerializer;

impl ManifestSerializer for YamlSerializer {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["yaml", "yml"]
    }

    fn parse(&self, contents: &str) -> Result<PluginManifest, String> {
        serde_yaml::from_str(contents).map_err(|e| format!("invalid YAML: {e}"))
    }

    fn render(&self, manifest: &PluginManifest) -> Result<String, String> {
        serde_yaml::to_string(manifest).map_err(|e| e.to_string())
    }
}

/// Serializers keyed by file extension
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: Vec<Arc<dyn ManifestSerializer>>,
}

impl SerializerRegistry {
    /// Registry without any format
    pub fn empty() -> Self {
        Self {
            serializers: Vec::new(),
        }
    }

    /// Registry with JSON, TOML and YAML
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonSerializer));
        registry.register(Arc::new(TomlSerializer));
        registry.register(Arc::new(YamlSerializer));
        registry
    }

    /// Register a serializer; later registrations win for shared extensions
    pub fn register(&mut self, serializer: Arc<dyn ManifestSerializer>) {
        self.serializers.insert(0, serializer);
    }

    pub fn for_extension(&self, extension: &str) -> Option<Arc<dyn ManifestSerializer>> {
        self.serializers
            .iter()
            .find(|s| {
                s.extensions()
                    .iter()
                    .any(|ext| ext.eq_ignore_ascii_case(extension))
            })
            .cloned()
    }

    pub fn for_path(&self, path: &Path) -> Option<Arc<dyn ManifestSerializer>> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.for_extension(ext))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.serializers.iter().map(|s| s.name()).collect()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("serializers", &self.names())
            .finish()
    }
}
