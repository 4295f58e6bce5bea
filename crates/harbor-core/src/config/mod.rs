//! Host configuration with file persistence
//!
//! Resolved from `$HARBOR_CONFIG_DIR/config.toml`, falling back to the platform
//! config directory (`~/.config/harbor/config.toml` on Linux). A missing file
//! yields defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "HARBOR_CONFIG_DIR";

/// Environment variable with extra trusted signing keys (comma-separated base64)
pub const TRUSTED_KEYS_ENV: &str = "HARBOR_TRUSTED_KEYS";

/// Capability names accepted in manifests and in `loading.permission_ceiling`
pub const CAPABILITY_NAMES: &[&str] = &[
    "file_read",
    "file_write",
    "network",
    "process",
    "environment",
    "services",
    "message_bus",
    "host_control",
];

/// Harbor host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    pub discovery: DiscoveryConfig,
    pub loading: LoadingConfig,
    pub validation: ValidationConfig,
    pub health: HealthConfig,
    pub cache: CacheConfig,
    /// Per-plugin configuration sections, keyed by plugin id
    pub plugins: BTreeMap<String, toml::Table>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// File stem of manifest files (`plugin.json`, `plugin.toml`, ...)
    pub manifest_stem: String,
    pub max_manifest_bytes: u64,
    /// Number of manifests parsed concurrently
    pub parallelism: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            manifest_stem: "plugin".to_string(),
            max_manifest_bytes: 64 * 1024,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoadingConfig {
    /// Plugins loaded concurrently within one dependency wave
    pub max_parallel_loads: usize,
    /// Permits of the concurrency-limiting decorator
    pub max_concurrent_operations: usize,
    /// Reuse a module that is still resident instead of isolating a fresh copy
    pub prefer_resident_modules: bool,
    /// Capabilities a plugin may request; `None` means unrestricted
    pub permission_ceiling: Option<Vec<String>>,
    pub audit_capacity: usize,
    /// Fuel budget of each WebAssembly instance
    pub wasm_fuel: u64,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            max_parallel_loads: 4,
            max_concurrent_operations: 8,
            prefer_resident_modules: true,
            permission_ceiling: None,
            audit_capacity: 1024,
            wasm_fuel: 10_000_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Reject descriptors whose required dependencies were not discovered
    pub reject_unresolved_dependencies: bool,
    pub require_signatures: bool,
    /// Base64 ed25519 public keys
    pub trusted_keys: Vec<String>,
    /// Allowed artifact path prefixes; empty allows all
    pub allowed_paths: Vec<PathBuf>,
    /// Allowed publishers; empty allows all
    pub allowed_publishers: Vec<String>,
}

impl ValidationConfig {
    /// Trusted keys from the configuration plus `HARBOR_TRUSTED_KEYS`
    pub fn resolved_trusted_keys(&self) -> Vec<String> {
        merge_trusted_keys(&self.trusted_keys, env::var(TRUSTED_KEYS_ENV).ok().as_deref())
    }
}

/// Merge configured keys with a comma-separated list, dropping blanks and duplicates
pub fn merge_trusted_keys(configured: &[String], extra: Option<&str>) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let extra = extra.unwrap_or_default().split(',');
    for key in configured.iter().map(String::as_str).chain(extra) {
        let key = key.trim();
        if !key.is_empty() && !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

/// What the health monitor does once a plugin crosses the failure threshold
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    #[default]
    Reload,
    Unload,
    Log,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reload => write!(f, "reload"),
            Self::Unload => write!(f, "unload"),
            Self::Log => write!(f, "log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before recovery
    pub failure_threshold: u32,
    pub recovery_action: RecoveryAction,
    /// Recoveries attempted per plugin id before giving up
    pub max_recoveries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            failure_threshold: 3,
            recovery_action: RecoveryAction::Reload,
            max_recoveries: 3,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cached discovery result
    pub discovery_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            discovery_ttl_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_secs)
    }
}

impl HostConfig {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| Error::ConfigError("Could not determine config directory".into()))?
                .join("harbor")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the resolved path, or defaults if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: HostConfig = toml::from_str(&contents).map_err(|e| Error::ConfigParse {
            path: path.display().to_string(),
            reason: e.message().to_string(),
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded host configuration");
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Save configuration to the resolved path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.discovery.manifest_stem.trim().is_empty() {
            return Err(Error::ConfigError("discovery.manifest_stem must not be empty".into()));
        }
        if self.discovery.max_manifest_bytes == 0 {
            return Err(Error::ConfigError("discovery.max_manifest_bytes must be positive".into()));
        }
        if self.discovery.parallelism == 0 {
            return Err(Error::ConfigError("discovery.parallelism must be at least 1".into()));
        }
        if self.loading.max_parallel_loads == 0 {
            return Err(Error::ConfigError("loading.max_parallel_loads must be at least 1".into()));
        }
        if self.loading.max_concurrent_operations == 0 {
            return Err(Error::ConfigError(
                "loading.max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.loading.audit_capacity == 0 {
            return Err(Error::ConfigError("loading.audit_capacity must be at least 1".into()));
        }
        if let Some(ceiling) = &self.loading.permission_ceiling {
            if let Some(unknown) = ceiling.iter().find(|c| !CAPABILITY_NAMES.contains(&c.as_str())) {
                return Err(Error::ConfigError(format!(
                    "Unknown capability '{}' in loading.permission_ceiling. Valid options: {}",
                    unknown,
                    CAPABILITY_NAMES.join(", ")
                )));
            }
        }
        if self.health.failure_threshold == 0 {
            return Err(Error::ConfigError("health.failure_threshold must be at least 1".into()));
        }
        if self.health.interval_ms == 0 || self.health.probe_timeout_ms == 0 {
            return Err(Error::ConfigError(
                "health.interval_ms and health.probe_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Configuration section for one plugin
    pub fn plugin_section(&self, plugin_id: &str) -> Option<&toml::Table> {
        self.plugins.get(plugin_id)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "discovery.manifest_stem" => self.discovery.manifest_stem.clone(),
            "discovery.max_manifest_bytes" => self.discovery.max_manifest_bytes.to_string(),
            "discovery.parallelism" => self.discovery.parallelism.to_string(),

            "loading.max_parallel_loads" => self.loading.max_parallel_loads.to_string(),
            "loading.max_concurrent_operations" => {
                self.loading.max_concurrent_operations.to_string()
            }
            "loading.prefer_resident_modules" => self.loading.prefer_resident_modules.to_string(),
            "loading.permission_ceiling" => match &self.loading.permission_ceiling {
                Some(caps) => caps.join(", "),
                None => "(unrestricted)".to_string(),
            },
            "loading.audit_capacity" => self.loading.audit_capacity.to_string(),
            "loading.wasm_fuel" => self.loading.wasm_fuel.to_string(),

            "validation.reject_unresolved_dependencies" => {
                self.validation.reject_unresolved_dependencies.to_string()
            }
            "validation.require_signatures" => self.validation.require_signatures.to_string(),
            "validation.trusted_keys" => self.validation.resolved_trusted_keys().len().to_string(),
            "validation.allowed_paths" => self
                .validation
                .allowed_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "validation.allowed_publishers" => self.validation.allowed_publishers.join(", "),

            "health.enabled" => self.health.enabled.to_string(),
            "health.interval_ms" => self.health.interval_ms.to_string(),
            "health.probe_timeout_ms" => self.health.probe_timeout_ms.to_string(),
            "health.failure_threshold" => self.health.failure_threshold.to_string(),
            "health.recovery_action" => self.health.recovery_action.to_string(),
            "health.max_recoveries" => self.health.max_recoveries.to_string(),

            "cache.discovery_ttl_secs" => self.cache.discovery_ttl_secs.to_string(),

            _ => return Err(Error::UnknownConfigKey(key.to_string())),
        };
        Ok(value)
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        const KEYS: &[&str] = &[
            "discovery.manifest_stem",
            "discovery.max_manifest_bytes",
            "discovery.parallelism",
            "loading.max_parallel_loads",
            "loading.max_concurrent_operations",
            "loading.prefer_resident_modules",
            "loading.permission_ceiling",
            "loading.audit_capacity",
            "loading.wasm_fuel",
            "validation.reject_unresolved_dependencies",
            "validation.require_signatures",
            "validation.trusted_keys",
            "validation.allowed_paths",
            "validation.allowed_publishers",
            "health.enabled",
            "health.interval_ms",
            "health.probe_timeout_ms",
            "health.failure_threshold",
            "health.recovery_action",
            "health.max_recoveries",
            "cache.discovery_ttl_secs",
        ];

        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}
