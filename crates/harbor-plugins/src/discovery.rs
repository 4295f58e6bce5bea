//! Plugin discovery
//!
//! Walks a directory tree for manifest files (`plugin.json`, `plugin.toml`,
//! `plugin.yaml`, ...) and turns each into a [`PluginDescriptor`]. Manifests are
//! parsed on blocking workers with bounded parallelism; results keep the
//! lexicographic walk order so repeated scans of an unchanged tree are equal.

use crate::descriptor::PluginDescriptor;
use crate::manifest::SerializerRegistry;
use crate::{PluginError, PluginResult};
use futures_util::{StreamExt, stream};
use harbor_core::config::DiscoveryConfig;
use harbor_core::sanitize::sanitize_detail;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A manifest that was skipped during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryIssue {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub root: PathBuf,
    pub descriptors: Vec<PluginDescriptor>,
    pub issues: Vec<DiscoveryIssue>,
}

/// Manifest scanner
#[derive(Debug, Clone)]
pub struct Discovery {
    config: DiscoveryConfig,
    serializers: Arc<SerializerRegistry>,
}

enum Candidate {
    Manifest(PathBuf),
    Skipped(DiscoveryIssue),
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, serializers: Arc<SerializerRegistry>) -> Self {
        Self {
            config,
            serializers,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Scan `root` recursively for manifests
    pub async fn discover(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> PluginResult<DiscoveryReport> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let start = Instant::now();
        let root = tokio::fs::canonicalize(root).await?;
        if !root.is_dir() {
            return Err(PluginError::NotFound(sanitize_detail(&root.display().to_string())));
        }

        let candidates = {
            let root = root.clone();
            let stem = self.config.manifest_stem.clone();
            let serializers = Arc::clone(&self.serializers);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || walk(&root, &stem, &serializers, &cancel))
                .await
                .map_err(|e| PluginError::Io(format!("discovery worker failed: {e}")))??
        };

        let mut descriptors = Vec::new();
        let mut issues = Vec::new();
        let mut manifests = Vec::new();
        for candidate in candidates {
            match candidate {
                Candidate::Manifest(path) => manifests.push(path),
                Candidate::Skipped(issue) => issues.push(issue),
            }
        }

        let max_bytes = self.config.max_manifest_bytes;
        let pending: Vec<_> = manifests
            .into_iter()
            .map(|path| parse_on_worker(path, Arc::clone(&self.serializers), max_bytes))
            .collect();
        let mut parsed = stream::iter(pending).buffered(self.config.parallelism.max(1));

        while let Some((path, result)) = parsed.next().await {
            if cancel.is_cancelled() {
                return Err(PluginError::Cancelled);
            }
            match result {
                Ok(descriptor) => {
                    debug!(plugin_id = %descriptor.id, manifest = %path.display(), "Discovered plugin");
                    descriptors.push(descriptor);
                }
                Err(reason) => {
                    let reason = sanitize_detail(&reason);
                    warn!(manifest = %path.display(), reason = %reason, "Skipping malformed manifest");
                    issues.push(DiscoveryIssue { path, reason });
                }
            }
        }

        info!(
            root = %root.display(),
            plugins = descriptors.len(),
            skipped = issues.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Discovery complete"
        );

        Ok(DiscoveryReport {
            root,
            descriptors,
            issues,
        })
    }

    /// Parse a single manifest file
    pub async fn load_manifest(&self, path: &Path) -> PluginResult<PluginDescriptor> {
        let path = tokio::fs::canonicalize(path).await?;
        let serializers = Arc::clone(&self.serializers);
        let max_bytes = self.config.max_manifest_bytes;
        let worker_path = path.clone();
        tokio::task::spawn_blocking(move || read_manifest(&worker_path, &serializers, max_bytes))
            .await
            .map_err(|e| PluginError::Io(format!("manifest worker failed: {e}")))?
            .map_err(|reason| PluginError::manifest(&path, reason))
    }
}

fn walk(
    root: &Path,
    stem: &str,
    serializers: &SerializerRegistry,
    cancel: &CancellationToken,
) -> PluginResult<Vec<Candidate>> {
    let mut candidates = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                warn!(path = %path.display(), error = %e, "Unreadable entry during discovery");
                candidates.push(Candidate::Skipped(DiscoveryIssue {
                    path,
                    reason: sanitize_detail(&e.to_string()),
                }));
                continue;
            }
        };

        let path = entry.path();
        let is_manifest_name = path.file_stem().and_then(|s| s.to_str()) == Some(stem)
            && serializers.for_path(path).is_some();
        if !is_manifest_name {
            continue;
        }

        if entry.path_is_symlink() {
            warn!(manifest = %path.display(), "Skipping symlinked manifest");
            candidates.push(Candidate::Skipped(DiscoveryIssue {
                path: path.to_path_buf(),
                reason: "manifest paths cannot be symlinks".to_string(),
            }));
            continue;
        }

        if entry.file_type().is_file() {
            candidates.push(Candidate::Manifest(path.to_path_buf()));
        }
    }

    Ok(candidates)
}

async fn parse_on_worker(
    path: PathBuf,
    serializers: Arc<SerializerRegistry>,
    max_bytes: u64,
) -> (PathBuf, Result<PluginDescriptor, String>) {
    let worker_path = path.clone();
    let result = tokio::task::spawn_blocking(move || read_manifest(&worker_path, &serializers, max_bytes))
        .await
        .unwrap_or_else(|e| Err(format!("manifest worker failed: {e}")));
    (path, result)
}

fn read_manifest(
    path: &Path,
    serializers: &SerializerRegistry,
    max_bytes: u64,
) -> Result<PluginDescriptor, String> {
    let serializer = serializers
        .for_path(path)
        .ok_or_else(|| "no serializer for manifest extension".to_string())?;

    let metadata = fs::symlink_metadata(path).map_err(|e| e.to_string())?;
    if metadata.file_type().is_symlink() {
        return Err("manifest paths cannot be symlinks".to_string());
    }
    if metadata.len() > max_bytes {
        return Err(format!(
            "manifest too large: {} bytes (limit {})",
            metadata.len(),
            max_bytes
        ));
    }

    let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let manifest = serializer.parse(&contents)?;
    manifest
        .into_descriptor(path)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn discovery() -> Discovery {
        Discovery::new(
            DiscoveryConfig::default(),
            Arc::new(SerializerRegistry::with_defaults()),
        )
    }

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        fs::write(path, contents).expect("write");
    }

    fn populate(dir: &Path) {
        write(
            dir,
            "b-meter/plugin.toml",
            "id = \"meter\"\nversion = \"1.0.0\"\nartifact = \"meter.wasm\"\nentry_type = \"Meter\"\n",
        );
        write(
            dir,
            "a-clock/plugin.json",
            r#"{"id": "clock", "version": "2.1.0", "artifact": "clock.so", "entry_type": "Clock"}"#,
        );
        write(
            dir,
            "c-theme/nested/plugin.yaml",
            "id: theme\nversion: 0.3.0\nartifact: theme.wasm\nentry_type: Theme\n",
        );
        write(dir, "c-theme/README.md", "not a manifest");
    }

    #[tokio::test]
    async fn test_discovers_all_formats_in_walk_order() {
        let dir = TempDir::new().expect("temp dir");
        populate(dir.path());

        let report = discovery()
            .discover(dir.path(), &CancellationToken::new())
            .await
            .expect("discover");

        let ids: Vec<_> = report.descriptors.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["clock", "meter", "theme"]);
        assert!(report.issues.is_empty());
        assert!(report.descriptors[2].artifact.ends_with("c-theme/nested/theme.wasm"));
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        populate(dir.path());
        let discovery = discovery();
        let cancel = CancellationToken::new();

        let first = discovery.discover(dir.path(), &cancel).await.expect("first");
        let second = discovery.discover(dir.path(), &cancel).await.expect("second");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        populate(dir.path());
        write(dir.path(), "d-broken/plugin.json", "{ not json");
        write(
            dir.path(),
            "e-huge/plugin.json",
            &format!("{{\"pad\": \"{}\"}}", "x".repeat(70 * 1024)),
        );

        let report = discovery()
            .discover(dir.path(), &CancellationToken::new())
            .await
            .expect("discover");

        assert_eq!(report.descriptors.len(), 3);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[0].reason.contains("invalid JSON"));
        assert!(report.issues[1].reason.contains("too large"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_manifest_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let outside = TempDir::new().expect("outside dir");
        write(
            outside.path(),
            "plugin.json",
            r#"{"id": "sneaky", "version": "1.0.0", "artifact": "x.so", "entry_type": "X"}"#,
        );
        fs::create_dir_all(dir.path().join("link")).expect("create dir");
        std::os::unix::fs::symlink(
            outside.path().join("plugin.json"),
            dir.path().join("link/plugin.json"),
        )
        .expect("symlink");

        let report = discovery()
            .discover(dir.path(), &CancellationToken::new())
            .await
            .expect("discover");
        assert!(report.descriptors.is_empty());
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].reason.contains("symlink"));
    }

    #[tokio::test]
    async fn test_cancelled_discovery() {
        let dir = TempDir::new().expect("temp dir");
        populate(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = discovery().discover(dir.path(), &cancel).await.unwrap_err();
        assert_eq!(err, PluginError::Cancelled);
    }

    #[tokio::test]
    async fn test_load_single_manifest() {
        let dir = TempDir::new().expect("temp dir");
        populate(dir.path());
        let descriptor = discovery()
            .load_manifest(&dir.path().join("a-clock/plugin.json"))
            .await
            .expect("load");
        assert_eq!(descriptor.id, "clock");

        let err = discovery()
            .load_manifest(&dir.path().join("c-theme/README.md"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E101");
    }
}
