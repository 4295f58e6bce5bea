//! Shared fixtures for host integration tests

#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use harbor_core::config::HostConfig;
use harbor_plugins::contract::factory;
use harbor_plugins::loader::BuiltinBackend;
use harbor_plugins::manifest::{ManifestDependency, PluginManifest};
use harbor_plugins::{HealthStatus, HostRuntime, Plugin, PluginContext, PluginRegistrar};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// File name every fixture artifact uses
pub const ARTIFACT: &str = "fixtures.plugin";

/// Lifecycle journal and health switchboard shared with fixture plugins
#[derive(Default)]
pub struct Probe {
    events: Mutex<Vec<String>>,
    health: Mutex<HashMap<String, HealthStatus>>,
}

impl Probe {
    pub fn record(&self, plugin_id: &str, event: &str) {
        self.events.lock().push(format!("{plugin_id}:{event}"));
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Events of one phase, as plugin ids in the order they happened
    pub fn order_of(&self, event: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.strip_suffix(&format!(":{event}")).map(str::to_string))
            .collect()
    }

    pub fn count(&self, plugin_id: &str, event: &str) -> usize {
        let needle = format!("{plugin_id}:{event}");
        self.events.lock().iter().filter(|e| **e == needle).count()
    }

    pub fn set_health(&self, plugin_id: &str, status: HealthStatus) {
        self.health.lock().insert(plugin_id.to_string(), status);
    }

    pub fn health(&self, plugin_id: &str) -> HealthStatus {
        self.health
            .lock()
            .get(plugin_id)
            .cloned()
            .unwrap_or(HealthStatus::Healthy)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    FailInit,
    FailEnable,
    FailDisable,
    /// Initialization waits until cancelled
    Slow,
}

pub struct Recording {
    probe: Arc<Probe>,
    behavior: Behavior,
    id: String,
}

impl Recording {
    fn new(probe: Arc<Probe>, behavior: Behavior) -> Self {
        Self {
            probe,
            behavior,
            id: String::new(),
        }
    }
}

#[async_trait]
impl Plugin for Recording {
    async fn initialize(
        &mut self,
        ctx: Arc<PluginContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.id = ctx.plugin_id().to_string();
        self.probe.record(&self.id, "initialize");
        match self.behavior {
            Behavior::FailInit => bail!("cannot open /home/operator/.harbor/state.db"),
            Behavior::Slow => {
                tokio::select! {
                    _ = cancel.cancelled() => bail!("initialization cancelled"),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    async fn on_enable(&mut self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.probe.record(&self.id, "enable");
        if self.behavior == Behavior::FailEnable {
            bail!("enable refused");
        }
        Ok(())
    }

    async fn on_disable(&mut self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.probe.record(&self.id, "disable");
        if self.behavior == Behavior::FailDisable {
            bail!("disable refused");
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        self.probe.health(&self.id)
    }

    async fn dispose(&mut self) -> anyhow::Result<()> {
        self.probe.record(&self.id, "dispose");
        Ok(())
    }
}

/// Builtin backend serving every fixture entry type from [`ARTIFACT`]
pub fn fixtures_backend(probe: &Arc<Probe>) -> Arc<BuiltinBackend> {
    let probe = Arc::clone(probe);
    Arc::new(
        BuiltinBackend::new().with_module(ARTIFACT, move |registrar: &mut dyn PluginRegistrar| {
            for (entry_type, behavior) in [
                ("Recording", Behavior::Normal),
                ("FailingInit", Behavior::FailInit),
                ("FailingEnable", Behavior::FailEnable),
                ("FailingDisable", Behavior::FailDisable),
                ("Slow", Behavior::Slow),
            ] {
                let probe = Arc::clone(&probe);
                registrar.register(
                    entry_type,
                    factory(move || Recording::new(Arc::clone(&probe), behavior)),
                );
            }
        }),
    )
}

/// Defaults with health probes off
pub fn quiet_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.health.enabled = false;
    config
}

pub fn host(config: HostConfig, probe: &Arc<Probe>) -> (Arc<HostRuntime>, Arc<BuiltinBackend>) {
    let backend = fixtures_backend(probe);
    let host = HostRuntime::builder(config)
        .with_backend(Arc::clone(&backend))
        .with_service(ProbeHandle(Arc::clone(probe)))
        .build()
        .expect("build host");
    (host, backend)
}

/// Host service exposing the probe to plugins that hold the services capability
pub struct ProbeHandle(pub Arc<Probe>);

/// Plugin directory under `root` with a JSON manifest and the fixture artifact
pub struct ManifestSpec<'a> {
    pub id: &'a str,
    pub version: &'a str,
    pub entry_type: &'a str,
    pub dependencies: Vec<ManifestDependency>,
    pub permissions: Vec<&'a str>,
    pub signature: Option<String>,
}

impl<'a> ManifestSpec<'a> {
    pub fn new(id: &'a str) -> Self {
        Self {
            id,
            version: "1.0.0",
            entry_type: "Recording",
            dependencies: Vec::new(),
            permissions: Vec::new(),
            signature: None,
        }
    }

    pub fn entry_type(mut self, entry_type: &'a str) -> Self {
        self.entry_type = entry_type;
        self
    }

    pub fn version(mut self, version: &'a str) -> Self {
        self.version = version;
        self
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.dependencies.push(ManifestDependency {
            id: id.to_string(),
            optional: false,
            version: None,
        });
        self
    }

    pub fn depends_on_version(mut self, id: &str, req: &str) -> Self {
        self.dependencies.push(ManifestDependency {
            id: id.to_string(),
            optional: false,
            version: Some(req.to_string()),
        });
        self
    }

    pub fn permissions(mut self, names: &[&'a str]) -> Self {
        self.permissions = names.to_vec();
        self
    }

    pub fn signature(mut self, signature: String) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Write `<root>/<id>/plugin.json` and the artifact; returns the manifest path
    pub fn write(self, root: &Path) -> PathBuf {
        let dir = root.join(self.id);
        fs::create_dir_all(&dir).expect("create plugin dir");
        let artifact = dir.join(ARTIFACT);
        if !artifact.exists() {
            fs::write(&artifact, format!("fixture module for {}", self.id)).expect("write artifact");
        }

        let mut manifest = PluginManifest::new(self.id, self.version, ARTIFACT, self.entry_type);
        manifest.dependencies = self.dependencies;
        manifest.permissions = self.permissions.iter().map(|p| p.to_string()).collect();
        manifest.signature = self.signature;

        let path = dir.join("plugin.json");
        fs::write(
            &path,
            serde_json::to_string_pretty(&manifest).expect("render manifest"),
        )
        .expect("write manifest");
        path
    }
}

/// Poll `check` every 10 ms until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
