//! Harbor host integration tests
//!
//! Drive the full discover → validate → order → load → unload path against
//! builtin fixture modules.

mod common;

use common::{ARTIFACT, ManifestSpec, Probe, ProbeHandle, eventually, host, quiet_config};
use ed25519_dalek::SigningKey;
use harbor_core::config::RecoveryAction;
use harbor_plugins::signature::{encode_public_key, sign_artifact};
use harbor_plugins::{
    Capabilities, CachingHost, ConcurrencyLimitedHost, HealthStatus, PluginDescriptor,
    PluginError, PluginHost, PluginSource, PluginState, Verdict,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn chain(root: &std::path::Path) {
    ManifestSpec::new("storage").write(root);
    ManifestSpec::new("engine").depends_on("storage").write(root);
    ManifestSpec::new("ui").depends_on("engine").write(root);
}

#[tokio::test]
async fn test_dependency_chain_loads_in_order() {
    let dir = TempDir::new().expect("temp dir");
    chain(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    let report = host
        .discover_and_load(dir.path(), &CancellationToken::new())
        .await
        .expect("batch load");

    assert!(report.is_clean(), "unexpected report: {report:?}");
    assert_eq!(report.order, vec!["storage", "engine", "ui"]);
    assert_eq!(probe.order_of("initialize"), vec!["storage", "engine", "ui"]);
    assert_eq!(probe.order_of("enable"), vec!["storage", "engine", "ui"]);
    assert_eq!(host.loaded_ids().await, vec!["engine", "storage", "ui"]);

    for id in ["storage", "engine", "ui"] {
        let plugin = host.plugin(id).await.expect("loaded");
        assert_eq!(plugin.state(), PluginState::Running);
    }
}

#[tokio::test]
async fn test_missing_dependency_aborts_batch() {
    let dir = TempDir::new().expect("temp dir");
    chain(dir.path());
    fs::remove_file(dir.path().join("engine/plugin.json")).expect("remove manifest");
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    let err = host
        .discover_and_load(dir.path(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PluginError::DependencyMissing {
            plugin_id: "ui".into(),
            dependency: "engine".into(),
        }
    );
    assert!(probe.events().is_empty());
    assert!(host.loaded_ids().await.is_empty());
    assert!(host.audit_log().is_empty());
}

#[tokio::test]
async fn test_cycle_aborts_batch() {
    let dir = TempDir::new().expect("temp dir");
    ManifestSpec::new("left").depends_on("right").write(dir.path());
    ManifestSpec::new("right").depends_on("left").write(dir.path());
    ManifestSpec::new("bystander").write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    let err = host
        .discover_and_load(dir.path(), &CancellationToken::new())
        .await
        .unwrap_err();

    let PluginError::CycleDetected { cycle } = err else {
        panic!("expected a cycle, got {err:?}");
    };
    assert!(cycle.contains(&"left".to_string()));
    assert!(cycle.contains(&"right".to_string()));
    assert!(probe.events().is_empty());
}

#[tokio::test]
async fn test_version_mismatch_aborts_batch() {
    let dir = TempDir::new().expect("temp dir");
    ManifestSpec::new("storage").version("1.4.0").write(dir.path());
    ManifestSpec::new("engine")
        .depends_on_version("storage", "^2.0")
        .write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    let err = host
        .discover_and_load(dir.path(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E201");
    assert!(host.loaded_ids().await.is_empty());
}

#[tokio::test]
async fn test_load_plugin_is_idempotent() {
    let dir = TempDir::new().expect("temp dir");
    let manifest = ManifestSpec::new("meter").write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, backend) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();

    let first = host
        .load_plugin(manifest.clone().into(), &cancel)
        .await
        .expect("first load");
    let second = host
        .load_plugin(manifest.into(), &cancel)
        .await
        .expect("second load");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.instance_id(), second.instance_id());
    assert_eq!(probe.count("meter", "initialize"), 1);
    assert_eq!(backend.load_count(), 1);
}

#[tokio::test]
async fn test_unload_then_load_yields_fresh_instance() {
    let dir = TempDir::new().expect("temp dir");
    let manifest = ManifestSpec::new("meter").write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();
    let mut bus = host.bus().subscribe_to("host.plugin.*");

    let first = host
        .load_plugin(manifest.clone().into(), &cancel)
        .await
        .expect("load");
    let generation = host.lifecycle_generation();
    assert!(host.unload_plugin("meter", &cancel).await.expect("unload"));
    assert!(!host.unload_plugin("meter", &cancel).await.expect("second unload"));
    assert_eq!(host.lifecycle_generation(), generation + 1);
    assert_eq!(first.state(), PluginState::Unloading);

    let second = host
        .load_plugin(manifest.into(), &cancel)
        .await
        .expect("reload");
    assert_ne!(first.instance_id(), second.instance_id());
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(
        probe.events(),
        vec![
            "meter:initialize",
            "meter:enable",
            "meter:disable",
            "meter:dispose",
            "meter:initialize",
            "meter:enable",
        ]
    );

    let topics: Vec<String> = (0..3)
        .map(|_| bus.try_recv().expect("lifecycle message").topic)
        .collect();
    assert_eq!(
        topics,
        vec!["host.plugin.loaded", "host.plugin.unloaded", "host.plugin.loaded"]
    );
}

#[tokio::test]
async fn test_unload_continues_past_disable_failure() {
    let dir = TempDir::new().expect("temp dir");
    let manifest = ManifestSpec::new("stubborn")
        .entry_type("FailingDisable")
        .write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();

    host.load_plugin(manifest.into(), &cancel)
        .await
        .expect("load");
    assert!(host.unload_plugin("stubborn", &cancel).await.expect("unload"));

    assert_eq!(probe.count("stubborn", "dispose"), 1);
    assert!(host.plugin("stubborn").await.is_none());
    assert!(host.permissions().granted("stubborn").is_none());
    assert!(host.loader().arena().is_empty());
}

#[tokio::test]
async fn test_permission_ceiling_denies_load() {
    let dir = TempDir::new().expect("temp dir");
    let manifest = ManifestSpec::new("exfiltrator")
        .permissions(&["message_bus", "network"])
        .write(dir.path());
    let mut config = quiet_config();
    config.loading.permission_ceiling = Some(vec!["message_bus".into(), "file_read".into()]);
    let probe = Arc::new(Probe::default());
    let (host, backend) = host(config, &probe);

    let err = host
        .load_plugin(manifest.into(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E400");
    assert!(matches!(err, PluginError::PermissionDenied { .. }));
    assert!(host.permissions().granted("exfiltrator").is_none());
    assert!(probe.events().is_empty());
    assert_eq!(backend.load_count(), 0);

    let audit = host.audit_log();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].verdict, Verdict::Denied);
    assert_eq!(audit[0].capability, Capabilities::NETWORK);
}

#[tokio::test]
async fn test_failed_initialize_does_not_block_siblings() {
    let dir = TempDir::new().expect("temp dir");
    ManifestSpec::new("broken")
        .entry_type("FailingInit")
        .write(dir.path());
    ManifestSpec::new("dependent")
        .depends_on("broken")
        .write(dir.path());
    ManifestSpec::new("healthy").write(dir.path());
    ManifestSpec::new("refuser")
        .entry_type("FailingEnable")
        .write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    let report = host
        .discover_and_load(dir.path(), &CancellationToken::new())
        .await
        .expect("batch completes");

    assert_eq!(report.loaded, vec!["healthy"]);
    assert_eq!(report.skipped, vec!["dependent"]);

    let broken = report.failure("broken").expect("init failure recorded");
    assert_eq!(broken.code, "E500");
    assert_eq!(broken.phase, "initialize");
    assert!(!broken.message.contains("/home/operator"));

    let refuser = report.failure("refuser").expect("enable failure recorded");
    assert_eq!(refuser.code, "E501");
    // A failed enable still disposes the instance
    assert_eq!(probe.count("refuser", "dispose"), 1);

    assert_eq!(host.loaded_ids().await, vec!["healthy"]);
    assert!(host.permissions().granted("broken").is_none());
    assert!(host.permissions().granted("refuser").is_none());
    assert_eq!(probe.count("dependent", "initialize"), 0);
}

#[tokio::test]
async fn test_unload_purges_and_sweep_drops_modified_artifacts() {
    let dir = TempDir::new().expect("temp dir");
    let manifest = ManifestSpec::new("meter").write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, backend) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();

    let first = host
        .load_plugin(manifest.clone().into(), &cancel)
        .await
        .expect("load");
    assert!(!first.reused_module());
    host.unload_plugin("meter", &cancel).await.expect("unload");

    let second = host
        .load_plugin(manifest.clone().into(), &cancel)
        .await
        .expect("load again");
    assert_eq!(backend.load_count(), 2, "unload purges the cached module");
    drop(first);

    let artifact = dir.path().join("meter").join(ARTIFACT);
    let file = fs::OpenOptions::new()
        .write(true)
        .open(&artifact)
        .expect("open artifact");
    file.set_modified(std::time::SystemTime::now() + Duration::from_secs(120))
        .expect("set mtime");

    let swept = host.sweep_module_cache();
    assert_eq!(swept.len(), 1);
    assert!(host.loader().module_cache().is_empty());
    drop(second);
}

#[tokio::test]
async fn test_shared_artifact_reuses_resident_module() {
    let dir = TempDir::new().expect("temp dir");
    let artifact = dir.path().join(ARTIFACT);
    fs::write(&artifact, b"shared").expect("write artifact");
    let probe = Arc::new(Probe::default());
    let (host, backend) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();

    let left = host
        .load_plugin(
            PluginDescriptor::new("left", "1.0.0", &artifact, "Recording").into(),
            &cancel,
        )
        .await
        .expect("load left");
    let right = host
        .load_plugin(
            PluginDescriptor::new("right", "1.0.0", &artifact, "Recording").into(),
            &cancel,
        )
        .await
        .expect("load right");

    assert_eq!(backend.load_count(), 1);
    assert!(!left.reused_module());
    assert!(right.reused_module());
    assert!(right.isolation().is_none());
    assert_eq!(host.loader().factory_cache().stats().hits, 1);
}

#[tokio::test]
async fn test_isolation_without_resident_reuse() {
    let dir = TempDir::new().expect("temp dir");
    let artifact = dir.path().join(ARTIFACT);
    fs::write(&artifact, b"shared").expect("write artifact");
    let mut config = quiet_config();
    config.loading.prefer_resident_modules = false;
    let probe = Arc::new(Probe::default());
    let (host, backend) = host(config, &probe);
    let cancel = CancellationToken::new();

    for id in ["left", "right"] {
        host.load_plugin(
            PluginDescriptor::new(id, "1.0.0", &artifact, "Recording").into(),
            &cancel,
        )
        .await
        .expect("load");
    }
    assert_eq!(backend.load_count(), 2);
    assert_eq!(host.loader().arena().len(), 2);

    let unloaded = host.unload_all(&cancel).await.expect("unload all");
    assert_eq!(unloaded.len(), 2);
    assert!(host.loader().arena().is_empty());
}

#[tokio::test]
async fn test_unload_all_stops_dependents_first() {
    let dir = TempDir::new().expect("temp dir");
    chain(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();

    host.discover_and_load(dir.path(), &cancel)
        .await
        .expect("load");
    let unloaded = host.unload_all(&cancel).await.expect("unload all");

    assert_eq!(unloaded, vec!["ui", "engine", "storage"]);
    assert_eq!(probe.order_of("disable"), vec!["ui", "engine", "storage"]);
    assert!(host.loaded_ids().await.is_empty());
}

#[tokio::test]
async fn test_signed_artifacts() {
    let dir = TempDir::new().expect("temp dir");
    let key = SigningKey::from_bytes(&[11u8; 32]);

    ManifestSpec::new("signed").write(dir.path());
    let signature =
        sign_artifact(&dir.path().join("signed").join(ARTIFACT), &key).expect("sign artifact");
    ManifestSpec::new("signed").signature(signature).write(dir.path());
    ManifestSpec::new("unsigned").write(dir.path());

    let mut config = quiet_config();
    config.validation.require_signatures = true;
    config.validation.trusted_keys = vec![encode_public_key(&key.verifying_key())];
    let probe = Arc::new(Probe::default());
    let (host, _) = host(config, &probe);

    let report = host
        .discover_and_load(dir.path(), &CancellationToken::new())
        .await
        .expect("batch");
    assert_eq!(report.loaded, vec!["signed"]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].plugin_id, "unsigned");
    assert_eq!(report.rejected[0].failures[0].rule, "signature");
}

#[tokio::test]
async fn test_services_resolve_through_host() {
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    let handle = host.get_service::<ProbeHandle>().expect("probe service");
    assert!(Arc::ptr_eq(&handle.0, &probe));
    assert_eq!(host.get_service::<String>().unwrap_err().code(), "E301");
}

#[tokio::test]
async fn test_cancelled_batch_leaves_running_plugins() {
    let dir = TempDir::new().expect("temp dir");
    let resident = ManifestSpec::new("resident").write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    host.load_plugin(resident.into(), &CancellationToken::new())
        .await
        .expect("load resident");

    let batch = TempDir::new().expect("temp dir");
    ManifestSpec::new("late").write(batch.path());
    let discovered = host
        .discover(batch.path(), &CancellationToken::new())
        .await
        .expect("discover");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = host
        .load_discovered(discovered.descriptors, &cancel)
        .await
        .expect("cancelled batch still reports");

    assert_eq!(report.cancelled, vec!["late"]);
    assert!(report.loaded.is_empty());
    assert_eq!(host.loaded_ids().await, vec!["resident"]);
    assert_eq!(
        host.plugin("resident").await.expect("resident").state(),
        PluginState::Running
    );
}

#[tokio::test]
async fn test_cancel_during_initialize() {
    let dir = TempDir::new().expect("temp dir");
    let manifest = ManifestSpec::new("sluggish")
        .entry_type("Slow")
        .write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = host
        .load_plugin(PluginSource::Manifest(manifest), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E500");
    assert!(host.plugin("sluggish").await.is_none());
    assert_eq!(probe.count("sluggish", "dispose"), 1);
    assert!(host.permissions().granted("sluggish").is_none());
}

#[tokio::test]
async fn test_caching_decorator_rescans_after_unload() {
    let dir = TempDir::new().expect("temp dir");
    ManifestSpec::new("meter").write(dir.path());
    let probe = Arc::new(Probe::default());
    let (runtime, _) = host(quiet_config(), &probe);
    let limited = Arc::new(ConcurrencyLimitedHost::from_runtime(runtime));
    let host = CachingHost::new(limited, Duration::from_secs(60));
    let cancel = CancellationToken::new();

    let report = host
        .discover_and_load(dir.path(), &cancel)
        .await
        .expect("load");
    assert_eq!(report.loaded, vec!["meter"]);

    ManifestSpec::new("gauge").write(dir.path());
    let cached = host.discover(dir.path(), &cancel).await.expect("discover");
    assert_eq!(cached.descriptors.len(), 1);
    assert_eq!(host.stats().hits, 1);

    host.unload_plugin("meter", &cancel).await.expect("unload");
    let fresh = host.discover(dir.path(), &cancel).await.expect("discover");
    assert_eq!(fresh.descriptors.len(), 2);
    assert_eq!(host.stats().misses, 2);
}

#[tokio::test]
async fn test_unhealthy_plugin_is_reloaded() {
    let dir = TempDir::new().expect("temp dir");
    let manifest = ManifestSpec::new("flaky").write(dir.path());
    let mut config = quiet_config();
    config.health.enabled = true;
    config.health.interval_ms = 20;
    config.health.probe_timeout_ms = 200;
    config.health.failure_threshold = 2;
    config.health.recovery_action = RecoveryAction::Reload;
    config.health.max_recoveries = 1;
    let probe = Arc::new(Probe::default());
    let (host, _) = host(config, &probe);
    let mut recovered = host.bus().subscribe_to("host.plugin.recovered");

    let original = host
        .load_plugin(manifest.into(), &CancellationToken::new())
        .await
        .expect("load");
    let original_id = original.instance_id();
    drop(original);
    assert!(host.health().is_monitoring("flaky"));

    probe.set_health("flaky", HealthStatus::Unhealthy("queue stalled".into()));
    let reloaded = eventually(Duration::from_secs(5), || {
        let host = Arc::clone(&host);
        async move {
            host.plugin("flaky")
                .await
                .is_some_and(|p| p.instance_id() != original_id && p.state() == PluginState::Running)
        }
    })
    .await;
    assert!(reloaded, "plugin was not reloaded");

    let message = tokio::time::timeout(Duration::from_secs(5), recovered.recv())
        .await
        .expect("recovery announced")
        .expect("message");
    assert_eq!(message.payload["plugin_id"], "flaky");
    assert_eq!(probe.count("flaky", "initialize"), 2);

    let recorded = eventually(Duration::from_secs(5), || {
        let host = Arc::clone(&host);
        async move {
            host.health_snapshot()
                .get("flaky")
                .is_some_and(|r| r.recoveries == 1 && r.last_recovery.is_some())
        }
    })
    .await;
    assert!(recorded);

    // Recovery budget is spent, so later failures leave the plugin in place
    let current = host.plugin("flaky").await.expect("running").instance_id();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        host.plugin("flaky").await.expect("still running").instance_id(),
        current
    );
    host.unload_all(&CancellationToken::new())
        .await
        .expect("shutdown");
}

#[tokio::test]
async fn test_reload_rejects_version_dependents_do_not_accept() {
    let dir = TempDir::new().expect("temp dir");
    ManifestSpec::new("core").write(dir.path());
    ManifestSpec::new("ui")
        .depends_on_version("core", "^1")
        .write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();

    host.discover_and_load(dir.path(), &cancel)
        .await
        .expect("load");
    let before = host.plugin("core").await.expect("core").instance_id();

    ManifestSpec::new("core").version("2.0.0").write(dir.path());
    let err = host.reload_plugin("core", &cancel).await.unwrap_err();
    assert_eq!(
        err,
        PluginError::DependencyVersionMismatch {
            plugin_id: "ui".into(),
            dependency: "core".into(),
            required: "^1".into(),
            found: "2.0.0".into(),
        }
    );

    let core = host.plugin("core").await.expect("core still running");
    assert_eq!(core.instance_id(), before);
    assert_eq!(core.descriptor().version, "1.0.0");
    assert_eq!(probe.count("core", "disable"), 0);
    assert_eq!(host.loaded_ids().await, vec!["core", "ui"]);
}

#[tokio::test]
async fn test_unload_all_ignores_version_requirements() {
    let dir = TempDir::new().expect("temp dir");
    ManifestSpec::new("core").write(dir.path());
    ManifestSpec::new("ui")
        .depends_on_version("core", "^1")
        .write(dir.path());
    let probe = Arc::new(Probe::default());
    let (host, _) = host(quiet_config(), &probe);
    let cancel = CancellationToken::new();

    host.discover_and_load(dir.path(), &cancel)
        .await
        .expect("load");

    // Swap core for a version ui does not accept while ui keeps running
    assert!(host.unload_plugin("core", &cancel).await.expect("unload core"));
    let manifest = ManifestSpec::new("core").version("2.0.0").write(dir.path());
    host.load_plugin(PluginSource::Manifest(manifest), &cancel)
        .await
        .expect("load core 2.0.0");

    let unloaded = host.unload_all(&cancel).await.expect("unload all");
    assert_eq!(unloaded, vec!["ui", "core"]);
    assert!(host.loaded_ids().await.is_empty());
}
