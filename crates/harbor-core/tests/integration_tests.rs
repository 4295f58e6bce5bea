//! Harbor Core Integration Tests

use harbor_core::{
    bus::{BusMessage, MessageBus},
    config::{HostConfig, RecoveryAction},
    sanitize::sanitize_detail,
    services::ServiceRegistry,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

struct Counter(std::sync::atomic::AtomicUsize);

#[tokio::test]
async fn test_plugin_scope_shares_host_bus() {
    let root = Arc::new(ServiceRegistry::new());
    root.register(MessageBus::new()).expect("register bus");

    let scope_a = root.create_scope("plugin:a");
    let scope_b = root.create_scope("plugin:b");

    let bus_b = scope_b.require::<MessageBus>().expect("bus via scope b");
    let mut inbox = bus_b.subscribe_to("a.*");

    let bus_a = scope_a.require::<MessageBus>().expect("bus via scope a");
    bus_a.publish(BusMessage::new("a.ready", "a", json!({"ok": true})));

    let message = inbox.recv().await.expect("message from a");
    assert_eq!(message.sender, "a");
    assert_eq!(message.payload["ok"], true);
}

#[test]
fn test_disposing_one_scope_leaves_siblings() {
    let root = Arc::new(ServiceRegistry::new());
    let scope_a = root.create_scope("plugin:a");
    let scope_b = root.create_scope("plugin:b");

    scope_a
        .register(Counter(Default::default()))
        .expect("register a");
    scope_b
        .register(Counter(Default::default()))
        .expect("register b");

    scope_a.dispose();
    assert!(scope_a.get::<Counter>().is_none());
    assert!(scope_b.get::<Counter>().is_some());
}

#[test]
fn test_config_round_trip_with_plugin_sections() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.toml");

    let mut config = HostConfig::default();
    config.health.recovery_action = RecoveryAction::Log;
    let mut section = toml::Table::new();
    section.insert("threshold".into(), toml::Value::Integer(7));
    config.plugins.insert("meter".into(), section);
    config.save_to(&path).expect("save");

    let loaded = HostConfig::load_from(&path).expect("load");
    assert_eq!(loaded.health.recovery_action, RecoveryAction::Log);
    assert_eq!(
        loaded.plugin_section("meter").and_then(|s| s["threshold"].as_integer()),
        Some(7)
    );
}

#[test]
fn test_sanitized_io_error_hides_location() {
    let err = std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "missing /srv/harbor/plugins/meter/libmeter.so",
    );
    let detail = sanitize_detail(&harbor_core::Error::from(err).to_string());
    assert_eq!(detail, "missing libmeter.so");
}
