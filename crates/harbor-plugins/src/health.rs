//! Health probes and self-healing
//!
//! Each Running plugin gets its own probe task. A probe runs the plugin's
//! `health_check` under a timeout; timeouts and `Unhealthy` results count as
//! failures. After `failure_threshold` consecutive failures the configured
//! recovery action runs on a separate task, at most `max_recoveries` times per
//! plugin id.

use crate::contract::HealthStatus;
use crate::descriptor::PluginState;
use crate::host::{HostRuntime, LoadedPlugin, PluginHost};
use chrono::{DateTime, Utc};
use harbor_core::bus::BusMessage;
use harbor_core::config::{HealthConfig, RecoveryAction};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a recovery action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryEvent {
    pub action: RecoveryAction,
    pub at: DateTime<Utc>,
    pub succeeded: bool,
    pub detail: String,
}

/// Probe history of one plugin id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub plugin_id: String,
    /// Whether a probe task is currently running
    pub active: bool,
    pub probes: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_status: Option<HealthStatus>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub recoveries: u32,
    pub last_recovery: Option<RecoveryEvent>,
}

impl HealthRecord {
    fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            active: false,
            probes: 0,
            consecutive_failures: 0,
            total_failures: 0,
            last_status: None,
            last_probe_at: None,
            recoveries: 0,
            last_recovery: None,
        }
    }
}

/// Point-in-time view of the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub enabled: bool,
    pub interval_ms: u64,
    pub failure_threshold: u32,
    pub recovery_action: RecoveryAction,
    /// Records sorted by plugin id
    pub plugins: Vec<HealthRecord>,
}

impl HealthSnapshot {
    pub fn get(&self, plugin_id: &str) -> Option<&HealthRecord> {
        self.plugins.iter().find(|r| r.plugin_id == plugin_id)
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    records: Mutex<BTreeMap<String, HealthRecord>>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl MonitorState {
    /// Record a probe result; returns the consecutive failure count
    fn record_probe(&self, plugin_id: &str, status: &HealthStatus) -> u32 {
        let mut records = self.records.lock();
        let record = records
            .entry(plugin_id.to_string())
            .or_insert_with(|| HealthRecord::new(plugin_id));
        record.probes += 1;
        record.last_probe_at = Some(Utc::now());
        record.last_status = Some(status.clone());
        if status.is_failure() {
            record.consecutive_failures += 1;
            record.total_failures += 1;
        } else {
            record.consecutive_failures = 0;
        }
        record.consecutive_failures
    }

    /// Claim a recovery slot; false once the limit is used up
    fn begin_recovery(&self, plugin_id: &str, max_recoveries: u32) -> bool {
        let mut records = self.records.lock();
        let record = records
            .entry(plugin_id.to_string())
            .or_insert_with(|| HealthRecord::new(plugin_id));
        record.consecutive_failures = 0;
        if record.recoveries >= max_recoveries {
            return false;
        }
        record.recoveries += 1;
        true
    }

    fn finish_recovery(&self, plugin_id: &str, action: RecoveryAction, outcome: Result<String, String>) {
        if let Some(record) = self.records.lock().get_mut(plugin_id) {
            let (succeeded, detail) = match outcome {
                Ok(detail) => (true, detail),
                Err(detail) => (false, detail),
            };
            record.last_recovery = Some(RecoveryEvent {
                action,
                at: Utc::now(),
                succeeded,
                detail,
            });
        }
    }

    fn set_active(&self, plugin_id: &str, active: bool) {
        let mut records = self.records.lock();
        let record = records
            .entry(plugin_id.to_string())
            .or_insert_with(|| HealthRecord::new(plugin_id));
        record.active = active;
        if active {
            record.consecutive_failures = 0;
        }
    }
}

/// Schedules probes for running plugins
pub struct HealthMonitor {
    config: HealthConfig,
    state: Arc<MonitorState>,
    host: Weak<HostRuntime>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, host: Weak<HostRuntime>) -> Self {
        Self {
            config,
            state: Arc::new(MonitorState::default()),
            host,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start probing `plugin`, replacing any earlier probe for its id
    pub fn register(&self, plugin: &Arc<LoadedPlugin>) {
        if !self.config.enabled {
            return;
        }

        let id = plugin.id().to_string();
        let token = self.shutdown.child_token();
        if let Some(previous) = self.state.tasks.lock().insert(id.clone(), token.clone()) {
            previous.cancel();
        }
        self.state.set_active(&id, true);

        tokio::spawn(probe_loop(
            Arc::downgrade(plugin),
            id.clone(),
            self.config.clone(),
            Arc::clone(&self.state),
            self.host.clone(),
            token,
        ));
        debug!(plugin_id = %id, interval_ms = self.config.interval_ms, "Health probe registered");
    }

    /// Stop probing `plugin_id`; history and recovery counts are kept
    pub fn unregister(&self, plugin_id: &str) -> bool {
        let Some(token) = self.state.tasks.lock().remove(plugin_id) else {
            return false;
        };
        token.cancel();
        self.state.set_active(plugin_id, false);
        debug!(plugin_id = %plugin_id, "Health probe unregistered");
        true
    }

    pub fn is_monitoring(&self, plugin_id: &str) -> bool {
        self.state.tasks.lock().contains_key(plugin_id)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            enabled: self.config.enabled,
            interval_ms: self.config.interval_ms,
            failure_threshold: self.config.failure_threshold,
            recovery_action: self.config.recovery_action,
            plugins: self.state.records.lock().values().cloned().collect(),
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("monitored", &self.state.tasks.lock().len())
            .finish()
    }
}

async fn probe_loop(
    plugin: Weak<LoadedPlugin>,
    plugin_id: String,
    config: HealthConfig,
    state: Arc<MonitorState>,
    host: Weak<HostRuntime>,
    cancel: CancellationToken,
) {
    let interval = config.interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(plugin) = plugin.upgrade() else {
            break;
        };
        // Being torn down by the host
        if plugin.state() > PluginState::Running {
            break;
        }

        let status = match tokio::time::timeout(config.probe_timeout(), plugin.health_check()).await
        {
            Ok(status) => status,
            Err(_) => HealthStatus::Unhealthy(format!(
                "probe timed out after {} ms",
                config.probe_timeout_ms
            )),
        };
        let instance_id = plugin.instance_id();
        drop(plugin);
        if cancel.is_cancelled() {
            break;
        }

        let failures = state.record_probe(&plugin_id, &status);
        match &status {
            HealthStatus::Healthy => debug!(plugin_id = %plugin_id, "Health probe passed"),
            HealthStatus::Degraded(detail) => {
                info!(plugin_id = %plugin_id, detail = %detail, "Plugin reports degraded health")
            }
            HealthStatus::Unhealthy(reason) => warn!(
                plugin_id = %plugin_id,
                consecutive_failures = failures,
                threshold = config.failure_threshold,
                reason = %reason,
                "Health probe failed"
            ),
        }

        if failures < config.failure_threshold {
            continue;
        }

        if !state.begin_recovery(&plugin_id, config.max_recoveries) {
            error!(
                plugin_id = %plugin_id,
                max_recoveries = config.max_recoveries,
                "Recovery limit reached; leaving plugin as is"
            );
            continue;
        }

        match config.recovery_action {
            RecoveryAction::Log => {
                warn!(plugin_id = %plugin_id, %instance_id, "Plugin unhealthy; recovery action is log only");
                state.finish_recovery(&plugin_id, RecoveryAction::Log, Ok("logged".to_string()));
            }
            action => {
                // The recovery unregisters this probe, so it runs on its own task
                tokio::spawn(recover(host.clone(), plugin_id.clone(), action, Arc::clone(&state)));
                break;
            }
        }
    }
}

async fn recover(
    host: Weak<HostRuntime>,
    plugin_id: String,
    action: RecoveryAction,
    state: Arc<MonitorState>,
) {
    let Some(host) = host.upgrade() else {
        return;
    };
    warn!(plugin_id = %plugin_id, action = %action, "Running recovery action");

    let cancel = CancellationToken::new();
    let outcome = match action {
        RecoveryAction::Reload => host
            .reload_plugin(&plugin_id, &cancel)
            .await
            .map(|plugin| format!("reloaded as instance {}", plugin.instance_id())),
        RecoveryAction::Unload => host
            .unload_plugin(&plugin_id, &cancel)
            .await
            .map(|_| "unloaded".to_string()),
        RecoveryAction::Log => Ok("logged".to_string()),
    };

    match outcome {
        Ok(detail) => {
            info!(plugin_id = %plugin_id, action = %action, detail = %detail, "Recovery succeeded");
            host.bus().publish(BusMessage::new(
                "host.plugin.recovered",
                "host",
                serde_json::json!({
                    "plugin_id": plugin_id,
                    "action": action,
                    "detail": detail,
                }),
            ));
            state.finish_recovery(&plugin_id, action, Ok(detail));
        }
        Err(e) => {
            error!(
                plugin_id = %plugin_id,
                action = %action,
                code = e.code(),
                error = %e,
                "Recovery failed"
            );
            state.finish_recovery(&plugin_id, action, Err(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let state = MonitorState::default();
        let bad = HealthStatus::Unhealthy("down".into());
        assert_eq!(state.record_probe("a", &bad), 1);
        assert_eq!(state.record_probe("a", &bad), 2);
        assert_eq!(state.record_probe("a", &HealthStatus::Degraded("slow".into())), 0);
        assert_eq!(state.record_probe("a", &bad), 1);

        let records = state.records.lock();
        let record = &records["a"];
        assert_eq!(record.probes, 4);
        assert_eq!(record.total_failures, 3);
    }

    #[test]
    fn test_recoveries_are_capped() {
        let state = MonitorState::default();
        assert!(state.begin_recovery("a", 2));
        assert!(state.begin_recovery("a", 2));
        assert!(!state.begin_recovery("a", 2));
        assert!(state.begin_recovery("b", 2), "limit is per plugin id");

        state.finish_recovery("a", RecoveryAction::Reload, Err("boom".into()));
        let records = state.records.lock();
        let last = records["a"].last_recovery.as_ref().expect("event");
        assert!(!last.succeeded);
        assert_eq!(records["a"].recoveries, 2);
    }

    #[tokio::test]
    async fn test_disabled_monitor_registers_nothing() {
        let config = HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(config, Weak::new());
        assert!(!monitor.unregister("a"));
        assert!(monitor.snapshot().plugins.is_empty());
        assert!(!monitor.snapshot().enabled);
    }
}
