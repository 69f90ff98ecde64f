//! Host state: the registration context, its connection, and loaded plugins

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use devhub_core::{
    AsyncState, Connection, DeviceKind, ExecutionModel, MessageTypeId, RegistrationContext, SyncState,
};
use devhub_pluginkit::load_plugin;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::plugins;

/// Loaded plugin as reported by the status API
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub objects: usize,
    pub devices: Vec<String>,
}

/// Device as reported by the status API
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub model: ExecutionModel,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum DeviceState {
    Sync(SyncState),
    Async(AsyncState),
}

/// Message type as reported by the status API
#[derive(Debug, Clone, Serialize)]
pub struct MessageTypeSummary {
    pub id: MessageTypeId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostStats {
    pub started_at: DateTime<Utc>,
    pub ticks: u64,
    pub messages_sent: u64,
    pub plugins: usize,
    pub devices: usize,
    pub message_types: usize,
}

/// Shared host state
pub struct HostState {
    /// Registration context owning every plugin
    pub registration: Arc<RegistrationContext>,
    /// Connection all devices send through
    pub connection: Arc<Connection>,
    /// Configuration
    pub config: Config,
    started_at: DateTime<Utc>,
    ticks: AtomicU64,
}

impl HostState {
    /// Create the host and load every configured plugin
    ///
    /// A plugin that fails to register is logged and skipped.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let connection = Connection::with_capacity(config.host.broadcast_capacity);
        let registration = RegistrationContext::with_connection(connection.clone());

        for plugin_config in &config.plugins {
            let plugin = plugins::builtin(plugin_config);
            match load_plugin(&registration, plugin.as_ref()) {
                Ok(ctx) => info!(plugin = %ctx.name(), kind = ?plugin_config.kind, "Loaded built-in plugin"),
                Err(e) => warn!(plugin = %plugin_config.name, error = %e, "Skipping plugin"),
            }
        }

        Ok(Arc::new(Self {
            registration,
            connection,
            config,
            started_at: Utc::now(),
            ticks: AtomicU64::new(0),
        }))
    }

    /// One host tick over every synchronous device
    pub fn tick(&self) -> usize {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.connection.process_devices()
    }

    pub fn plugins(&self) -> Vec<PluginSummary> {
        let devices = self.connection.device_names();
        self.registration
            .plugins()
            .iter()
            .map(|p| {
                let prefix = format!("{}/", p.name());
                PluginSummary {
                    name: p.name().to_string(),
                    objects: p.object_count(),
                    devices: devices.iter().filter(|d| d.starts_with(&prefix)).cloned().collect(),
                }
            })
            .collect()
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.connection
            .devices()
            .iter()
            .map(|token| {
                let state = match token.kind() {
                    DeviceKind::Sync(sync) => DeviceState::Sync(sync.state()),
                    DeviceKind::Async(device) => DeviceState::Async(device.state()),
                };
                DeviceSummary {
                    name: token.name().to_string(),
                    model: token.execution_model(),
                    state,
                }
            })
            .collect()
    }

    pub fn message_types(&self) -> Vec<MessageTypeSummary> {
        self.connection
            .message_types()
            .list()
            .iter()
            .map(|m| MessageTypeSummary {
                id: m.id(),
                name: m.name().to_string(),
            })
            .collect()
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            started_at: self.started_at,
            ticks: self.ticks.load(Ordering::Relaxed),
            messages_sent: self.connection.messages_sent(),
            plugins: self.registration.plugins().len(),
            devices: self.connection.device_names().len(),
            message_types: self.connection.message_types().len(),
        }
    }

    /// Ask every plugin to look for new hardware
    pub fn trigger_hardware_detect(&self) -> usize {
        self.registration.trigger_hardware_detect()
    }

    /// Unload all plugins, joining every asynchronous wait loop
    pub fn shutdown(&self) {
        info!("Unloading plugins");
        self.registration.teardown();
    }
}

/// Tick synchronous devices until `shutdown` flips or `limit` ticks have run
pub async fn run_tick_loop(
    state: Arc<HostState>,
    mut shutdown: watch::Receiver<bool>,
    limit: Option<u64>,
) -> Result<()> {
    let period = Duration::from_millis(state.config.host.tick_interval_ms);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut remaining = limit;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Device callbacks are synchronous and may block briefly
                let state = state.clone();
                tokio::task::spawn_blocking(move || state.tick())
                    .await
                    .context("tick task failed")?;
                if let Some(n) = remaining.as_mut() {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        info!(ticks = limit.unwrap_or_default(), "Tick limit reached");
                        return Ok(());
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Tick loop stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Log every device message at debug level
pub async fn run_message_log(connection: Arc<Connection>) {
    let mut rx = connection.subscribe();
    drop(connection);
    loop {
        match rx.recv().await {
            Ok(message) => debug!(
                device = %message.device,
                message_type = %message.message_type,
                timestamp = %message.timestamp,
                len = message.payload.len(),
                "Device message"
            ),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Message log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginConfig, PluginKind};

    fn config() -> Config {
        let mut config = Config::example();
        for plugin in config.plugins.iter_mut() {
            plugin.interval_ms = 1;
        }
        config.host.tick_interval_ms = 1;
        config
    }

    #[test]
    fn test_new_loads_configured_plugins() {
        let state = HostState::new(config()).unwrap();
        let plugins = state.plugins();
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[0].devices, vec!["heartbeat/pulse".to_string()]);
        assert_eq!(plugins[1].devices, vec!["sampler/sine".to_string()]);

        let devices = state.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].model, ExecutionModel::Synchronous);
        assert_eq!(devices[1].model, ExecutionModel::Asynchronous);
        assert!(matches!(devices[1].state, DeviceState::Async(AsyncState::Running)));

        let types: Vec<String> = state.message_types().into_iter().map(|m| m.name).collect();
        assert_eq!(types, vec!["devhub/heartbeat", "devhub/analog"]);
        state.shutdown();
    }

    #[test]
    fn test_failing_plugin_is_skipped() {
        let mut config = config();
        config.plugins.push(PluginConfig {
            kind: PluginKind::Heartbeat,
            name: "broken".to_string(),
            device: "dev".to_string(),
            message_type: "".to_string(),
            interval_ms: 1,
        });
        let state = HostState::new(config).unwrap();
        assert_eq!(state.plugins().len(), 2);
        state.shutdown();
    }

    #[test]
    fn test_tick_counts_and_stats() {
        let mut config = config();
        config.plugins.truncate(1);
        let state = HostState::new(config).unwrap();
        assert_eq!(state.tick(), 1);
        assert_eq!(state.tick(), 1);
        let stats = state.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.devices, 1);
        state.shutdown();
        assert_eq!(state.stats().plugins, 0);
    }

    #[tokio::test]
    async fn test_tick_loop_honors_limit() {
        let mut config = config();
        config.plugins.truncate(1);
        let state = HostState::new(config).unwrap();
        let (_tx, rx) = watch::channel(false);
        run_tick_loop(state.clone(), rx, Some(5)).await.unwrap();
        assert_eq!(state.stats().ticks, 5);
        assert_eq!(state.connection.messages_sent(), 5);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_tick_loop_stops_on_shutdown() {
        let state = HostState::new(config()).unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_tick_loop(state.clone(), rx, None));
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        state.shutdown();
    }
}
