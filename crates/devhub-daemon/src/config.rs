//! Configuration loading and validation

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Interval between host ticks that poll synchronous devices
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Messages buffered per broadcast subscriber before it starts lagging
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_tick_interval() -> u64 {
    10 // 100 Hz host tick
}

fn default_broadcast_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Serve the read-only status API
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bind address for the status API
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_true() -> bool {
    true
}

/// Built-in plugin implementations the daemon can load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Synchronous device emitting a counter on every host tick
    Heartbeat,
    /// Asynchronous device sampling a waveform on its own thread
    Sampler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Which built-in plugin to load
    pub kind: PluginKind,
    /// Plugin name, the prefix of its device names
    pub name: String,
    /// Device name within the plugin
    #[serde(default = "default_device")]
    pub device: String,
    /// Message type the device emits
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// Sampling interval for asynchronous devices
    #[serde(default = "default_sample_interval")]
    pub interval_ms: u64,
}

fn default_device() -> String {
    "dev0".to_string()
}

fn default_message_type() -> String {
    "devhub/raw".to_string()
}

fn default_sample_interval() -> u64 {
    20
}

impl Config {
    /// Reject configurations the host could only fail on later
    pub fn validate(&self) -> Result<()> {
        if self.host.tick_interval_ms == 0 {
            bail!("host.tick_interval_ms must be greater than zero");
        }
        if self.host.broadcast_capacity == 0 {
            bail!("host.broadcast_capacity must be greater than zero");
        }
        let mut names = HashSet::new();
        for plugin in &self.plugins {
            if !names.insert(plugin.name.as_str()) {
                bail!("plugin name {:?} is used more than once", plugin.name);
            }
            if plugin.kind == PluginKind::Sampler && plugin.interval_ms == 0 {
                bail!("sampler plugin {:?} needs a non-zero interval_ms", plugin.name);
            }
        }
        Ok(())
    }

    /// Configuration with one plugin of each kind
    pub fn example() -> Self {
        Self {
            host: HostConfig::default(),
            api: ApiConfig::default(),
            plugins: vec![
                PluginConfig {
                    kind: PluginKind::Heartbeat,
                    name: "heartbeat".to_string(),
                    device: "pulse".to_string(),
                    message_type: "devhub/heartbeat".to_string(),
                    interval_ms: default_sample_interval(),
                },
                PluginConfig {
                    kind: PluginKind::Sampler,
                    name: "sampler".to_string(),
                    device: "sine".to_string(),
                    message_type: "devhub/analog".to_string(),
                    interval_ms: default_sample_interval(),
                },
            ],
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), plugins = config.plugins.len(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using example configuration"
        );
        Config::example()
    };
    config.validate()?;
    Ok(config)
}

/// Save the example configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::example())?;
    std::fs::write(path, content)?;
    Ok(())
}
