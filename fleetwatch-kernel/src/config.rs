use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::Path, time::Duration};
use tokio::fs;

use crate::capabilities::ConfigSource;
use crate::state::{new_state, Shared};

pub const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_OFFLINE_TIMEOUT_MINUTES: u64 = 60;
pub const DEFAULT_TOPIC_PREFIX: &str = "fleet";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid watchdog policy for {node}: {reason}")]
    InvalidPolicy { node: String, reason: String },
    #[error("config lookup failed for {node}: {reason}")]
    Lookup { node: String, reason: String },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FleetConfig {
    #[serde(default)]
    pub nodes: HashMap<String, NodeConf>,
    pub mqtt: Option<MqttConf>,
    pub reset: Option<ResetConf>,
    pub probe: Option<ProbeConf>,
    pub http: Option<HttpConf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Physical device reachable on the network.
    #[default]
    Real,
    /// Simulated device, always answers probes.
    Mock,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConf {
    #[serde(default)]
    pub driver: DriverKind,
    /// Host or `host:port` used by the HTTP probe.
    pub address: Option<String>,
    pub mac: Option<String>,
    /// Broadcast address for Wake-on-LAN.
    pub hint: Option<String>,
    pub startup_scene: Option<String>,
    pub watchdog: Option<WatchdogPolicy>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    #[default]
    Restart,
    FallbackScene,
    SendCommands,
    NotifyOnly,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryAction::Restart => "restart",
            RecoveryAction::FallbackScene => "fallback-scene",
            RecoveryAction::SendCommands => "send-commands",
            RecoveryAction::NotifyOnly => "notify-only",
            RecoveryAction::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One step of a `send-commands` recovery sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCommand {
    pub command: String,
    #[serde(default)]
    pub args: serde_json::Value,
    /// Pause before this command is sent.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_minutes: u64,
    #[serde(default)]
    pub action: RecoveryAction,
    #[serde(default)]
    pub check_when_off: bool,
    pub fallback_scene: Option<String>,
    #[serde(default)]
    pub commands: Vec<NodeCommand>,
    #[serde(default)]
    pub notify_on_failure: bool,
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECONDS
}

fn default_offline_timeout() -> u64 {
    DEFAULT_OFFLINE_TIMEOUT_MINUTES
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
            offline_timeout_minutes: DEFAULT_OFFLINE_TIMEOUT_MINUTES,
            action: RecoveryAction::default(),
            check_when_off: false,
            fallback_scene: None,
            commands: Vec::new(),
            notify_on_failure: false,
        }
    }
}

impl WatchdogPolicy {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_minutes.saturating_mul(60))
    }

    pub fn validate(&self, node: &str) -> Result<(), ConfigError> {
        if self.check_interval_seconds == 0 {
            return Err(ConfigError::InvalidPolicy {
                node: node.to_string(),
                reason: "check_interval_seconds must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResetConf {
    /// ex: "/opt/fleet/power-cycle.sh {node} {mac} {hint}"
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProbeConf {
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_probe_timeout() -> u64 {
    3000
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self { path: default_probe_path(), timeout_ms: default_probe_timeout() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            mqtt: Some(MqttConf {
                host: "localhost".into(),
                port: 1883,
                topic_prefix: default_topic_prefix(),
            }),
            reset: None,
            probe: None,
            http: None,
        }
    }
}

pub fn parse_config(txt: &str) -> Result<FleetConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(FleetConfig::default());
    }
    Ok(serde_yaml::from_str(txt)?)
}

pub async fn load_config() -> FleetConfig {
    let path = std::env::var("FLEETWATCH_CONFIG").unwrap_or_else(|_| "fleetwatch.yaml".into());
    if !Path::new(&path).exists() {
        tracing::warn!(%path, "no config file, using defaults");
        return FleetConfig::default();
    }
    let txt = match fs::read_to_string(&path).await {
        Ok(txt) => txt,
        Err(e) => {
            tracing::warn!(%path, error = %e, "config unreadable, using defaults");
            return FleetConfig::default();
        }
    };
    parse_config(&txt).unwrap_or_else(|e| {
        tracing::warn!(%path, error = %e, "invalid config, using defaults");
        FleetConfig::default()
    })
}

/// [`ConfigSource`] over the loaded file, shared with the HTTP layer.
#[derive(Clone)]
pub struct ConfigStore {
    cfg: Shared<FleetConfig>,
}

impl ConfigStore {
    pub fn new(cfg: FleetConfig) -> Self {
        Self { cfg: new_state(cfg) }
    }
}

impl ConfigSource for ConfigStore {
    fn node(&self, node: &str) -> Result<Option<NodeConf>, ConfigError> {
        Ok(self.cfg.lock().nodes.get(node).cloned())
    }

    fn nodes(&self) -> Result<Vec<String>, ConfigError> {
        let mut nodes: Vec<String> = self.cfg.lock().nodes.keys().cloned().collect();
        nodes.sort();
        Ok(nodes)
    }
}
