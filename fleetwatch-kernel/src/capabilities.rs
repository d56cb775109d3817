//! Seams to the collaborators the supervision core does not own.
//!
//! The kernel binary wires real adapters (MQTT, HTTP probe, Wake-on-LAN);
//! tests wire the fakes from `fleetwatch-devkit`.

use async_trait::async_trait;

use crate::config::{ConfigError, NodeCommand, NodeConf, WatchdogPolicy};
use crate::models::{Frame, ProbeResult, WatchdogNotification};

/// Display flag: false when the user intentionally powered the node off.
pub const DISPLAY_ON_KEY: &str = "display_on";
/// Display flag: play state last reported by the node itself.
pub const PLAYING_KEY: &str = "playing";

#[async_trait]
pub trait HealthCheckProbe: Send + Sync {
    async fn check(&self, node: &str) -> anyhow::Result<ProbeResult>;
}

#[async_trait]
pub trait SceneSwitcher: Send + Sync {
    /// Returns false when the scene could not be loaded.
    async fn switch_scene(&self, node: &str, scene: &str, payload: Option<serde_json::Value>) -> bool;
}

#[async_trait]
pub trait NodeResetter: Send + Sync {
    async fn restart(&self, node: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send(&self, node: &str, command: &NodeCommand) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &WatchdogNotification) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DisplaySink: Send + Sync {
    async fn push_frame(&self, node: &str, frame: &Frame) -> anyhow::Result<()>;
    async fn clear(&self, node: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish_state(&self, node: &str, key: &str, value: serde_json::Value) -> anyhow::Result<()>;
}

pub trait DisplayStateSource: Send + Sync {
    fn get_bool(&self, node: &str, key: &str, default: bool) -> bool;
}

pub trait ConfigSource: Send + Sync {
    fn node(&self, node: &str) -> Result<Option<NodeConf>, ConfigError>;

    fn nodes(&self) -> Result<Vec<String>, ConfigError>;

    fn policy(&self, node: &str) -> Result<Option<WatchdogPolicy>, ConfigError> {
        match self.node(node)?.and_then(|conf| conf.watchdog) {
            Some(policy) => {
                policy.validate(node)?;
                Ok(Some(policy))
            }
            None => Ok(None),
        }
    }
}

/// Notifier used when no transport is wired: alerts only reach the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &WatchdogNotification) -> anyhow::Result<()> {
        tracing::warn!(
            node = %notification.node,
            kind = ?notification.kind,
            action = %notification.action,
            "watchdog alert: {}", notification.reason
        );
        Ok(())
    }
}
