//! MQTT plumbing: outgoing state/frames/commands/alerts, incoming heartbeats and power flags.
//!
//! Topics are `{prefix}/{node}/{contract}`:
//! - out: `state@v1`, `frame@v1`, `clear@v1`, `command@v1`, and `{prefix}/watchdog/alert@v1`
//! - in:  `heartbeat@v1`, `power@v1` (`{"on": bool}`), `playback@v1` (`{"playing": bool}`)

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task;
use tracing::{debug, info, warn};

use crate::capabilities::{CommandSender, DisplaySink, Notifier, StatePublisher, DISPLAY_ON_KEY, PLAYING_KEY};
use crate::config::{MqttConf, NodeCommand};
use crate::health::HealthTracker;
use crate::models::{Frame, WatchdogNotification};
use crate::state::DisplayStateStore;
use crate::status::KernelStatus;

pub const HEARTBEAT_CONTRACT: &str = "heartbeat@v1";
pub const POWER_CONTRACT: &str = "power@v1";
pub const PLAYBACK_CONTRACT: &str = "playback@v1";

/// Publishing seam, so the bridge runs against the devkit mock in tests.
#[async_trait]
pub trait MqttPublish: Send + Sync {
    async fn publish_bytes(&self, topic: String, payload: Vec<u8>) -> anyhow::Result<()>;
}

#[async_trait]
impl MqttPublish for AsyncClient {
    async fn publish_bytes(&self, topic: String, payload: Vec<u8>) -> anyhow::Result<()> {
        self.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new("fleetwatch-kernel", &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

/// Splits `{prefix}/{node}/{contract}`.
pub fn parse_node_topic<'a>(prefix: &str, topic: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (node, contract) = rest.split_once('/')?;
    if node.is_empty() || contract.is_empty() || contract.contains('/') {
        return None;
    }
    Some((node, contract))
}

pub struct MqttBridge<P> {
    client: P,
    prefix: String,
}

impl<P: MqttPublish> MqttBridge<P> {
    pub fn new(client: P, prefix: impl Into<String>) -> Self {
        Self { client, prefix: prefix.into() }
    }

    fn node_topic(&self, node: &str, contract: &str) -> String {
        format!("{}/{}/{}", self.prefix, node, contract)
    }

    async fn publish_json(&self, topic: String, payload: serde_json::Value) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&payload)?;
        self.client.publish_bytes(topic, bytes).await
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[async_trait]
impl<P: MqttPublish> StatePublisher for MqttBridge<P> {
    async fn publish_state(&self, node: &str, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let payload = json!({ "key": key, "value": value, "ts": now_rfc3339() });
        self.publish_json(self.node_topic(node, "state@v1"), payload).await
    }
}

#[async_trait]
impl<P: MqttPublish> DisplaySink for MqttBridge<P> {
    async fn push_frame(&self, node: &str, frame: &Frame) -> anyhow::Result<()> {
        self.publish_json(self.node_topic(node, "frame@v1"), serde_json::to_value(frame)?).await
    }

    async fn clear(&self, node: &str) -> anyhow::Result<()> {
        self.publish_json(self.node_topic(node, "clear@v1"), json!({ "ts": now_rfc3339() })).await
    }
}

#[async_trait]
impl<P: MqttPublish> CommandSender for MqttBridge<P> {
    async fn send(&self, node: &str, command: &NodeCommand) -> anyhow::Result<()> {
        let payload = json!({
            "command": command.command,
            "args": command.args,
            "ts": now_rfc3339(),
        });
        self.publish_json(self.node_topic(node, "command@v1"), payload).await
    }
}

#[async_trait]
impl<P: MqttPublish> Notifier for MqttBridge<P> {
    async fn notify(&self, notification: &WatchdogNotification) -> anyhow::Result<()> {
        let topic = format!("{}/watchdog/alert@v1", self.prefix);
        self.publish_json(topic, serde_json::to_value(notification)?).await
    }
}

#[derive(Debug, Deserialize)]
struct PowerIn {
    on: bool,
}

#[derive(Debug, Deserialize)]
struct PlaybackIn {
    playing: bool,
}

/// Everything the listener feeds.
#[derive(Clone)]
pub struct ListenerContext {
    pub prefix: String,
    pub health: HealthTracker,
    pub display: DisplayStateStore,
    pub kernel: KernelStatus,
}

impl ListenerContext {
    /// Applies one incoming publish. Returns false when the message was ignored.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) -> bool {
        let Some((node, contract)) = parse_node_topic(&self.prefix, topic) else {
            return false;
        };
        match contract {
            HEARTBEAT_CONTRACT => {
                self.health.update_last_seen(node, OffsetDateTime::now_utc());
                debug!(node, "heartbeat");
                true
            }
            POWER_CONTRACT => match serde_json::from_slice::<PowerIn>(payload) {
                Ok(power) => {
                    self.display.set_bool(node, DISPLAY_ON_KEY, power.on);
                    info!(node, on = power.on, "display power changed");
                    true
                }
                Err(e) => {
                    warn!(node, error = %e, "invalid power payload");
                    false
                }
            },
            PLAYBACK_CONTRACT => match serde_json::from_slice::<PlaybackIn>(payload) {
                Ok(report) => {
                    self.display.set_bool(node, PLAYING_KEY, report.playing);
                    debug!(node, playing = report.playing, "node play state reported");
                    true
                }
                Err(e) => {
                    warn!(node, error = %e, "invalid playback payload");
                    false
                }
            },
            _ => false,
        }
    }
}

pub async fn spawn_mqtt_listener(client: AsyncClient, mut eventloop: EventLoop, ctx: ListenerContext) -> anyhow::Result<()> {
    for contract in [HEARTBEAT_CONTRACT, POWER_CONTRACT, PLAYBACK_CONTRACT] {
        client
            .subscribe(format!("{}/+/{}", ctx.prefix, contract), QoS::AtLeastOnce)
            .await?;
    }

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    ctx.kernel.mark_mqtt_connected();
                    info!("MQTT connected");
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    ctx.handle_publish(&p.topic, &p.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT error");
                    ctx.kernel.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
    Ok(())
}
