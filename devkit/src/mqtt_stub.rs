/*!
Mock MQTT client for running the kernel without a broker.

Records every published message so tests can assert on topics and payloads.
*/

use async_trait::async_trait;
use fleetwatch_kernel::mqtt::MqttPublish;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock standing in for `rumqttc::AsyncClient`.
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    fail_publish: Arc<Mutex<bool>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail, as with a lost broker connection.
    pub fn set_failing(&self, failing: bool) {
        *self.fail_publish.lock() = failing;
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message published on `topic`.
    pub fn get_last_json_message<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

#[async_trait]
impl MqttPublish for MockMqttClient {
    async fn publish_bytes(&self, topic: String, payload: Vec<u8>) -> anyhow::Result<()> {
        if *self.fail_publish.lock() {
            anyhow::bail!("mock broker unavailable");
        }
        tracing::debug!(%topic, bytes = payload.len(), "[mock] published");
        self.published_messages.lock().push(MockMessage {
            topic,
            payload,
            qos: QoS::AtLeastOnce,
            retain: false,
        });
        Ok(())
    }
}

/// Builds incoming payloads in the shape nodes send them.
pub struct FleetMessageBuilder;

impl FleetMessageBuilder {
    pub fn heartbeat_v1(node: &str) -> Value {
        serde_json::json!({
            "node": node,
            "ts": OffsetDateTime::now_utc().unix_timestamp(),
        })
    }

    pub fn power_v1(on: bool) -> Value {
        serde_json::json!({ "on": on })
    }

    pub fn playback_v1(playing: bool) -> Value {
        serde_json::json!({ "playing": playing })
    }
}
