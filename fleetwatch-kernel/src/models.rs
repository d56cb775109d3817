use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::RecoveryAction;

/// Result of one liveness probe against a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok(latency_ms: u64) -> Self {
        Self { success: true, latency_ms: Some(latency_ms), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, latency_ms: None, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Playing,
    Paused,
    Stopped,
}

impl PlayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayState::Playing => "playing",
            PlayState::Paused => "paused",
            PlayState::Stopped => "stopped",
        }
    }
}

/// One rendered frame, tagged with the scene generation it was produced for.
///
/// The payload is opaque to the kernel: node firmware draws it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub scene: String,
    pub generation: u64,
    pub index: u64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NodeUnresponsive,
    RecoveryFailed,
}

/// Alert emitted by the recovery executor.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogNotification {
    pub id: Uuid,
    pub node: String,
    pub kind: NotificationKind,
    pub action: RecoveryAction,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl WatchdogNotification {
    pub fn new(node: &str, kind: NotificationKind, action: RecoveryAction, reason: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            node: node.to_string(),
            kind,
            action,
            reason: reason.to_string(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}
