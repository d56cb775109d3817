//! Read-only reporting for dashboards and the HTTP API.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

use crate::config::WatchdogPolicy;
use crate::health::HealthRecord;
use crate::liveness::{compute_status, NodeLivenessStatus};
use crate::playback::PlaybackSnapshot;
use crate::recovery::RecoveryOutcome;
use crate::state::{new_state, Shared};
use crate::watchdog::{LastCheck, OfflineEpisode, WatchdogScheduler};

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: String,
    pub enabled: bool,
    pub monitoring: bool,
    pub check_interval_secs: Option<u64>,
    pub liveness: Option<NodeLivenessStatus>,
    pub last_check: Option<LastCheck>,
    pub last_health_check: HealthRecord,
    pub offline_episode: Option<OfflineEpisode>,
    pub last_recovery: Option<RecoveryOutcome>,
    pub playback: Option<PlaybackSnapshot>,
    pub policy: Option<WatchdogPolicy>,
}

impl WatchdogScheduler {
    pub async fn status(&self, node: &str) -> NodeStatus {
        // config errors surface as "no policy" here, the tick logs them
        let policy = self.config().policy(node).ok().flatten();
        let record = self.health().snapshot(node);
        let liveness = policy
            .as_ref()
            .map(|policy| compute_status(&record, policy, OffsetDateTime::now_utc()));

        NodeStatus {
            node: node.to_string(),
            enabled: policy.as_ref().map_or(false, |p| p.enabled),
            monitoring: self.is_monitoring(node),
            check_interval_secs: self.check_interval(node).map(|d| d.as_secs()),
            liveness,
            last_check: self.last_check(node),
            last_health_check: record,
            offline_episode: self.offline_episode(node),
            last_recovery: self.executor().last_outcome(node),
            playback: self.playback().snapshot(node).await,
            policy,
        }
    }

    /// Status of every configured node plus any node seen only at runtime.
    pub async fn all_status(&self) -> BTreeMap<String, NodeStatus> {
        let mut nodes = self.config().nodes().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cannot list configured nodes for status");
            Vec::new()
        });
        nodes.extend(self.health().nodes());
        nodes.extend(self.monitored_nodes());
        nodes.sort();
        nodes.dedup();

        let mut all = BTreeMap::new();
        for node in nodes {
            let status = self.status(&node).await;
            all.insert(node, status);
        }
        all
    }

    pub fn health_snapshot(&self, node: &str) -> HealthRecord {
        self.health().snapshot(node)
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub nodes_configured: u32,
    pub nodes_monitored: u32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

/// Process-level health: uptime and broker connection.
#[derive(Clone)]
pub struct KernelStatus {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl Default for KernelStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state("connecting".to_string()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, scheduler: &WatchdogScheduler) -> KernelHealth {
        let configured = scheduler.config().nodes().map(|n| n.len()).unwrap_or_default();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_configured: configured as u32,
            nodes_monitored: scheduler.monitored_nodes().len() as u32,
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}
