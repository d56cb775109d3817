use serde::Serialize;
use time::OffsetDateTime;

use crate::config::WatchdogPolicy;
use crate::health::HealthRecord;

/// Consecutive failed checks after which a reachable node is `degraded`.
pub const DEGRADED_FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLivenessStatus {
    Online,
    Degraded,
    Offline,
}

/// Derives the liveness of a node. Offline wins over degraded, degraded over online.
pub fn compute_status(record: &HealthRecord, policy: &WatchdogPolicy, now: OffsetDateTime) -> NodeLivenessStatus {
    let Some(last_seen) = record.last_seen else {
        return NodeLivenessStatus::Offline;
    };
    if now - last_seen > policy.offline_timeout() {
        return NodeLivenessStatus::Offline;
    }
    if record.consecutive_failures >= DEGRADED_FAILURE_THRESHOLD {
        return NodeLivenessStatus::Degraded;
    }
    NodeLivenessStatus::Online
}
