//! Per-node liveness records.
//!
//! [`HealthTracker`] is the only place where liveness counters change. Every
//! other component reads owned snapshots.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use crate::models::ProbeResult;

pub const GENERIC_CHECK_ERROR: &str = "health check failed";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthRecord {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    pub last_heartbeat_delay_ms: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
    pub failing: bool,
}

impl HealthRecord {
    fn advance_last_seen(&mut self, ts: OffsetDateTime) {
        if self.last_seen.map_or(true, |seen| ts > seen) {
            self.last_seen = Some(ts);
        }
    }

    fn clear_failure(&mut self) {
        self.consecutive_failures = 0;
        self.failing = false;
        self.last_error = None;
    }
}

#[derive(Clone, Default)]
pub struct HealthTracker {
    records: Arc<Mutex<HashMap<String, HealthRecord>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<R>(&self, node: &str, f: impl FnOnce(&mut HealthRecord) -> R) -> R {
        let mut records = self.records.lock();
        let record = records.entry(node.to_string()).or_default();
        f(record)
    }

    pub fn record_check_start(&self, node: &str) {
        self.record_check_start_at(node, OffsetDateTime::now_utc());
    }

    pub fn record_check_start_at(&self, node: &str, now: OffsetDateTime) {
        self.with_record(node, |record| record.last_check = Some(now));
    }

    pub fn record_check_result(&self, node: &str, result: &ProbeResult) {
        self.record_check_result_at(node, result, OffsetDateTime::now_utc());
    }

    pub fn record_check_result_at(&self, node: &str, result: &ProbeResult, now: OffsetDateTime) {
        self.with_record(node, |record| {
            record.last_check = Some(now);
            if result.success {
                record.consecutive_successes = record.consecutive_successes.saturating_add(1);
                record.clear_failure();
                record.last_heartbeat = Some(now);
                record.last_heartbeat_delay_ms = result.latency_ms;
                record.advance_last_seen(now);
            } else {
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                record.consecutive_successes = 0;
                record.failing = true;
                record.last_error = Some(
                    result
                        .error
                        .clone()
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| GENERIC_CHECK_ERROR.to_string()),
                );
            }
        });
    }

    /// Positive signal from outside the probe path (frame pushed, heartbeat received).
    ///
    /// Idempotent: repeating the same timestamp changes nothing.
    pub fn update_last_seen(&self, node: &str, ts: OffsetDateTime) {
        self.with_record(node, |record| {
            record.advance_last_seen(ts);
            record.clear_failure();
            if record.consecutive_successes == 0 {
                record.consecutive_successes = 1;
            }
        });
    }

    pub fn is_stale(&self, node: &str, threshold: Duration) -> bool {
        self.is_stale_at(node, threshold, OffsetDateTime::now_utc())
    }

    pub fn is_stale_at(&self, node: &str, threshold: Duration, now: OffsetDateTime) -> bool {
        match self.with_record(node, |record| record.last_seen) {
            None => true,
            Some(seen) => now - seen > threshold,
        }
    }

    pub fn snapshot(&self, node: &str) -> HealthRecord {
        self.with_record(node, |record| record.clone())
    }

    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.records.lock().keys().cloned().collect();
        nodes.sort();
        nodes
    }
}
