//! Watchdog: one periodic check timeline per monitored node.
//!
//! Each timeline is an independent tokio task owning a [`CancellationToken`].
//! Ticks for the same node never overlap: a tick that finds another one in
//! flight is skipped, not queued. A check still running when the node is
//! unmonitored finishes and its result is dropped.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{ConfigSource, DisplayStateSource, HealthCheckProbe, DISPLAY_ON_KEY, PLAYING_KEY};
use crate::config::{DriverKind, WatchdogPolicy, DEFAULT_CHECK_INTERVAL_SECONDS};
use crate::health::{HealthTracker, GENERIC_CHECK_ERROR};
use crate::models::{PlayState, ProbeResult};
use crate::playback::PlaybackStateMachine;
use crate::recovery::RecoveryActionExecutor;

/// Error recorded for a probe that panicked instead of answering.
pub const PROBE_PANICKED: &str = "probe panicked";

/// While a node stays offline, repeat the offline log line at most this often.
pub const OFFLINE_SUMMARY_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HealthCheckOutcome {
    Healthy { latency_ms: u64 },
    Failed { error: String },
    /// Node intentionally powered off and `check_when_off` unset. Not a failure.
    Skipped,
    /// Node was unmonitored while the probe ran.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TickOutcome {
    Healthy,
    Failing,
    RecoveryTriggered { reason: String },
    /// Recovery disabled: only liveness was recorded.
    TrackedOnly,
    Skipped,
    Discarded,
    Reentrant,
    NotConfigured,
    ConfigError { error: String },
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastCheck {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineEpisode {
    #[serde(with = "time::serde::rfc3339")]
    pub first_failure: OffsetDateTime,
    pub failure_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_summary_log: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeEvent {
    Opened,
    Summary { offline_for: time::Duration, failures: u32 },
    Continuing,
    Closed { offline_for: time::Duration, failures: u32 },
    StillOnline,
}

/// Open offline episodes, keyed by node.
#[derive(Debug, Default)]
pub struct OfflineEpisodes {
    episodes: HashMap<String, OfflineEpisode>,
}

impl OfflineEpisodes {
    pub fn on_result(&mut self, node: &str, success: bool, now: OffsetDateTime) -> EpisodeEvent {
        if success {
            return match self.episodes.remove(node) {
                Some(ep) => EpisodeEvent::Closed { offline_for: now - ep.first_failure, failures: ep.failure_count },
                None => EpisodeEvent::StillOnline,
            };
        }
        match self.episodes.get_mut(node) {
            None => {
                self.episodes.insert(
                    node.to_string(),
                    OfflineEpisode { first_failure: now, failure_count: 1, last_summary_log: now },
                );
                EpisodeEvent::Opened
            }
            Some(ep) => {
                ep.failure_count += 1;
                if now - ep.last_summary_log >= OFFLINE_SUMMARY_INTERVAL {
                    ep.last_summary_log = now;
                    EpisodeEvent::Summary { offline_for: now - ep.first_failure, failures: ep.failure_count }
                } else {
                    EpisodeEvent::Continuing
                }
            }
        }
    }

    pub fn get(&self, node: &str) -> Option<&OfflineEpisode> {
        self.episodes.get(node)
    }
}

struct MonitorHandle {
    token: CancellationToken,
    period: Duration,
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    node: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, node: &str) -> Option<Self> {
        if set.lock().insert(node.to_string()) {
            Some(Self { set, node: node.to_string() })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.node);
    }
}

struct SchedulerInner {
    config: Arc<dyn ConfigSource>,
    probe: Arc<dyn HealthCheckProbe>,
    display: Arc<dyn DisplayStateSource>,
    health: HealthTracker,
    playback: PlaybackStateMachine,
    executor: Arc<RecoveryActionExecutor>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    in_flight: Mutex<HashSet<String>>,
    episodes: Mutex<OfflineEpisodes>,
    last_checks: Mutex<HashMap<String, LastCheck>>,
    watch_started: Mutex<HashMap<String, OffsetDateTime>>,
}

#[derive(Clone)]
pub struct WatchdogScheduler {
    inner: Arc<SchedulerInner>,
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.map_or(false, |t| t.is_cancelled())
}

impl WatchdogScheduler {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        probe: Arc<dyn HealthCheckProbe>,
        display: Arc<dyn DisplayStateSource>,
        health: HealthTracker,
        playback: PlaybackStateMachine,
        executor: Arc<RecoveryActionExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                probe,
                display,
                health,
                playback,
                executor,
                monitors: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                episodes: Mutex::new(OfflineEpisodes::default()),
                last_checks: Mutex::new(HashMap::new()),
                watch_started: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// (Re)starts the node's timeline. Returns false when the node is not monitored.
    pub fn start_monitoring(&self, node: &str) -> bool {
        let policy = match self.inner.config.policy(node) {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                debug!(node, "no watchdog policy, node not monitored");
                return false;
            }
            Err(e) => {
                warn!(node, error = %e, "cannot read watchdog policy, node not monitored");
                return false;
            }
        };
        let driver = self
            .inner
            .config
            .node(node)
            .ok()
            .flatten()
            .map(|conf| conf.driver)
            .unwrap_or_default();

        // hardware nodes are tracked for dashboards even with recovery disabled
        if !policy.enabled && driver != DriverKind::Real {
            debug!(node, "watchdog disabled for simulated node");
            self.stop_monitoring(node);
            return false;
        }

        self.cancel_timeline(node);

        let period = if policy.check_interval_seconds == 0 {
            Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECONDS)
        } else {
            policy.check_interval()
        };
        let token = CancellationToken::new();
        self.inner
            .monitors
            .lock()
            .insert(node.to_string(), MonitorHandle { token: token.clone(), period });
        self.inner
            .watch_started
            .lock()
            .entry(node.to_string())
            .or_insert_with(OffsetDateTime::now_utc);

        let scheduler = self.clone();
        let first_node = node.to_string();
        let first_token = token.clone();
        tokio::spawn(async move {
            scheduler.guarded_tick(&first_node, None, Some(&first_token)).await;
        });
        tokio::spawn(self.clone().run_timeline(node.to_string(), period, token));

        info!(
            node,
            interval_secs = period.as_secs(),
            recovery = policy.enabled,
            action = %policy.action,
            "watchdog monitoring started"
        );
        true
    }

    /// Idempotent; safe on a node that was never monitored.
    pub fn stop_monitoring(&self, node: &str) -> bool {
        let stopped = self.cancel_timeline(node);
        self.inner.watch_started.lock().remove(node);
        if stopped {
            info!(node, "watchdog monitoring stopped");
        }
        stopped
    }

    fn cancel_timeline(&self, node: &str) -> bool {
        match self.inner.monitors.lock().remove(node) {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn start_all(&self) -> usize {
        let nodes = match self.inner.config.nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "cannot list configured nodes, watchdog not started");
                return 0;
            }
        };
        let started = nodes.iter().filter(|node| self.start_monitoring(node)).count();
        info!(started, configured = nodes.len(), "watchdog timelines started");
        started
    }

    pub fn stop_all(&self) -> usize {
        let nodes = self.monitored_nodes();
        for node in &nodes {
            self.stop_monitoring(node);
        }
        nodes.len()
    }

    pub fn is_monitoring(&self, node: &str) -> bool {
        self.inner.monitors.lock().contains_key(node)
    }

    pub fn monitored_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.inner.monitors.lock().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn check_interval(&self, node: &str) -> Option<Duration> {
        self.inner.monitors.lock().get(node).map(|handle| handle.period)
    }

    async fn run_timeline(self, node: String, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.guarded_tick(&node, None, Some(&token)).await;
                }
            }
        }
        debug!(node = %node, "watchdog timeline ended");
    }

    /// One tick with an explicit offline timeout.
    pub async fn check_device(&self, node: &str, timeout: Duration) -> TickOutcome {
        self.guarded_tick(node, Some(timeout), None).await
    }

    /// One tick using the policy's offline timeout.
    pub async fn check_now(&self, node: &str) -> TickOutcome {
        self.guarded_tick(node, None, None).await
    }

    /// Probe panics are failed checks; this catches panics anywhere else in the tick.
    async fn guarded_tick(&self, node: &str, timeout: Option<Duration>, token: Option<&CancellationToken>) -> TickOutcome {
        match AssertUnwindSafe(self.tick(node, timeout, token)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(node, "watchdog tick panicked");
                self.record_last_check(node, TickOutcome::Panicked);
                TickOutcome::Panicked
            }
        }
    }

    async fn tick(&self, node: &str, timeout: Option<Duration>, token: Option<&CancellationToken>) -> TickOutcome {
        if is_cancelled(token) {
            return TickOutcome::Discarded;
        }
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, node) else {
            debug!(node, "previous check still running, tick skipped");
            return TickOutcome::Reentrant;
        };

        let policy = match self.inner.config.policy(node) {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                debug!(node, "no watchdog policy, tick ignored");
                return TickOutcome::NotConfigured;
            }
            Err(e) => {
                warn!(node, error = %e, "cannot read watchdog policy");
                let outcome = TickOutcome::ConfigError { error: e.to_string() };
                self.record_last_check(node, outcome.clone());
                return outcome;
            }
        };
        let timeout = timeout.unwrap_or_else(|| policy.offline_timeout());

        let check = self.health_check(node, &policy, token).await;
        let outcome = self.evaluate(node, &policy, timeout, &check).await;
        if outcome != TickOutcome::Discarded {
            self.record_last_check(node, outcome.clone());
        }
        outcome
    }

    async fn evaluate(
        &self,
        node: &str,
        policy: &WatchdogPolicy,
        timeout: Duration,
        check: &HealthCheckOutcome,
    ) -> TickOutcome {
        match check {
            HealthCheckOutcome::Discarded => return TickOutcome::Discarded,
            HealthCheckOutcome::Skipped => return TickOutcome::Skipped,
            _ => {}
        }
        if !policy.enabled {
            return TickOutcome::TrackedOnly;
        }

        let now = OffsetDateTime::now_utc();
        let reference = match self.inner.health.snapshot(node).last_seen {
            Some(seen) => seen,
            // never seen: age from when we started watching
            None => *self.inner.watch_started.lock().entry(node.to_string()).or_insert(now),
        };
        let silent_for = now - reference;
        if silent_for > timeout {
            let reason = format!("no response for {}s", silent_for.whole_seconds());
            self.inner.executor.execute(node, policy, &reason).await;
            return TickOutcome::RecoveryTriggered { reason };
        }

        if policy.check_when_off && self.scene_stopped(node).await {
            let reason = "scene stopped unexpectedly".to_string();
            self.inner.executor.execute(node, policy, &reason).await;
            return TickOutcome::RecoveryTriggered { reason };
        }

        match check {
            HealthCheckOutcome::Healthy { .. } => TickOutcome::Healthy,
            _ => TickOutcome::Failing,
        }
    }

    /// Stopped on our side, or playing on our side while the node reports it is not.
    async fn scene_stopped(&self, node: &str) -> bool {
        match self.inner.playback.play_state(node).await {
            Some(PlayState::Stopped) => true,
            Some(PlayState::Playing) => !self.inner.display.get_bool(node, PLAYING_KEY, true),
            _ => false,
        }
    }

    /// Probes the node and records the result, unless the node is intentionally off.
    pub async fn perform_health_check(&self, node: &str, policy: &WatchdogPolicy) -> HealthCheckOutcome {
        self.health_check(node, policy, None).await
    }

    async fn health_check(
        &self,
        node: &str,
        policy: &WatchdogPolicy,
        token: Option<&CancellationToken>,
    ) -> HealthCheckOutcome {
        if !self.inner.display.get_bool(node, DISPLAY_ON_KEY, true) && !policy.check_when_off {
            debug!(node, "display intentionally off, health check skipped");
            return HealthCheckOutcome::Skipped;
        }

        self.inner.health.record_check_start(node);
        let started = Instant::now();
        let mut result = match AssertUnwindSafe(self.inner.probe.check(node)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ProbeResult::failed(e.to_string()),
            Err(_) => {
                error!(node, "health probe panicked");
                ProbeResult::failed(PROBE_PANICKED)
            }
        };
        if is_cancelled(token) {
            debug!(node, "node unmonitored during check, result discarded");
            return HealthCheckOutcome::Discarded;
        }
        if result.success && result.latency_ms.is_none() {
            result.latency_ms = Some(started.elapsed().as_millis() as u64);
        }

        self.inner.health.record_check_result(node, &result);
        self.log_episode(node, &result);

        if result.success {
            HealthCheckOutcome::Healthy { latency_ms: result.latency_ms.unwrap_or_default() }
        } else {
            HealthCheckOutcome::Failed {
                error: result.error.unwrap_or_else(|| GENERIC_CHECK_ERROR.to_string()),
            }
        }
    }

    fn log_episode(&self, node: &str, result: &ProbeResult) {
        let event = self
            .inner
            .episodes
            .lock()
            .on_result(node, result.success, OffsetDateTime::now_utc());
        let error = result.error.as_deref().unwrap_or(GENERIC_CHECK_ERROR);
        match event {
            EpisodeEvent::Opened => warn!(node, error, "node offline"),
            EpisodeEvent::Summary { offline_for, failures } => warn!(
                node,
                offline_secs = offline_for.whole_seconds(),
                failures,
                error,
                "node still offline"
            ),
            EpisodeEvent::Continuing => debug!(node, error, "node still failing"),
            EpisodeEvent::Closed { offline_for, failures } => info!(
                node,
                offline_secs = offline_for.whole_seconds(),
                failures,
                "node back online"
            ),
            EpisodeEvent::StillOnline => {}
        }
    }

    fn record_last_check(&self, node: &str, outcome: TickOutcome) {
        self.inner.last_checks.lock().insert(
            node.to_string(),
            LastCheck { at: OffsetDateTime::now_utc(), outcome },
        );
    }

    pub fn last_check(&self, node: &str) -> Option<LastCheck> {
        self.inner.last_checks.lock().get(node).cloned()
    }

    pub fn offline_episode(&self, node: &str) -> Option<OfflineEpisode> {
        self.inner.episodes.lock().get(node).cloned()
    }

    pub fn config(&self) -> &Arc<dyn ConfigSource> {
        &self.inner.config
    }

    pub fn health(&self) -> &HealthTracker {
        &self.inner.health
    }

    pub fn playback(&self) -> &PlaybackStateMachine {
        &self.inner.playback
    }

    pub fn executor(&self) -> &Arc<RecoveryActionExecutor> {
        &self.inner.executor
    }
}
