use fleetwatch_devkit::fakes::ProbeStep;
use fleetwatch_devkit::mqtt_stub::FleetMessageBuilder;
use fleetwatch_devkit::test_utils::{enabled_policy, TestHarness};
use fleetwatch_devkit::ScriptedProbe;
use fleetwatch_kernel::capabilities::{DisplayStateSource, DISPLAY_ON_KEY, PLAYING_KEY};
use fleetwatch_kernel::config::{DriverKind, NodeConf, RecoveryAction, WatchdogPolicy};
use fleetwatch_kernel::models::ProbeResult;
use fleetwatch_kernel::mqtt::ListenerContext;
use fleetwatch_kernel::status::KernelStatus;
use fleetwatch_kernel::watchdog::PROBE_PANICKED;
use fleetwatch_kernel::{HealthCheckOutcome, NodeLivenessStatus, TickOutcome, WatchdogScheduler};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

fn stale_harness(policy: WatchdogPolicy) -> TestHarness {
    let harness = TestHarness::with_probe(ScriptedProbe::failing("connection refused"));
    harness.add_node("hall", policy);
    harness
        .health
        .update_last_seen("hall", OffsetDateTime::now_utc() - time::Duration::hours(2));
    harness
}

#[tokio::test]
async fn test_stale_failing_node_triggers_exactly_one_recovery() {
    let harness = stale_harness(enabled_policy(RecoveryAction::Restart));

    let outcome = harness.scheduler.check_now("hall").await;

    assert!(matches!(outcome, TickOutcome::RecoveryTriggered { .. }));
    assert_eq!(harness.resetter.restarts(), vec!["hall"]);
    let record = harness.health.snapshot("hall");
    assert_eq!(record.consecutive_failures, 1);
    assert_eq!(record.last_error.as_deref(), Some("connection refused"));
    assert!(harness.executor.last_outcome("hall").unwrap().succeeded);
}

#[tokio::test]
async fn test_recent_failure_is_not_recovered_yet() {
    let harness = TestHarness::with_probe(ScriptedProbe::failing("timeout"));
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness
        .health
        .update_last_seen("hall", OffsetDateTime::now_utc() - time::Duration::minutes(5));

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Failing);
    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Failing);
    assert_eq!(harness.resetter.count(), 0);
    assert_eq!(harness.health.snapshot("hall").consecutive_failures, 2);
}

#[tokio::test]
async fn test_disabled_policy_tracks_without_recovery() {
    let harness = stale_harness(WatchdogPolicy { enabled: false, ..Default::default() });

    for _ in 0..3 {
        assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::TrackedOnly);
    }

    assert_eq!(harness.resetter.count(), 0);
    assert!(harness.executor.last_outcome("hall").is_none());
    assert_eq!(harness.health.snapshot("hall").consecutive_failures, 3);
}

#[tokio::test]
async fn test_fallback_scene_switches_once() {
    let harness = stale_harness(WatchdogPolicy {
        fallback_scene: Some("empty".into()),
        ..enabled_policy(RecoveryAction::FallbackScene)
    });

    harness.scheduler.check_now("hall").await;

    assert_eq!(harness.switcher.calls(), vec![("hall".to_string(), "empty".to_string())]);
    assert_eq!(harness.resetter.count(), 0);
}

#[tokio::test]
async fn test_display_off_skips_check() {
    let harness = stale_harness(enabled_policy(RecoveryAction::Restart));
    harness.display.set_bool("hall", DISPLAY_ON_KEY, false);

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Skipped);
    assert_eq!(harness.probe.calls(), 0);
    assert_eq!(harness.health.snapshot("hall").consecutive_failures, 0);
    assert_eq!(harness.resetter.count(), 0);
}

#[tokio::test]
async fn test_check_when_off_probes_powered_off_node() {
    let harness = stale_harness(WatchdogPolicy { check_when_off: true, ..enabled_policy(RecoveryAction::Restart) });
    harness.display.set_bool("hall", DISPLAY_ON_KEY, false);

    assert!(matches!(harness.scheduler.check_now("hall").await, TickOutcome::RecoveryTriggered { .. }));
    assert_eq!(harness.probe.calls(), 1);
}

#[tokio::test]
async fn test_never_seen_node_ages_from_watch_start() {
    let harness = TestHarness::with_probe(ScriptedProbe::failing("unreachable"));
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));

    assert_eq!(harness.scheduler.check_device("hall", Duration::from_secs(3600)).await, TickOutcome::Failing);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(
        harness.scheduler.check_device("hall", Duration::from_millis(1)).await,
        TickOutcome::RecoveryTriggered { .. }
    ));
    assert_eq!(harness.resetter.count(), 1);
}

#[tokio::test]
async fn test_successful_check_advances_last_seen() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    let old = OffsetDateTime::now_utc() - time::Duration::hours(2);
    harness.health.update_last_seen("hall", old);

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Healthy);

    let record = harness.health.snapshot("hall");
    assert!(record.last_seen.unwrap() > old);
    assert!(record.last_heartbeat_delay_ms.is_some());
    assert_eq!(harness.resetter.count(), 0);
}

#[tokio::test]
async fn test_probe_error_is_a_failed_check() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.probe.push(ProbeStep::Error("dns lookup failed".into()));

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Failing);
    assert_eq!(harness.health.snapshot("hall").last_error.as_deref(), Some("dns lookup failed"));
}

#[tokio::test]
async fn test_failure_without_error_text_gets_generic_error() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.probe.push(ProbeStep::Respond(ProbeResult { success: false, latency_ms: None, error: None }));

    harness.scheduler.check_now("hall").await;
    assert_eq!(harness.health.snapshot("hall").last_error.as_deref(), Some("health check failed"));
}

#[tokio::test]
async fn test_unconfigured_and_broken_nodes() {
    let harness = TestHarness::new();
    assert_eq!(harness.scheduler.check_now("ghost").await, TickOutcome::NotConfigured);

    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.config.break_node("hall");
    assert!(matches!(harness.scheduler.check_now("hall").await, TickOutcome::ConfigError { .. }));
    assert_eq!(harness.probe.calls(), 0);
}

#[tokio::test]
async fn test_stopped_scene_triggers_recovery_when_checked_while_off() {
    let harness = TestHarness::new();
    harness.add_node(
        "hall",
        WatchdogPolicy {
            check_when_off: true,
            fallback_scene: Some("empty".into()),
            ..enabled_policy(RecoveryAction::FallbackScene)
        },
    );
    harness.playback.load_scene("hall", "clock", None).await.unwrap();
    harness.playback.stop_scene("hall").await;

    let outcome = harness.scheduler.check_now("hall").await;

    assert_eq!(outcome, TickOutcome::RecoveryTriggered { reason: "scene stopped unexpectedly".into() });
    assert_eq!(harness.switcher.calls().len(), 1);
}

#[tokio::test]
async fn test_node_reporting_not_playing_counts_as_stopped() {
    let harness = TestHarness::new();
    harness.add_node("hall", WatchdogPolicy { check_when_off: true, ..enabled_policy(RecoveryAction::Restart) });
    harness.playback.load_scene("hall", "empty", None).await.unwrap();

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Healthy);

    harness.display.set_bool("hall", PLAYING_KEY, false);
    assert!(matches!(harness.scheduler.check_now("hall").await, TickOutcome::RecoveryTriggered { .. }));
    assert_eq!(harness.resetter.count(), 1);
}

#[tokio::test]
async fn test_stopped_scene_ignored_without_check_when_off() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.playback.load_scene("hall", "empty", None).await.unwrap();
    harness.playback.stop_scene("hall").await;

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Healthy);
    assert_eq!(harness.resetter.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_tick_is_reentrant() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.probe.set_delay(Duration::from_secs(1));

    let scheduler = harness.scheduler.clone();
    let first = tokio::spawn(async move { scheduler.check_now("hall").await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Reentrant);
    assert_eq!(first.await.unwrap(), TickOutcome::Healthy);
    assert_eq!(harness.probe.calls(), 1);
}

#[tokio::test]
async fn test_panicking_probe_counts_as_failed_check() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.probe.push(ProbeStep::Panic);

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Failing);
    let record = harness.health.snapshot("hall");
    assert_eq!(record.consecutive_failures, 1);
    assert_eq!(record.last_error.as_deref(), Some(PROBE_PANICKED));
    assert_eq!(harness.scheduler.offline_episode("hall").unwrap().failure_count, 1);

    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Healthy);
    assert!(harness.scheduler.offline_episode("hall").is_none());
}

#[tokio::test]
async fn test_stale_node_with_panicking_probe_is_recovered_every_tick() {
    let harness = TestHarness::with_probe(ScriptedProbe::with_default(ProbeStep::Panic));
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness
        .health
        .update_last_seen("hall", OffsetDateTime::now_utc() - time::Duration::hours(2));

    for tick in 1..=3 {
        assert!(matches!(harness.scheduler.check_now("hall").await, TickOutcome::RecoveryTriggered { .. }));
        assert_eq!(harness.resetter.count(), tick);
    }
    let record = harness.health.snapshot("hall");
    assert_eq!(record.consecutive_failures, 3);
    assert!(record.failing);
}

struct CorruptDisplayStore;

impl DisplayStateSource for CorruptDisplayStore {
    fn get_bool(&self, node: &str, _key: &str, _default: bool) -> bool {
        panic!("display state for {node} is corrupt")
    }
}

#[tokio::test]
async fn test_panic_outside_probe_is_contained_per_tick() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    let scheduler = WatchdogScheduler::new(
        Arc::new(harness.config.clone()),
        Arc::new(harness.probe.clone()),
        Arc::new(CorruptDisplayStore),
        harness.health.clone(),
        harness.playback.clone(),
        harness.executor.clone(),
    );

    assert_eq!(scheduler.check_now("hall").await, TickOutcome::Panicked);
    assert_eq!(scheduler.last_check("hall").unwrap().outcome, TickOutcome::Panicked);
    // the in-flight marker was released while unwinding
    assert_eq!(scheduler.check_now("hall").await, TickOutcome::Panicked);
    assert_eq!(harness.probe.calls(), 0);
}

#[tokio::test]
async fn test_stalled_display_does_not_block_ticks_or_stop() {
    let harness = TestHarness::new();
    harness.add_node("hall", WatchdogPolicy { check_when_off: true, ..enabled_policy(RecoveryAction::Restart) });
    harness.sink.set_stalled(true);
    harness.playback.load_scene("hall", "empty", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let tick = tokio::time::timeout(Duration::from_secs(1), harness.scheduler.check_now("hall")).await;
    assert_eq!(tick.unwrap(), TickOutcome::Healthy);

    let stopped = tokio::time::timeout(Duration::from_secs(1), harness.playback.stop_scene("hall")).await;
    assert!(stopped.unwrap());

    let tick = tokio::time::timeout(Duration::from_secs(1), harness.scheduler.check_now("hall")).await;
    assert_eq!(tick.unwrap(), TickOutcome::RecoveryTriggered { reason: "scene stopped unexpectedly".into() });
    assert_eq!(harness.resetter.count(), 1);
}

#[tokio::test]
async fn test_power_off_report_skips_following_tick() {
    let harness = stale_harness(enabled_policy(RecoveryAction::Restart));
    let listener = ListenerContext {
        prefix: "fleet".into(),
        health: harness.health.clone(),
        display: harness.display.clone(),
        kernel: KernelStatus::new(),
    };
    let power_off = serde_json::to_vec(&FleetMessageBuilder::power_v1(false)).unwrap();

    assert!(listener.handle_publish("fleet/hall/power@v1", &power_off));
    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Skipped);
    assert_eq!(harness.resetter.count(), 0);

    let heartbeat = serde_json::to_vec(&FleetMessageBuilder::heartbeat_v1("hall")).unwrap();
    let power_on = serde_json::to_vec(&FleetMessageBuilder::power_v1(true)).unwrap();
    assert!(listener.handle_publish("fleet/hall/heartbeat@v1", &heartbeat));
    assert!(listener.handle_publish("fleet/hall/power@v1", &power_on));
    assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Failing);
}

#[tokio::test]
async fn test_node_playback_report_feeds_stopped_check() {
    let harness = TestHarness::new();
    harness.add_node("hall", WatchdogPolicy { check_when_off: true, ..enabled_policy(RecoveryAction::Restart) });
    harness.playback.load_scene("hall", "empty", None).await.unwrap();
    let listener = ListenerContext {
        prefix: "fleet".into(),
        health: harness.health.clone(),
        display: harness.display.clone(),
        kernel: KernelStatus::new(),
    };
    let not_playing = serde_json::to_vec(&FleetMessageBuilder::playback_v1(false)).unwrap();

    assert!(listener.handle_publish("fleet/hall/playback@v1", &not_playing));
    assert!(matches!(harness.scheduler.check_now("hall").await, TickOutcome::RecoveryTriggered { .. }));
}

#[tokio::test]
async fn test_perform_health_check_skips_powered_off_node() {
    let harness = TestHarness::with_probe(ScriptedProbe::failing("connection refused"));
    let policy = enabled_policy(RecoveryAction::Restart);
    harness.add_node("hall", policy.clone());
    harness.scheduler.check_now("hall").await;
    harness.display.set_bool("hall", DISPLAY_ON_KEY, false);

    assert_eq!(harness.scheduler.perform_health_check("hall", &policy).await, HealthCheckOutcome::Skipped);
    assert_eq!(harness.health.snapshot("hall").consecutive_failures, 1);
    assert_eq!(harness.probe.calls(), 1);

    let checked_while_off = WatchdogPolicy { check_when_off: true, ..policy };
    assert_eq!(
        harness.scheduler.perform_health_check("hall", &checked_while_off).await,
        HealthCheckOutcome::Failed { error: "connection refused".into() }
    );
    assert_eq!(harness.health.snapshot("hall").consecutive_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_monitoring_checks_immediately_then_every_interval() {
    let harness = TestHarness::new();
    harness.add_node("hall", WatchdogPolicy { check_interval_seconds: 10, ..enabled_policy(RecoveryAction::Restart) });

    assert!(harness.scheduler.start_monitoring("hall"));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(harness.probe.calls(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.probe.calls(), 2);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(harness.probe.calls(), 4);

    harness.scheduler.stop_all();
}

#[tokio::test(start_paused = true)]
async fn test_restarting_monitoring_keeps_a_single_timeline() {
    let harness = TestHarness::new();
    harness.add_node("hall", WatchdogPolicy { check_interval_seconds: 10, ..enabled_policy(RecoveryAction::Restart) });

    assert!(harness.scheduler.start_monitoring("hall"));
    assert!(harness.scheduler.start_monitoring("hall"));
    assert!(harness.scheduler.start_monitoring("hall"));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(harness.probe.calls(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.probe.calls(), 4);
    assert_eq!(harness.scheduler.monitored_nodes(), vec!["hall"]);

    harness.scheduler.stop_all();
}

#[tokio::test(start_paused = true)]
async fn test_stop_monitoring_is_idempotent() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));

    assert!(!harness.scheduler.stop_monitoring("hall"));
    assert!(harness.scheduler.start_monitoring("hall"));
    assert!(harness.scheduler.stop_monitoring("hall"));
    assert!(!harness.scheduler.stop_monitoring("hall"));
    assert!(!harness.scheduler.is_monitoring("hall"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.probe.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_result_of_unmonitored_node_is_discarded() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.probe.set_delay(Duration::from_secs(2));

    harness.scheduler.start_monitoring("hall");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.probe.calls(), 1);
    harness.scheduler.stop_monitoring("hall");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(harness.scheduler.last_check("hall").is_none());
    assert_eq!(harness.health.snapshot("hall").consecutive_successes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_all_skips_invalid_policy() {
    let harness = TestHarness::new();
    harness.add_node("hall", enabled_policy(RecoveryAction::Restart));
    harness.add_node("kiosk", WatchdogPolicy { check_interval_seconds: 0, ..enabled_policy(RecoveryAction::Restart) });
    harness.config.set_node("lobby", NodeConf::default());

    assert_eq!(harness.scheduler.start_all(), 1);
    assert_eq!(harness.scheduler.monitored_nodes(), vec!["hall"]);
    assert!(matches!(harness.scheduler.check_now("kiosk").await, TickOutcome::ConfigError { .. }));

    assert_eq!(harness.scheduler.stop_all(), 1);
    assert!(harness.scheduler.monitored_nodes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_simulated_node_is_not_monitored() {
    let harness = TestHarness::new();
    harness.config.set_node(
        "sim",
        NodeConf { driver: DriverKind::Mock, watchdog: Some(WatchdogPolicy::default()), ..Default::default() },
    );
    harness.add_node("hall", WatchdogPolicy::default());

    assert!(!harness.scheduler.start_monitoring("sim"));
    assert!(harness.scheduler.start_monitoring("hall"));
    harness.scheduler.stop_all();
}

#[tokio::test]
async fn test_status_reports_liveness_and_recovery() {
    let harness = stale_harness(enabled_policy(RecoveryAction::Restart));
    harness.scheduler.check_now("hall").await;
    harness.scheduler.check_now("hall").await;

    let status = harness.scheduler.status("hall").await;
    assert!(status.enabled);
    assert!(!status.monitoring);
    assert_eq!(status.liveness, Some(NodeLivenessStatus::Offline));
    assert_eq!(status.last_health_check.consecutive_failures, 2);
    assert_eq!(status.offline_episode.unwrap().failure_count, 2);
    assert_eq!(status.last_recovery.unwrap().action, RecoveryAction::Restart);

    let all = harness.scheduler.all_status().await;
    assert!(all.contains_key("hall"));
}
