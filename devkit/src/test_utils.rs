/*!
Test harness for the supervision core

Wires a complete kernel from the fakes:
- scripted probe, in-memory config and display flags
- real health tracker, playback state machine and watchdog scheduler
- recording switcher / resetter / notifier / command transport behind recovery
*/

use crate::fakes::{
    InMemoryConfig, RecordingCommands, RecordingNotifier, RecordingResetter, RecordingSink, RecordingSwitcher,
    ScriptedProbe, SlowScene,
};
use anyhow::Result;
use fleetwatch_kernel::config::{NodeConf, RecoveryAction, WatchdogPolicy};
use fleetwatch_kernel::scenes::SceneCatalog;
use fleetwatch_kernel::state::DisplayStateStore;
use fleetwatch_kernel::{HealthTracker, PlaybackStateMachine, RecoveryActionExecutor, WatchdogScheduler};
use std::sync::Arc;
use std::time::Duration;

/// Name of the slow, single-frame scene registered by the harness.
pub const SLOW_SCENE: &str = "slow";
/// Render time of [`SLOW_SCENE`].
pub const SLOW_RENDER: Duration = Duration::from_millis(500);

pub struct TestHarness {
    pub config: InMemoryConfig,
    pub probe: ScriptedProbe,
    pub display: DisplayStateStore,
    pub health: HealthTracker,
    pub sink: RecordingSink,
    pub playback: PlaybackStateMachine,
    pub switcher: RecordingSwitcher,
    pub resetter: RecordingResetter,
    pub notifier: RecordingNotifier,
    pub commands: RecordingCommands,
    pub executor: Arc<RecoveryActionExecutor>,
    pub scheduler: WatchdogScheduler,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_probe(ScriptedProbe::healthy())
    }

    pub fn with_probe(probe: ScriptedProbe) -> Self {
        init_tracing();

        let config = InMemoryConfig::new();
        let display = DisplayStateStore::new();
        let health = HealthTracker::new();
        let sink = RecordingSink::new();

        let mut catalog = SceneCatalog::with_builtin();
        catalog.register(Arc::new(SlowScene::new(SLOW_SCENE, SLOW_RENDER)));
        let playback = PlaybackStateMachine::new(catalog, Arc::new(sink.clone())).with_health(health.clone());

        let switcher = RecordingSwitcher::new();
        let resetter = RecordingResetter::new();
        let notifier = RecordingNotifier::new();
        let commands = RecordingCommands::new();
        let executor = Arc::new(
            RecoveryActionExecutor::new(Arc::new(switcher.clone()), Arc::new(resetter.clone()))
                .with_command_sender(Arc::new(commands.clone()))
                .with_notifier(Arc::new(notifier.clone())),
        );

        let scheduler = WatchdogScheduler::new(
            Arc::new(config.clone()),
            Arc::new(probe.clone()),
            Arc::new(display.clone()),
            health.clone(),
            playback.clone(),
            executor.clone(),
        );

        Self {
            config,
            probe,
            display,
            health,
            sink,
            playback,
            switcher,
            resetter,
            notifier,
            commands,
            executor,
            scheduler,
        }
    }

    /// Registers `node` as a physical device with `policy`.
    pub fn add_node(&self, node: &str, policy: WatchdogPolicy) -> &Self {
        self.config.set_node(node, NodeConf { watchdog: Some(policy), ..Default::default() });
        self
    }

    /// Polls `check` every 10ms until it holds or `timeout_ms` elapses.
    pub async fn wait_until(&self, timeout_ms: u64, mut check: impl FnMut() -> bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("condition not met within {timeout_ms}ms")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Recovery enabled with `action` and defaults elsewhere.
pub fn enabled_policy(action: RecoveryAction) -> WatchdogPolicy {
    WatchdogPolicy { enabled: true, action, ..Default::default() }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwatch_kernel::TickOutcome;

    #[tokio::test]
    async fn test_harness_healthy_node() {
        let harness = TestHarness::new();
        harness.add_node("hall", enabled_policy(RecoveryAction::Restart));

        assert_eq!(harness.scheduler.check_now("hall").await, TickOutcome::Healthy);
        assert_eq!(harness.health.snapshot("hall").consecutive_successes, 1);
        assert_eq!(harness.resetter.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let harness = TestHarness::new();
        assert!(harness.wait_until(30, || false).await.is_err());
        assert!(harness.wait_until(30, || true).await.is_ok());
    }
}
