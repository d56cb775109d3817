/*!
In-memory stand-ins for the kernel capabilities.

Every fake records what it was asked to do, so tests assert on calls
instead of on network traffic.
*/

use async_trait::async_trait;
use fleetwatch_kernel::capabilities::{
    CommandSender, ConfigSource, DisplaySink, HealthCheckProbe, NodeResetter, Notifier, SceneSwitcher,
};
use fleetwatch_kernel::config::{ConfigError, NodeCommand, NodeConf, WatchdogPolicy};
use fleetwatch_kernel::models::{Frame, ProbeResult, WatchdogNotification};
use fleetwatch_kernel::scenes::{RenderContext, Scene};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the next probe call does.
#[derive(Debug, Clone)]
pub enum ProbeStep {
    Respond(ProbeResult),
    Error(String),
    Panic,
}

/// Probe answering from a script, then from a default result.
#[derive(Clone)]
pub struct ScriptedProbe {
    script: Arc<Mutex<VecDeque<ProbeStep>>>,
    default: Arc<Mutex<ProbeStep>>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<AtomicUsize>,
    nodes: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::with_default(ProbeStep::Respond(ProbeResult::ok(5)))
    }

    pub fn failing(error: &str) -> Self {
        Self::with_default(ProbeStep::Respond(ProbeResult::failed(error)))
    }

    pub fn with_default(default: ProbeStep) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            default: Arc::new(Mutex::new(default)),
            delay: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
            nodes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, step: ProbeStep) -> &Self {
        self.script.lock().push_back(step);
        self
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, node: &str) -> usize {
        self.nodes.lock().iter().filter(|n| n.as_str() == node).count()
    }
}

#[async_trait]
impl HealthCheckProbe for ScriptedProbe {
    async fn check(&self, node: &str) -> anyhow::Result<ProbeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.nodes.lock().push(node.to_string());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let step = {
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.default.lock().clone())
        };
        match step {
            ProbeStep::Respond(result) => Ok(result),
            ProbeStep::Error(error) => anyhow::bail!(error),
            ProbeStep::Panic => panic!("scripted probe panic for {node}"),
        }
    }
}

/// Records scene switches. Answers `accept` for every one of them.
#[derive(Clone)]
pub struct RecordingSwitcher {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    accept: Arc<Mutex<bool>>,
}

impl RecordingSwitcher {
    pub fn new() -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())), accept: Arc::new(Mutex::new(true)) }
    }

    pub fn rejecting() -> Self {
        let switcher = Self::new();
        *switcher.accept.lock() = false;
        switcher
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

impl Default for RecordingSwitcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SceneSwitcher for RecordingSwitcher {
    async fn switch_scene(&self, node: &str, scene: &str, _payload: Option<serde_json::Value>) -> bool {
        self.calls.lock().push((node.to_string(), scene.to_string()));
        *self.accept.lock()
    }
}

#[derive(Clone, Default)]
pub struct RecordingResetter {
    restarts: Arc<Mutex<Vec<String>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingResetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let resetter = Self::default();
        *resetter.fail.lock() = true;
        resetter
    }

    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.restarts.lock().len()
    }
}

#[async_trait]
impl NodeResetter for RecordingResetter {
    async fn restart(&self, node: &str) -> anyhow::Result<()> {
        self.restarts.lock().push(node.to_string());
        if *self.fail.lock() {
            anyhow::bail!("power relay unreachable");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<WatchdogNotification>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }

    pub fn sent(&self) -> Vec<WatchdogNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &WatchdogNotification) -> anyhow::Result<()> {
        if *self.fail.lock() {
            anyhow::bail!("alert channel down");
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Records commands; the command named in `fail_on` is rejected.
#[derive(Clone, Default)]
pub struct RecordingCommands {
    sent: Arc<Mutex<Vec<(String, NodeCommand)>>>,
    fail_on: Arc<Mutex<Option<String>>>,
}

impl RecordingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, command: &str) {
        *self.fail_on.lock() = Some(command.to_string());
    }

    pub fn sent(&self) -> Vec<(String, NodeCommand)> {
        self.sent.lock().clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, cmd)| cmd.command.clone()).collect()
    }
}

#[async_trait]
impl CommandSender for RecordingCommands {
    async fn send(&self, node: &str, command: &NodeCommand) -> anyhow::Result<()> {
        if self.fail_on.lock().as_deref() == Some(command.command.as_str()) {
            anyhow::bail!("node rejected {}", command.command);
        }
        self.sent.lock().push((node.to_string(), command.clone()));
        Ok(())
    }
}

/// Display that remembers every frame and clear it received.
#[derive(Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<(String, Frame)>>>,
    clears: Arc<Mutex<Vec<String>>>,
    stalled: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While stalled, frame pushes never complete, like a publish into a full broker queue.
    pub fn set_stalled(&self, stalled: bool) {
        *self.stalled.lock() = stalled;
    }

    pub fn frames(&self, node: &str) -> Vec<Frame> {
        self.frames
            .lock()
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn scenes_drawn(&self, node: &str) -> Vec<String> {
        self.frames(node).into_iter().map(|frame| frame.scene).collect()
    }

    pub fn clears(&self, node: &str) -> usize {
        self.clears.lock().iter().filter(|n| n.as_str() == node).count()
    }
}

#[async_trait]
impl DisplaySink for RecordingSink {
    async fn push_frame(&self, node: &str, frame: &Frame) -> anyhow::Result<()> {
        let stalled = *self.stalled.lock();
        if stalled {
            std::future::pending::<()>().await;
        }
        self.frames.lock().push((node.to_string(), frame.clone()));
        Ok(())
    }

    async fn clear(&self, node: &str) -> anyhow::Result<()> {
        self.clears.lock().push(node.to_string());
        Ok(())
    }
}

/// [`ConfigSource`] that tests mutate between ticks.
#[derive(Clone, Default)]
pub struct InMemoryConfig {
    nodes: Arc<Mutex<HashMap<String, NodeConf>>>,
    broken: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node(&self, node: &str, conf: NodeConf) {
        self.nodes.lock().insert(node.to_string(), conf);
    }

    /// Replaces the node's policy, creating the node if needed.
    pub fn set_policy(&self, node: &str, policy: WatchdogPolicy) {
        self.nodes.lock().entry(node.to_string()).or_default().watchdog = Some(policy);
    }

    /// Lookups for `node` fail until [`InMemoryConfig::repair`].
    pub fn break_node(&self, node: &str) {
        self.broken.lock().insert(node.to_string());
    }

    pub fn repair(&self, node: &str) {
        self.broken.lock().remove(node);
    }
}

impl ConfigSource for InMemoryConfig {
    fn node(&self, node: &str) -> Result<Option<NodeConf>, ConfigError> {
        if self.broken.lock().contains(node) {
            return Err(ConfigError::Lookup { node: node.to_string(), reason: "backing store offline".into() });
        }
        Ok(self.nodes.lock().get(node).cloned())
    }

    fn nodes(&self) -> Result<Vec<String>, ConfigError> {
        let mut nodes: Vec<String> = self.nodes.lock().keys().cloned().collect();
        nodes.sort();
        Ok(nodes)
    }
}

/// Single-frame scene whose render takes `delay`, used to race scene switches against slow frames.
pub struct SlowScene {
    name: String,
    delay: Duration,
}

impl SlowScene {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self { name: name.to_string(), delay }
    }
}

#[async_trait]
impl Scene for SlowScene {
    fn name(&self) -> &str {
        &self.name
    }

    fn wants_loop(&self) -> bool {
        false
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    async fn render(&self, ctx: &RenderContext) -> anyhow::Result<Option<serde_json::Value>> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(json!({ "scene": self.name, "frame": ctx.frame_index })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_probe_runs_script_then_default() {
        let probe = ScriptedProbe::healthy();
        probe.push(ProbeStep::Respond(ProbeResult::failed("timeout")));
        probe.push(ProbeStep::Error("connection refused".into()));

        assert!(!probe.check("hall").await.unwrap().success);
        assert!(probe.check("hall").await.is_err());
        assert!(probe.check("lobby").await.unwrap().success);
        assert_eq!(probe.calls(), 3);
        assert_eq!(probe.calls_for("hall"), 2);
    }

    #[tokio::test]
    async fn test_in_memory_config_lookup_failure() {
        let config = InMemoryConfig::new();
        config.set_policy("hall", WatchdogPolicy { enabled: true, ..Default::default() });
        assert!(config.policy("hall").unwrap().unwrap().enabled);

        config.break_node("hall");
        assert!(matches!(config.policy("hall"), Err(ConfigError::Lookup { .. })));
        config.repair("hall");
        assert!(config.node("hall").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_holds_frames_but_clears() {
        let sink = RecordingSink::new();
        sink.set_stalled(true);
        let frame = Frame { scene: "empty".into(), generation: 1, index: 0, payload: json!({}) };

        let pushed = tokio::time::timeout(Duration::from_secs(5), sink.push_frame("hall", &frame)).await;
        assert!(pushed.is_err());
        assert!(sink.clear("hall").await.is_ok());
        assert!(sink.frames("hall").is_empty());
        assert_eq!(sink.clears("hall"), 1);
    }

    #[tokio::test]
    async fn test_recording_commands_fail_on_named_command() {
        let commands = RecordingCommands::new();
        commands.fail_on("reboot");
        let ok = NodeCommand { command: "blank".into(), args: json!(null), delay_ms: 0 };
        let bad = NodeCommand { command: "reboot".into(), args: json!(null), delay_ms: 0 };

        assert!(commands.send("hall", &ok).await.is_ok());
        assert!(commands.send("hall", &bad).await.is_err());
        assert_eq!(commands.command_names(), vec!["blank"]);
    }
}
