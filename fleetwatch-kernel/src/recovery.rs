//! Turns a node's watchdog policy into a concrete remediation.
//!
//! Failures are logged and recorded as the node's last outcome, never
//! propagated: the next failing tick simply tries again.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::capabilities::{CommandSender, LogNotifier, NodeResetter, Notifier, SceneSwitcher};
use crate::config::{RecoveryAction, WatchdogPolicy};
use crate::models::{NotificationKind, WatchdogNotification};

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub action: RecoveryAction,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub reason: String,
    pub succeeded: bool,
    pub detail: String,
}

pub struct RecoveryActionExecutor {
    switcher: Arc<dyn SceneSwitcher>,
    resetter: Arc<dyn NodeResetter>,
    commands: Option<Arc<dyn CommandSender>>,
    notifier: Arc<dyn Notifier>,
    outcomes: Mutex<HashMap<String, RecoveryOutcome>>,
}

impl RecoveryActionExecutor {
    pub fn new(switcher: Arc<dyn SceneSwitcher>, resetter: Arc<dyn NodeResetter>) -> Self {
        Self {
            switcher,
            resetter,
            commands: None,
            notifier: Arc::new(LogNotifier),
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_command_sender(mut self, commands: Arc<dyn CommandSender>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub async fn execute(&self, node: &str, policy: &WatchdogPolicy, reason: &str) -> RecoveryOutcome {
        info!(node, action = %policy.action, reason, "executing recovery action");

        let (succeeded, detail) = match policy.action {
            RecoveryAction::Restart => self.restart(node).await,
            RecoveryAction::FallbackScene => self.fallback_scene(node, policy).await,
            RecoveryAction::SendCommands => self.send_commands(node, policy).await,
            RecoveryAction::NotifyOnly => {
                let sent = self.notify(node, NotificationKind::NodeUnresponsive, policy.action, reason).await;
                (sent, if sent { "notification sent".into() } else { "notification failed".into() })
            }
            RecoveryAction::Unknown => {
                warn!(node, "unknown recovery action configured, nothing done");
                (false, "unknown action".to_string())
            }
        };

        if policy.notify_on_failure && policy.action != RecoveryAction::NotifyOnly {
            let kind = if succeeded { NotificationKind::NodeUnresponsive } else { NotificationKind::RecoveryFailed };
            self.notify(node, kind, policy.action, reason).await;
        }

        let outcome = RecoveryOutcome {
            action: policy.action,
            at: OffsetDateTime::now_utc(),
            reason: reason.to_string(),
            succeeded,
            detail,
        };
        self.outcomes.lock().insert(node.to_string(), outcome.clone());
        outcome
    }

    pub fn last_outcome(&self, node: &str) -> Option<RecoveryOutcome> {
        self.outcomes.lock().get(node).cloned()
    }

    async fn restart(&self, node: &str) -> (bool, String) {
        match self.resetter.restart(node).await {
            Ok(()) => {
                info!(node, "node restart requested");
                (true, "restart requested".into())
            }
            Err(e) => {
                error!(node, error = %e, "node restart failed");
                (false, format!("restart failed: {e}"))
            }
        }
    }

    async fn fallback_scene(&self, node: &str, policy: &WatchdogPolicy) -> (bool, String) {
        let Some(scene) = policy.fallback_scene.as_deref() else {
            warn!(node, "fallback-scene action without fallback_scene, nothing done");
            return (false, "no fallback scene configured".into());
        };
        if self.switcher.switch_scene(node, scene, None).await {
            info!(node, scene, "switched to fallback scene");
            (true, format!("switched to {scene}"))
        } else {
            error!(node, scene, "fallback scene switch failed");
            (false, format!("switch to {scene} failed"))
        }
    }

    async fn send_commands(&self, node: &str, policy: &WatchdogPolicy) -> (bool, String) {
        let Some(sender) = &self.commands else {
            warn!(node, "send-commands action without command transport, nothing done");
            return (false, "no command transport".into());
        };
        if policy.commands.is_empty() {
            warn!(node, "send-commands action with empty command list");
            return (true, "no commands configured".into());
        }
        for (i, command) in policy.commands.iter().enumerate() {
            if command.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(command.delay_ms)).await;
            }
            if let Err(e) = sender.send(node, command).await {
                error!(node, command = %command.command, error = %e, "recovery command failed");
                return (false, format!("command {} ({}) failed: {e}", i + 1, command.command));
            }
        }
        info!(node, count = policy.commands.len(), "recovery commands sent");
        (true, format!("{} commands sent", policy.commands.len()))
    }

    async fn notify(&self, node: &str, kind: NotificationKind, action: RecoveryAction, reason: &str) -> bool {
        let notification = WatchdogNotification::new(node, kind, action, reason);
        match self.notifier.notify(&notification).await {
            Ok(()) => true,
            Err(e) => {
                error!(node, error = %e, "failed to send watchdog notification");
                false
            }
        }
    }
}
