//! Per-node playback: play / pause / stop / resume and stale-frame suppression.
//!
//! Every scene switch bumps the node's generation. Render tasks carry the
//! generation they were spawned for and [`PlaybackStateMachine::deliver_frame`]
//! drops anything that no longer matches, so a slow frame from a superseded
//! scene never reaches the display.
//!
//! Node slots are never locked across a sink call: a display that stops
//! answering cannot hold up a scene switch, a stop or a watchdog read.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::{DisplaySink, SceneSwitcher, StatePublisher};
use crate::health::HealthTracker;
use crate::models::{Frame, PlayState};
use crate::scenes::{RenderContext, Scene, SceneCatalog};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("unknown scene: {0}")]
    UnknownScene(String),
}

struct RenderTask {
    token: CancellationToken,
    looping: bool,
}

#[derive(Default)]
struct NodePlayback {
    state: Option<PlayState>,
    scene: Option<String>,
    payload: Option<serde_json::Value>,
    generation: u64,
    task: Option<RenderTask>,
    frames_drawn: u64,
    stale_frames_dropped: u64,
}

impl NodePlayback {
    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.token.cancel();
        }
    }

    fn render_loop_active(&self) -> bool {
        self.task
            .as_ref()
            .map_or(false, |task| task.looping && !task.token.is_cancelled())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSnapshot {
    pub state: Option<PlayState>,
    pub scene: Option<String>,
    pub generation: u64,
    pub render_loop_active: bool,
    pub frames_drawn: u64,
    pub stale_frames_dropped: u64,
}

type NodeSlot = Arc<Mutex<NodePlayback>>;

#[derive(Clone)]
pub struct PlaybackStateMachine {
    nodes: Arc<Mutex<HashMap<String, NodeSlot>>>,
    catalog: Arc<SceneCatalog>,
    sink: Arc<dyn DisplaySink>,
    publisher: Option<Arc<dyn StatePublisher>>,
    health: Option<HealthTracker>,
}

impl PlaybackStateMachine {
    pub fn new(catalog: SceneCatalog, sink: Arc<dyn DisplaySink>) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            catalog: Arc::new(catalog),
            sink,
            publisher: None,
            health: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn StatePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Successful frame pushes count as liveness signals for the node.
    pub fn with_health(mut self, health: HealthTracker) -> Self {
        self.health = Some(health);
        self
    }

    fn slot(&self, node: &str) -> NodeSlot {
        self.nodes.lock().entry(node.to_string()).or_default().clone()
    }

    fn existing(&self, node: &str) -> Option<NodeSlot> {
        self.nodes.lock().get(node).cloned()
    }

    /// Loads `scene` on `node` and returns the new generation.
    pub async fn load_scene(
        &self,
        node: &str,
        scene: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<u64, PlaybackError> {
        let scene_impl = self
            .catalog
            .get(scene)
            .ok_or_else(|| PlaybackError::UnknownScene(scene.to_string()))?;

        let slot = self.slot(node);
        let generation = {
            let mut pb = slot.lock();
            pb.cancel_task();
            pb.generation += 1;
            pb.scene = Some(scene.to_string());
            pb.payload = payload;
            pb.state = Some(PlayState::Playing);
            let task = self.spawn_render(node, scene_impl.clone(), pb.generation, pb.payload.clone(), scene_impl.wants_loop());
            pb.task = Some(task);
            pb.generation
        };

        info!(node, scene, generation, looping = scene_impl.wants_loop(), "scene switched");
        self.publish(node, PlayState::Playing, Some(scene)).await;
        Ok(generation)
    }

    pub async fn switch_scene(&self, node: &str, scene: &str, payload: Option<serde_json::Value>) -> bool {
        match self.load_scene(node, scene, payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!(node, error = %e, "scene switch rejected");
                false
            }
        }
    }

    /// Freezes the display on the last drawn frame.
    pub async fn pause_scene(&self, node: &str) -> bool {
        let Some(slot) = self.existing(node) else { return false };
        let scene = {
            let mut pb = slot.lock();
            let Some(scene) = pb.scene.clone() else { return false };
            if pb.state == Some(PlayState::Stopped) {
                debug!(node, "pause ignored, scene is stopped");
                return true;
            }
            pb.cancel_task();
            pb.state = Some(PlayState::Paused);
            scene
        };
        info!(node, scene = %scene, "scene paused");
        self.publish(node, PlayState::Paused, Some(&scene)).await;
        true
    }

    /// Stops rendering and clears the display. The scene stays loaded for `resume_scene`.
    pub async fn stop_scene(&self, node: &str) -> bool {
        let Some(slot) = self.existing(node) else { return false };
        let scene = {
            let mut pb = slot.lock();
            let Some(scene) = pb.scene.clone() else { return false };
            pb.cancel_task();
            pb.state = Some(PlayState::Stopped);
            scene
        };
        if let Err(e) = self.sink.clear(node).await {
            warn!(node, error = %e, "failed to clear display");
        }
        info!(node, scene = %scene, "scene stopped");
        self.publish(node, PlayState::Stopped, Some(&scene)).await;
        true
    }

    pub async fn resume_scene(&self, node: &str) -> bool {
        let Some(slot) = self.existing(node) else { return false };
        let scene = {
            let mut pb = slot.lock();
            let Some(scene) = pb.scene.clone() else { return false };
            let previous = pb.state;
            if previous == Some(PlayState::Playing) {
                return true;
            }
            let Some(scene_impl) = self.catalog.get(&scene) else {
                warn!(node, scene = %scene, "loaded scene disappeared from catalog");
                return false;
            };

            pb.cancel_task();
            pb.state = Some(PlayState::Playing);
            // a stopped display was cleared, redraw once even without a loop
            if scene_impl.wants_loop() || previous == Some(PlayState::Stopped) {
                let task = self.spawn_render(node, scene_impl.clone(), pb.generation, pb.payload.clone(), scene_impl.wants_loop());
                pb.task = Some(task);
            }
            scene
        };
        info!(node, scene = %scene, "scene resumed");
        self.publish(node, PlayState::Playing, Some(&scene)).await;
        true
    }

    /// Draws `frame` only if it belongs to the node's current generation and the node is playing.
    pub async fn deliver_frame(&self, node: &str, generation: u64, frame: Frame) -> bool {
        self.deliver_tagged(node, generation, frame, None).await
    }

    async fn deliver_tagged(&self, node: &str, generation: u64, frame: Frame, token: Option<&CancellationToken>) -> bool {
        let Some(slot) = self.existing(node) else { return false };
        {
            let mut pb = slot.lock();
            let cancelled = token.map_or(false, |t| t.is_cancelled());
            if cancelled || pb.generation != generation || pb.state != Some(PlayState::Playing) {
                pb.stale_frames_dropped += 1;
                debug!(node, generation, current = pb.generation, "dropping stale frame");
                return false;
            }
        }

        match self.sink.push_frame(node, &frame).await {
            Ok(()) => {
                slot.lock().frames_drawn += 1;
                if let Some(health) = &self.health {
                    health.update_last_seen(node, OffsetDateTime::now_utc());
                }
                true
            }
            Err(e) => {
                warn!(node, generation, error = %e, "frame push failed");
                false
            }
        }
    }

    fn spawn_render(
        &self,
        node: &str,
        scene: Arc<dyn Scene>,
        generation: u64,
        payload: Option<serde_json::Value>,
        looping: bool,
    ) -> RenderTask {
        let token = CancellationToken::new();
        let machine = self.clone();
        let node = node.to_string();
        let task_token = token.clone();
        tokio::spawn(async move {
            machine.run_render(node, scene, generation, payload, looping, task_token).await;
        });
        RenderTask { token, looping }
    }

    async fn run_render(
        self,
        node: String,
        scene: Arc<dyn Scene>,
        generation: u64,
        payload: Option<serde_json::Value>,
        looping: bool,
        token: CancellationToken,
    ) {
        let interval = scene.frame_interval();
        let mut frame_index = 0u64;
        loop {
            if token.is_cancelled() {
                return;
            }
            let ctx = RenderContext {
                node: node.clone(),
                generation,
                frame_index,
                payload: payload.clone(),
            };
            match scene.render(&ctx).await {
                Ok(Some(payload)) => {
                    let frame = Frame {
                        scene: scene.name().to_string(),
                        generation,
                        index: frame_index,
                        payload,
                    };
                    self.deliver_tagged(&node, generation, frame, Some(&token)).await;
                }
                Ok(None) => {}
                Err(e) => warn!(node = %node, scene = scene.name(), error = %e, "render failed"),
            }
            if !looping {
                return;
            }
            frame_index += 1;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn publish(&self, node: &str, state: PlayState, scene: Option<&str>) {
        let Some(publisher) = &self.publisher else { return };
        if let Err(e) = publisher.publish_state(node, "play_state", json!(state.as_str())).await {
            warn!(node, error = %e, "failed to publish play state");
        }
        if let Some(scene) = scene {
            if let Err(e) = publisher.publish_state(node, "scene", json!(scene)).await {
                warn!(node, error = %e, "failed to publish scene");
            }
        }
    }

    pub async fn play_state(&self, node: &str) -> Option<PlayState> {
        let slot = self.existing(node)?;
        let state = slot.lock().state;
        state
    }

    /// Number of live repeating render timers for `node` (0 or 1).
    pub async fn active_render_loops(&self, node: &str) -> usize {
        match self.existing(node) {
            Some(slot) => usize::from(slot.lock().render_loop_active()),
            None => 0,
        }
    }

    pub async fn snapshot(&self, node: &str) -> Option<PlaybackSnapshot> {
        let slot = self.existing(node)?;
        let pb = slot.lock();
        Some(PlaybackSnapshot {
            state: pb.state,
            scene: pb.scene.clone(),
            generation: pb.generation,
            render_loop_active: pb.render_loop_active(),
            frames_drawn: pb.frames_drawn,
            stale_frames_dropped: pb.stale_frames_dropped,
        })
    }

    /// Cancels every render task, used on shutdown.
    pub async fn halt_all(&self) {
        let slots: Vec<NodeSlot> = self.nodes.lock().values().cloned().collect();
        for slot in slots {
            slot.lock().cancel_task();
        }
    }
}

#[async_trait]
impl SceneSwitcher for PlaybackStateMachine {
    async fn switch_scene(&self, node: &str, scene: &str, payload: Option<serde_json::Value>) -> bool {
        PlaybackStateMachine::switch_scene(self, node, scene, payload).await
    }
}
