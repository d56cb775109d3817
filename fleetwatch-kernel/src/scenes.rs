//! Scenes a node can play, and the catalog the playback state machine loads them from.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

pub struct RenderContext {
    pub node: String,
    pub generation: u64,
    pub frame_index: u64,
    pub payload: Option<serde_json::Value>,
}

#[async_trait]
pub trait Scene: Send + Sync {
    fn name(&self) -> &str;

    /// Scenes that want a continuous render loop are re-rendered every
    /// [`Scene::frame_interval`] while playing.
    fn wants_loop(&self) -> bool {
        false
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// `Ok(None)` means nothing to draw this time.
    async fn render(&self, ctx: &RenderContext) -> anyhow::Result<Option<serde_json::Value>>;
}

#[derive(Clone, Default)]
pub struct SceneCatalog {
    scenes: HashMap<String, Arc<dyn Scene>>,
}

impl SceneCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with `empty`, `static` and `clock`.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(EmptyScene));
        catalog.register(Arc::new(StaticScene));
        catalog.register(Arc::new(ClockScene));
        catalog
    }

    pub fn register(&mut self, scene: Arc<dyn Scene>) {
        self.scenes.insert(scene.name().to_string(), scene);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scene>> {
        self.scenes.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scenes.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Blank screen. Usual fallback target.
pub struct EmptyScene;

#[async_trait]
impl Scene for EmptyScene {
    fn name(&self) -> &str {
        "empty"
    }

    async fn render(&self, _ctx: &RenderContext) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(Some(json!({ "draw": [] })))
    }
}

/// Draws the switch payload once.
pub struct StaticScene;

#[async_trait]
impl Scene for StaticScene {
    fn name(&self) -> &str {
        "static"
    }

    async fn render(&self, ctx: &RenderContext) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(ctx.payload.clone())
    }
}

pub struct ClockScene;

#[async_trait]
impl Scene for ClockScene {
    fn name(&self) -> &str {
        "clock"
    }

    fn wants_loop(&self) -> bool {
        true
    }

    async fn render(&self, ctx: &RenderContext) -> anyhow::Result<Option<serde_json::Value>> {
        let text = OffsetDateTime::now_utc().format(format_description!("[hour]:[minute]:[second]"))?;
        let color = ctx
            .payload
            .as_ref()
            .and_then(|p| p.get("color"))
            .cloned()
            .unwrap_or_else(|| json!("#ffffff"));
        Ok(Some(json!({ "draw": [{ "text": text, "color": color }] })))
    }
}
