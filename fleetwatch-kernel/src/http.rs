//! HTTP API: node status for dashboards, plus manual playback and watchdog control.
//!
//! Every route except `/health` requires the `x-api-key` header to match
//! `FLEETWATCH_API_KEY`.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::health::HealthRecord;
use crate::status::{KernelHealth, KernelStatus, NodeStatus};
use crate::watchdog::{TickOutcome, WatchdogScheduler};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: WatchdogScheduler,
    pub kernel: KernelStatus,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("FLEETWATCH_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        tracing::warn!("FLEETWATCH_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/nodes", get(get_all_status))
        .route("/nodes/{id}", get(get_status))
        .route("/nodes/{id}/health", get(get_health_snapshot))
        .route("/nodes/{id}/scene", post(switch_scene))
        .route("/nodes/{id}/pause", post(pause_scene))
        .route("/nodes/{id}/stop", post(stop_scene))
        .route("/nodes/{id}/resume", post(resume_scene))
        .route("/nodes/{id}/check", post(check_now))
        .route("/nodes/{id}/watchdog/start", post(start_watchdog))
        .route("/nodes/{id}/watchdog/stop", post(stop_watchdog))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

fn ack(ok: bool) -> (StatusCode, Json<serde_json::Value>) {
    let code = if ok { StatusCode::OK } else { StatusCode::CONFLICT };
    (code, Json(json!({ "ok": ok })))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.kernel.get_health(&app.scheduler))
}

// GET /nodes
async fn get_all_status(State(app): State<AppState>) -> Json<BTreeMap<String, NodeStatus>> {
    Json(app.scheduler.all_status().await)
}

// GET /nodes/{id}
async fn get_status(State(app): State<AppState>, Path(id): Path<String>) -> Json<NodeStatus> {
    Json(app.scheduler.status(&id).await)
}

// GET /nodes/{id}/health
async fn get_health_snapshot(State(app): State<AppState>, Path(id): Path<String>) -> Json<HealthRecord> {
    Json(app.scheduler.health_snapshot(&id))
}

#[derive(Debug, Deserialize)]
struct SceneRequest {
    scene: String,
    payload: Option<serde_json::Value>,
}

// POST /nodes/{id}/scene
async fn switch_scene(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SceneRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match app.scheduler.playback().load_scene(&id, &req.scene, req.payload).await {
        Ok(generation) => Ok(Json(json!({ "ok": true, "generation": generation }))),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

// POST /nodes/{id}/pause
async fn pause_scene(State(app): State<AppState>, Path(id): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
    ack(app.scheduler.playback().pause_scene(&id).await)
}

// POST /nodes/{id}/stop
async fn stop_scene(State(app): State<AppState>, Path(id): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
    ack(app.scheduler.playback().stop_scene(&id).await)
}

// POST /nodes/{id}/resume
async fn resume_scene(State(app): State<AppState>, Path(id): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
    ack(app.scheduler.playback().resume_scene(&id).await)
}

// POST /nodes/{id}/check
async fn check_now(State(app): State<AppState>, Path(id): Path<String>) -> Json<TickOutcome> {
    Json(app.scheduler.check_now(&id).await)
}

// POST /nodes/{id}/watchdog/start
async fn start_watchdog(State(app): State<AppState>, Path(id): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
    ack(app.scheduler.start_monitoring(&id))
}

// POST /nodes/{id}/watchdog/stop
async fn stop_watchdog(State(app): State<AppState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let was_monitoring = app.scheduler.stop_monitoring(&id);
    Json(json!({ "ok": true, "was_monitoring": was_monitoring }))
}
