//! FleetWatch kernel - service entry point.
//!
//! Wires config, MQTT, health tracking, playback, recovery and the watchdog,
//! then serves the status API until Ctrl-C.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetwatch_kernel::capabilities::{ConfigSource, NodeResetter};
use fleetwatch_kernel::config::{load_config, ConfigStore, DEFAULT_TOPIC_PREFIX};
use fleetwatch_kernel::http::{build_router, AppState};
use fleetwatch_kernel::mqtt::{create_mqtt_client, spawn_mqtt_listener, ListenerContext, MqttBridge};
use fleetwatch_kernel::probe::HttpProbe;
use fleetwatch_kernel::scenes::SceneCatalog;
use fleetwatch_kernel::state::DisplayStateStore;
use fleetwatch_kernel::status::KernelStatus;
use fleetwatch_kernel::wol::{CommandResetter, WakeOnLanResetter};
use fleetwatch_kernel::{HealthTracker, PlaybackStateMachine, RecoveryActionExecutor, WatchdogScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    let store = ConfigStore::new(cfg.clone());
    let config: Arc<dyn ConfigSource> = Arc::new(store);
    info!(nodes = cfg.nodes.len(), "config loaded");

    let kernel = KernelStatus::new();
    let health = HealthTracker::new();
    let display = DisplayStateStore::new();

    let mqtt_conf = cfg.mqtt.clone().unwrap_or_else(|| fleetwatch_kernel::config::MqttConf {
        host: "localhost".into(),
        port: 1883,
        topic_prefix: DEFAULT_TOPIC_PREFIX.into(),
    });
    let (client, eventloop) = create_mqtt_client(&mqtt_conf);
    let bridge = Arc::new(MqttBridge::new(client.clone(), mqtt_conf.topic_prefix.clone()));

    let listener_ctx = ListenerContext {
        prefix: mqtt_conf.topic_prefix.clone(),
        health: health.clone(),
        display: display.clone(),
        kernel: kernel.clone(),
    };
    spawn_mqtt_listener(client, eventloop, listener_ctx)
        .await
        .context("failed to subscribe MQTT topics")?;

    let playback = PlaybackStateMachine::new(SceneCatalog::with_builtin(), bridge.clone())
        .with_publisher(bridge.clone())
        .with_health(health.clone());

    let resetter: Arc<dyn NodeResetter> = match &cfg.reset {
        Some(reset) => Arc::new(CommandResetter::new(reset.command.clone(), config.clone())),
        None => Arc::new(WakeOnLanResetter::new(config.clone())),
    };
    let executor = RecoveryActionExecutor::new(Arc::new(playback.clone()), resetter)
        .with_command_sender(bridge.clone())
        .with_notifier(bridge.clone());

    let probe = HttpProbe::new(config.clone(), cfg.probe.clone().unwrap_or_default())
        .context("failed to build HTTP probe")?;

    let scheduler = WatchdogScheduler::new(
        config.clone(),
        Arc::new(probe),
        Arc::new(display),
        health,
        playback.clone(),
        Arc::new(executor),
    );

    for (node, conf) in &cfg.nodes {
        if let Some(scene) = &conf.startup_scene {
            if !playback.switch_scene(node, scene, None).await {
                warn!(node = %node, scene = %scene, "startup scene failed");
            }
        }
    }
    scheduler.start_all();

    let app = build_router(AppState { scheduler: scheduler.clone(), kernel });
    let bind = cfg.http.as_ref().map(|h| h.bind.clone()).unwrap_or_else(|| "0.0.0.0:8080".into());
    let addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address {bind}"))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    let stopped = scheduler.stop_all();
    playback.halt_all().await;
    info!(stopped, "shutdown complete");
    Ok(())
}
