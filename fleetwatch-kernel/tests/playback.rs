use fleetwatch_devkit::test_utils::{TestHarness, SLOW_RENDER, SLOW_SCENE};
use fleetwatch_devkit::MockMqttClient;
use fleetwatch_kernel::models::{Frame, PlayState};
use fleetwatch_kernel::mqtt::MqttBridge;
use fleetwatch_kernel::playback::PlaybackError;
use fleetwatch_kernel::scenes::SceneCatalog;
use fleetwatch_kernel::PlaybackStateMachine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_pause_resume_keeps_a_single_render_loop() {
    let harness = TestHarness::new();
    let playback = &harness.playback;

    playback.load_scene("hall", "clock", None).await.unwrap();
    assert_eq!(playback.active_render_loops("hall").await, 1);

    assert!(playback.pause_scene("hall").await);
    assert_eq!(playback.active_render_loops("hall").await, 0);
    assert_eq!(playback.play_state("hall").await, Some(PlayState::Paused));

    assert!(playback.resume_scene("hall").await);
    assert!(playback.resume_scene("hall").await);
    assert_eq!(playback.active_render_loops("hall").await, 1);
    assert_eq!(playback.play_state("hall").await, Some(PlayState::Playing));

    playback.halt_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_paused_scene_draws_nothing() {
    let harness = TestHarness::new();
    harness.playback.load_scene("hall", "clock", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(harness.sink.frames("hall").len(), 3);

    harness.playback.pause_scene("hall").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.sink.frames("hall").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_slow_frame_is_dropped() {
    let harness = TestHarness::new();
    let playback = &harness.playback;

    let slow = playback.load_scene("hall", SLOW_SCENE, None).await.unwrap();
    let current = playback.load_scene("hall", "empty", None).await.unwrap();
    assert_eq!(current, slow + 1);

    tokio::time::sleep(SLOW_RENDER * 2).await;

    assert_eq!(harness.sink.scenes_drawn("hall"), vec!["empty"]);
    let snapshot = playback.snapshot("hall").await.unwrap();
    assert_eq!(snapshot.generation, current);
    assert_eq!(snapshot.stale_frames_dropped, 1);
    assert_eq!(snapshot.scene.as_deref(), Some("empty"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_frame_dropped_after_pause() {
    let harness = TestHarness::new();
    harness.playback.load_scene("hall", SLOW_SCENE, None).await.unwrap();
    harness.playback.pause_scene("hall").await;

    tokio::time::sleep(SLOW_RENDER * 2).await;
    assert!(harness.sink.frames("hall").is_empty());
}

#[tokio::test]
async fn test_deliver_frame_checks_generation_and_state() {
    let harness = TestHarness::new();
    let playback = &harness.playback;
    let generation = playback.load_scene("hall", "empty", None).await.unwrap();
    let frame = |generation| Frame { scene: "empty".into(), generation, index: 9, payload: json!({ "draw": [] }) };

    assert!(!playback.deliver_frame("hall", generation - 1, frame(generation - 1)).await);
    assert!(playback.deliver_frame("hall", generation, frame(generation)).await);

    playback.pause_scene("hall").await;
    assert!(!playback.deliver_frame("hall", generation, frame(generation)).await);
    assert!(!playback.deliver_frame("ghost", 1, frame(1)).await);
}

#[tokio::test]
async fn test_frames_count_as_liveness() {
    let harness = TestHarness::new();
    harness.playback.load_scene("hall", "empty", None).await.unwrap();

    harness
        .wait_until(1000, || harness.health.snapshot("hall").last_seen.is_some())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stop_clears_display_and_resume_redraws() {
    let harness = TestHarness::new();
    let playback = &harness.playback;
    playback.load_scene("hall", "static", Some(json!({ "draw": [{ "text": "hi" }] }))).await.unwrap();
    harness.wait_until(1000, || harness.sink.frames("hall").len() == 1).await.unwrap();

    assert!(playback.stop_scene("hall").await);
    assert_eq!(harness.sink.clears("hall"), 1);
    assert_eq!(playback.play_state("hall").await, Some(PlayState::Stopped));

    // pausing a stopped scene changes nothing
    assert!(playback.pause_scene("hall").await);
    assert_eq!(playback.play_state("hall").await, Some(PlayState::Stopped));

    assert!(playback.resume_scene("hall").await);
    harness.wait_until(1000, || harness.sink.frames("hall").len() == 2).await.unwrap();
    assert_eq!(harness.sink.frames("hall")[1].payload["draw"][0]["text"], "hi");
}

#[tokio::test]
async fn test_resume_after_pause_of_single_frame_scene_does_not_redraw() {
    let harness = TestHarness::new();
    let playback = &harness.playback;
    playback.load_scene("hall", "empty", None).await.unwrap();
    harness.wait_until(1000, || harness.sink.frames("hall").len() == 1).await.unwrap();

    playback.pause_scene("hall").await;
    playback.resume_scene("hall").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.sink.frames("hall").len(), 1);
}

#[tokio::test]
async fn test_unknown_scene_and_node() {
    let harness = TestHarness::new();
    let playback = &harness.playback;

    assert!(matches!(
        playback.load_scene("hall", "fireworks", None).await,
        Err(PlaybackError::UnknownScene(_))
    ));
    assert!(!playback.switch_scene("hall", "fireworks", None).await);
    assert!(!playback.pause_scene("ghost").await);
    assert!(!playback.stop_scene("ghost").await);
    assert!(!playback.resume_scene("ghost").await);
    assert_eq!(playback.active_render_loops("ghost").await, 0);
    assert!(playback.play_state("ghost").await.is_none());
}

#[tokio::test]
async fn test_transitions_are_published() {
    let client = MockMqttClient::new();
    let bridge = Arc::new(MqttBridge::new(client.clone(), "fleet"));
    let playback = PlaybackStateMachine::new(SceneCatalog::with_builtin(), bridge.clone()).with_publisher(bridge);

    playback.load_scene("hall", "empty", None).await.unwrap();
    playback.pause_scene("hall").await;

    let states: Vec<Value> = client
        .find_messages_by_topic("fleet/hall/state@v1")
        .iter()
        .map(|msg| serde_json::from_slice(&msg.payload).unwrap())
        .collect();
    let play_states: Vec<&Value> = states
        .iter()
        .filter(|s| s["key"] == "play_state")
        .map(|s| &s["value"])
        .collect();
    assert_eq!(play_states, vec!["playing", "paused"]);
    assert!(states.iter().any(|s| s["key"] == "scene" && s["value"] == "empty"));
}
