//! Demo showing how to drive the control plane's three cooperating
//! components from a single process.
//!
//! This walks spec §8 end-to-end scenarios #1 (quick validation run),
//! #4 (idle walk) and #6 (barge-in during playback) back to back against
//! in-memory collaborators, so none of it needs a real STT/LLM/TTS
//! provider or a running WebSocket server.
//!
//! To run: cargo run --example demo

use std::sync::Arc;
use std::time::Duration;

use control_plane::analyzer::{self, AnalysisConfig};
use control_plane::audio_bus::{AudioBus, AudioBusMessage, MockSessionCache};
use control_plane::clock::SystemClock;
use control_plane::idle::IdleMgr;
use control_plane::lto::{LatencyTestOrchestrator, LtoConfig};
use control_plane::protocol::{ClientCapabilities, TestSuiteDefinition, TopicSegmentTable};
use control_plane::session::InMemorySessionStore;
use control_plane::storage::MemoryStorage;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    info!("--- LTO: quick validation run ---");
    let clock = SystemClock::new().into_arc();
    let storage = Arc::new(MemoryStorage::new());
    let lto = LatencyTestOrchestrator::new(storage, Arc::clone(&clock), LtoConfig::default());

    lto.register_suite(TestSuiteDefinition::quick_validation()?).await?;
    lto.register_mock_client(
        "demo-client",
        ClientCapabilities {
            supported_stt_providers: vec!["mock-stt".to_string()],
            supported_llm_providers: vec!["mock-llm".to_string()],
            supported_tts_providers: vec!["mock-tts".to_string()],
            precision_timing: true,
            device_metrics: false,
            on_device_ml: false,
            max_concurrent_tests: 6,
        },
    )
    .await;

    let run = lto.start_test_run("quick_validation").await?;
    let finished = lto.await_run(run.id).await.expect("run was just started");
    let report = analyzer::analyze(&finished, None, AnalysisConfig::default());
    info!(
        completed = finished.completed,
        success_rate = report.summary.success_rate,
        median_ms = report.summary.median_ms,
        "run finished"
    );

    info!("--- IdleMgr: idle walk ---");
    let idle = IdleMgr::new(Arc::clone(&clock));
    idle.record_activity("startup", "demo").await;
    info!(state = ?idle.current_state().await, "initial state");
    idle.keep_awake(1).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    idle.evaluate_now().await;
    info!(state = ?idle.current_state().await, "state after keep-awake expires");

    info!("--- AudioBus: set topic, request audio, barge in ---");
    let bus = AudioBus::new(
        Arc::new(InMemorySessionStore::new()),
        Arc::new(MockSessionCache::new()),
        Arc::new(idle),
        Arc::clone(&clock),
    );
    bus.publish_topic(TopicSegmentTable {
        curriculum_id: "curriculum-1".to_string(),
        topic_id: "topic-1".to_string(),
        segments: vec![
            "Welcome to the lesson.".to_string(),
            "Today we cover control flow.".to_string(),
            "Let's recap what we learned.".to_string(),
        ],
    })
    .await;

    let topic_set = bus
        .handle_message(
            "demo-session",
            "demo-user",
            AudioBusMessage::SetTopic {
                curriculum_id: Some("curriculum-1".to_string()),
                topic_id: Some("topic-1".to_string()),
            },
        )
        .await;
    info!(?topic_set, "set_topic");

    let audio = bus
        .handle_message(
            "demo-session",
            "demo-user",
            AudioBusMessage::RequestAudio { segment_index: 1 },
        )
        .await;
    info!(?audio, "request_audio");

    let barge_in = bus
        .handle_message(
            "demo-session",
            "demo-user",
            AudioBusMessage::BargeIn {
                segment_index: 1,
                offset_ms: 1000,
            },
        )
        .await;
    info!(?barge_in, "barge_in");

    info!("demo complete");
    Ok(())
}
