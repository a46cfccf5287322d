//! End-to-end tests against real devices and providers
//!
//! Note: These tests require a microphone, speakers, and/or API keys and are ignored by default.
//! Run with `cargo test -p pagi-converse -- --ignored --nocapture`.

mod common;

use async_trait::async_trait;
use pagi_converse::{
    AudioRecorder, ConversationHandler, Credentials, ListenOptions, PlaceholderStt,
    PlaceholderTts, RecordOptions, RodioPlayback, SessionOptions, VoiceConfig,
    VoiceManager, VoiceResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct Echo;

#[async_trait]
impl ConversationHandler for Echo {
    async fn dispatch(&self, transcript: &str) -> VoiceResult<String> {
        Ok(format!("You said: {}", transcript))
    }

    fn on_transcript(&self, transcript: &str) {
        println!("🧑 {}", transcript);
    }
}

#[tokio::test]
#[ignore] // Requires audio hardware and sox/arecord/ffmpeg
async fn test_talk_loop_on_default_devices() {
    common::init_tracing();

    let recorder = AudioRecorder::new();
    println!("capture tools: {:?}", recorder.available_tools());

    let manager = Arc::new(
        VoiceManager::new(
            VoiceConfig::default(),
            Arc::new(PlaceholderStt::with_response("testing one two")),
            Arc::new(PlaceholderTts),
            Arc::new(RodioPlayback::new().expect("Failed to open output device")),
        )
        .with_recorder(recorder),
    );

    let stopper = Arc::clone(&manager);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(8)).await;
        stopper.stop_talking();
    });

    timeout(Duration::from_secs(20), manager.talk(&Echo))
        .await
        .expect("loop should exit after stop_talking")
        .expect("loop error");
    assert!(!manager.state().is_talking);
}

#[tokio::test]
#[ignore] // Requires audio hardware and manual speech
async fn test_record_and_play_back() {
    common::init_tracing();

    println!("\n🎤 Recording 3 seconds...");
    let recorder = AudioRecorder::new();
    let bytes = recorder
        .record(RecordOptions {
            duration: Duration::from_secs(3),
            ..Default::default()
        })
        .await
        .expect("Failed to record");
    println!("captured {} bytes", bytes.len());
    assert!(!bytes.is_empty());

    let playback = RodioPlayback::new().expect("Failed to open output device");
    pagi_converse::AudioPlayback::play(&playback, bytes, pagi_converse::AudioFormat::Wav)
        .await
        .expect("Failed to play");
}

#[tokio::test]
#[ignore] // Requires ELEVENLABS_API_KEY, a microphone, and manual speech
async fn test_realtime_listen() {
    common::init_tracing();
    let _ = dotenvy::dotenv();

    let config = VoiceConfig {
        stt_provider: pagi_converse::SttProvider::ElevenLabs,
        tts_provider: pagi_converse::TtsProvider::Silent,
        ..Default::default()
    };
    let credentials = Credentials::from_env();
    let stt = pagi_converse::create_stt(&config, &credentials).expect("Failed to build STT");
    assert!(stt.streaming().is_some());
    stt.streaming()
        .unwrap()
        .realtime_session(SessionOptions::default())
        .expect("ELEVENLABS_API_KEY must be set");

    let manager = VoiceManager::from_config(config, &credentials).expect("Failed to build manager");
    manager.enable();

    println!("\n🎤 Say something...");
    let print_partial = |text: &str| println!("… {}", text);
    let text = timeout(
        Duration::from_secs(30),
        manager.listen(ListenOptions {
            on_partial: Some(&print_partial),
        }),
    )
    .await
    .expect("listen timed out")
    .expect("listen failed");
    println!("heard: {}", text);
}
