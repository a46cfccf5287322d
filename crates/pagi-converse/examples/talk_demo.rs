//! Talk Demo — continuous spoken conversation with an echo agent.
//!
//! Providers come from `PAGI_VOICE_*` settings (or `config/voice.toml`) and API keys from `.env`:
//! - **STT**: `PAGI_VOICE_STT_PROVIDER=elevenlabs` streams over the realtime socket; `openai` uploads each utterance.
//! - **TTS**: `PAGI_VOICE_TTS_PROVIDER=silent` prints replies without speaking them.
//!
//! Press Ctrl+C to stop.

use anyhow::Context;
use async_trait::async_trait;
use pagi_converse::{
    ConversationHandler, ConversationTurn, Credentials, VoiceConfig, VoiceError, VoiceManager,
    VoiceResult,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct EchoAgent;

#[async_trait]
impl ConversationHandler for EchoAgent {
    async fn dispatch(&self, transcript: &str) -> VoiceResult<String> {
        Ok(format!("You said: {}.", transcript.trim()))
    }

    fn on_partial_transcript(&self, text: &str) {
        info!("… {}", text);
    }

    fn on_transcript(&self, transcript: &str) {
        info!("🧑 {}", transcript);
    }

    fn on_response(&self, response: &str) {
        info!("🤖 {}", response);
    }

    fn on_turn_error(&self, error: &VoiceError) {
        warn!("turn skipped: {}", error);
    }

    fn on_turn_complete(&self, turn: &ConversationTurn) {
        let elapsed = chrono::Utc::now() - turn.started_at;
        info!(ms = elapsed.num_milliseconds(), ok = turn.succeeded(), "turn complete");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = VoiceConfig::load().context("loading voice config")?;
    let credentials = Credentials::from_env();
    let manager = Arc::new(VoiceManager::from_config(config, &credentials)?);

    let recorders: Vec<String> = manager
        .recorder()
        .available_tools()
        .iter()
        .map(|t| t.program().to_string())
        .collect();
    info!(?recorders, "capture tools found");
    info!("Talk Demo — speak after the prompt, Ctrl+C to stop.");

    let stopper = Arc::clone(&manager);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop_talking();
        }
    });

    manager.talk(&EchoAgent).await?;
    info!("bye");
    Ok(())
}
