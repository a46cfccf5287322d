//! Voice configuration loaded from file and environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PAGI_VOICE_CONFIG | config/voice | Optional TOML file (path without extension is fine). |
//! | PAGI_VOICE_STT_PROVIDER | openai | `openai` \| `elevenlabs` \| `whisper` |
//! | PAGI_VOICE_TTS_PROVIDER | openai | `openai` \| `silent` |
//! | PAGI_VOICE_AUTO_SEND | true | Dispatch transcripts without asking for confirmation. |
//! | PAGI_VOICE_COMMIT_STRATEGY | auto | `auto` (provider VAD) \| `manual` |
//! | PAGI_VOICE_LANGUAGE | unset | Language hint passed to the STT provider. |
//! | PAGI_VOICE_RECORDER_COMMAND | unset | Custom capture command template. |
//!
//! API keys are read separately by [`Credentials::from_env`].

use crate::error::VoiceResult;
use crate::realtime::CommitStrategy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Which speech-to-text provider backs the conversation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// OpenAI-compatible `/audio/transcriptions` (batch only).
    #[default]
    OpenAi,
    /// ElevenLabs Scribe (batch + realtime socket).
    ElevenLabs,
    /// Local whisper.cpp model (requires the `whisper` feature).
    Whisper,
}

/// Which text-to-speech provider speaks responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    #[default]
    OpenAi,
    /// No audio; responses are only surfaced through the handler.
    Silent,
}

/// Settings for the conversation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub stt_provider: SttProvider,
    pub tts_provider: TtsProvider,
    /// When true, a committed transcript ends listening immediately and is dispatched without confirmation.
    pub auto_send: bool,
    pub commit_strategy: CommitStrategy,
    /// Trailing silence (seconds) that ends an utterance, for both provider VAD and local capture.
    pub silence_threshold_secs: f32,
    /// Provider VAD sensitivity (0.0–1.0).
    pub vad_threshold: f32,
    /// Capture start threshold for local VAD, in percent of full scale.
    pub capture_threshold_pct: f32,
    pub language: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Hard cap on one listen, batch or streaming.
    pub max_listen_secs: u64,
    /// Fixed recording length when no capture tool supports silence detection.
    pub fallback_record_secs: u64,
    /// How long to wait for a trailing transcript after capture ends naturally.
    pub finalize_grace_ms: u64,
    /// Custom capture command, e.g. `parec --rate={sample_rate} --channels={channels} --file-format=wav {output}`.
    pub recorder_command: Option<String>,
    pub stt_model: Option<String>,
    pub realtime_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub openai_base_url: String,
    pub elevenlabs_base_url: String,
    pub elevenlabs_realtime_url: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_provider: SttProvider::default(),
            tts_provider: TtsProvider::default(),
            auto_send: true,
            commit_strategy: CommitStrategy::Auto,
            silence_threshold_secs: 1.5,
            vad_threshold: 0.4,
            capture_threshold_pct: 1.0,
            language: None,
            sample_rate: 16000,
            channels: 1,
            max_listen_secs: 30,
            fallback_record_secs: 5,
            finalize_grace_ms: 500,
            recorder_command: None,
            stt_model: None,
            realtime_model: "scribe_v2_realtime".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            elevenlabs_base_url: "https://api.elevenlabs.io/v1".to_string(),
            elevenlabs_realtime_url: "wss://api.elevenlabs.io/v1/speech-to-text/realtime".to_string(),
        }
    }
}

impl VoiceConfig {
    /// Load config from file and environment. Precedence: env `PAGI_VOICE_*` > file at
    /// `PAGI_VOICE_CONFIG` (default `config/voice`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("PAGI_VOICE_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        let builder = config::Config::builder()
            .set_default("auto_send", true)?
            .set_default("sample_rate", 16000_i64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::with_name(&config_path).required(false))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("PAGI_VOICE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    pub fn max_listen(&self) -> Duration {
        Duration::from_secs(self.max_listen_secs.max(1))
    }

    pub fn fallback_record(&self) -> Duration {
        Duration::from_secs(self.fallback_record_secs.max(1))
    }

    pub fn finalize_grace(&self) -> Duration {
        Duration::from_millis(self.finalize_grace_ms)
    }

    pub fn trailing_silence(&self) -> Duration {
        Duration::from_secs_f32(self.silence_threshold_secs.max(0.1))
    }
}

/// API keys for the cloud providers. Absent keys surface as `MissingCredential` on first use.
#[derive(Clone, Default)]
pub struct Credentials {
    pub openai_stt: Option<String>,
    pub openai_tts: Option<String>,
    pub elevenlabs: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("openai_stt", &self.openai_stt.is_some())
            .field("openai_tts", &self.openai_tts.is_some())
            .field("elevenlabs", &self.elevenlabs.is_some())
            .finish()
    }
}

impl Credentials {
    /// Read STT_API_KEY / TTS_API_KEY (falling back to OPENAI_API_KEY) and ELEVENLABS_API_KEY.
    pub fn from_env() -> Self {
        let openai = env_opt_string("OPENAI_API_KEY");
        Self {
            openai_stt: env_opt_string("STT_API_KEY").or_else(|| openai.clone()),
            openai_tts: env_opt_string("TTS_API_KEY").or(openai),
            elevenlabs: env_opt_string("ELEVENLABS_API_KEY"),
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
