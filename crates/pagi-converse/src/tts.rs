//! **TTS** — text to audio for the speak phase of a turn.
//!
//! Backends return a whole utterance from [`TtsBackend::synthesize`]. Backends that can emit
//! audio progressively also expose [`StreamingTts`] through [`TtsBackend::streaming`]; the
//! conversation loop uses it when the playback side can consume a stream too.

use crate::config::{Credentials, TtsProvider, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;

/// Sample rate of OpenAI's raw `pcm` response format.
pub const OPENAI_PCM_SAMPLE_RATE: u32 = 24_000;

/// Container or encoding of synthesized audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    /// Headerless signed 16-bit little-endian mono.
    Pcm16 { sample_rate: u32 },
}

/// One synthesized utterance. Empty `bytes` means there is nothing to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
}

impl SpeechAudio {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Chunks of audio in the backend's [`StreamingTts::stream_format`].
pub type AudioStream = BoxStream<'static, VoiceResult<Vec<u8>>>;

#[async_trait]
pub trait TtsBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize(&self, text: &str) -> VoiceResult<SpeechAudio>;

    /// Progressive synthesis, if the provider supports it.
    fn streaming(&self) -> Option<&dyn StreamingTts> {
        None
    }
}

#[async_trait]
pub trait StreamingTts: Send + Sync {
    /// Format of every chunk yielded by [`StreamingTts::stream`].
    fn stream_format(&self) -> AudioFormat;

    async fn stream(&self, text: &str) -> VoiceResult<AudioStream>;
}

/// Silent TTS. Responses are still delivered to the handler; nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl TtsBackend for PlaceholderTts {
    fn name(&self) -> &'static str {
        "silent"
    }

    async fn synthesize(&self, _text: &str) -> VoiceResult<SpeechAudio> {
        Ok(SpeechAudio {
            bytes: Vec::new(),
            format: AudioFormat::Wav,
        })
    }
}

/// OpenAI-compatible `/audio/speech`. MP3 for whole utterances, raw PCM when streaming.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    pub base_url: String,
    api_key: Option<String>,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }

    fn key(&self) -> VoiceResult<&str> {
        self.api_key.as_deref().ok_or(VoiceError::MissingCredential {
            provider: "OpenAI TTS",
            env_var: "OPENAI_API_KEY",
        })
    }

    async fn request(&self, text: &str, response_format: &str) -> VoiceResult<reqwest::Response> {
        let key = self.key()?;
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": response_format,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Provider {
                provider: "OpenAI TTS",
                status,
                body,
            });
        }
        Ok(res)
    }
}

#[async_trait]
impl TtsBackend for OpenAiTts {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<SpeechAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SpeechAudio {
                bytes: Vec::new(),
                format: AudioFormat::Mp3,
            });
        }
        let res = self.request(text, "mp3").await?;
        let bytes = res.bytes().await?;
        debug!(bytes = bytes.len(), "TTS synthesized");
        Ok(SpeechAudio {
            bytes: bytes.to_vec(),
            format: AudioFormat::Mp3,
        })
    }

    fn streaming(&self) -> Option<&dyn StreamingTts> {
        Some(self)
    }
}

#[async_trait]
impl StreamingTts for OpenAiTts {
    fn stream_format(&self) -> AudioFormat {
        AudioFormat::Pcm16 {
            sample_rate: OPENAI_PCM_SAMPLE_RATE,
        }
    }

    async fn stream(&self, text: &str) -> VoiceResult<AudioStream> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(futures::stream::empty().boxed());
        }
        let res = self.request(text, "pcm").await?;
        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(VoiceError::from))
            .boxed())
    }
}

/// Build the configured TTS backend.
pub fn create_tts(config: &VoiceConfig, creds: &Credentials) -> VoiceResult<Box<dyn TtsBackend>> {
    match config.tts_provider {
        TtsProvider::OpenAi => Ok(Box::new(OpenAiTts::new(
            config.openai_base_url.clone(),
            creds.openai_tts.clone(),
            config.tts_model.clone(),
            config.tts_voice.clone(),
        )?)),
        TtsProvider::Silent => Ok(Box::new(PlaceholderTts)),
    }
}
