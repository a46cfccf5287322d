//! **Speech-to-Text (STT)** — turn captured audio into text.
//!
//! Every provider implements [`SttBackend`] (one-shot batch transcription). Providers that can
//! also transcribe live over a socket expose it through [`SttBackend::streaming`], which is how the
//! conversation loop picks the streaming path over the batch path.

use crate::config::{Credentials, SttProvider, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::realtime::{RealtimeEndpoint, SessionOptions, StreamingTranscriptionSession};
use crate::recorder::{AudioSpec, BITS_PER_SAMPLE};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

/// Result of one batch transcription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Language reported by the provider, if any.
    pub language: Option<String>,
}

/// Batch transcription: audio bytes in (WAV container), transcript out.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &'static str;

    /// Transcribe one recording. Return empty text if nothing was said.
    async fn transcribe(&self, audio: &[u8]) -> VoiceResult<Transcript>;

    /// Realtime capability, if the provider has one.
    fn streaming(&self) -> Option<&dyn SupportsStreaming> {
        None
    }
}

/// Realtime capability: builds a socket session for one turn.
pub trait SupportsStreaming: Send + Sync {
    fn realtime_session(&self, options: SessionOptions) -> VoiceResult<StreamingTranscriptionSession>;
}

/// Wrap raw 16-bit PCM in a WAV container. Bytes that already carry a RIFF header pass through.
pub fn ensure_wav(audio: Vec<u8>, spec: AudioSpec) -> VoiceResult<Vec<u8>> {
    if audio.starts_with(b"RIFF") {
        return Ok(audio);
    }
    let wav_spec = hound::WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(audio.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec)?;
        for pair in audio.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    language_code: Option<String>,
}

impl From<TranscriptionResponse> for Transcript {
    fn from(r: TranscriptionResponse) -> Self {
        Transcript {
            text: r.text.trim().to_string(),
            language: r.language.or(r.language_code),
        }
    }
}

fn http_client(timeout: Duration) -> VoiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| VoiceError::Stt(e.to_string()))
}

fn wav_part(audio: &[u8]) -> VoiceResult<Part> {
    Part::bytes(audio.to_vec())
        .file_name("audio.wav")
        .mime_str("audio/wav")
        .map_err(|e| VoiceError::Stt(e.to_string()))
}

async fn read_transcript(
    provider: &'static str,
    res: reqwest::Response,
) -> VoiceResult<Transcript> {
    if !res.status().is_success() {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        return Err(VoiceError::Provider {
            provider,
            status,
            body,
        });
    }
    let parsed: TranscriptionResponse = res
        .json()
        .await
        .map_err(|e| VoiceError::Stt(format!("{} response parse error: {}", provider, e)))?;
    Ok(parsed.into())
}

/// Placeholder STT: returns a fixed string. Use to exercise the loop without a provider.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SttBackend for PlaceholderStt {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    async fn transcribe(&self, audio: &[u8]) -> VoiceResult<Transcript> {
        let text = match self.response {
            Some(ref r) => r.clone(),
            None => format!(
                "[STT placeholder: {} bytes — configure an STT provider]",
                audio.len()
            ),
        };
        Ok(Transcript {
            text,
            language: None,
        })
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, OpenRouter, local servers).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model: whisper-1, gpt-4o-transcribe, etc.
    pub model: String,
    pub language: Option<String>,
    client: reqwest::Client,
}

impl OpenAiStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            language: None,
            client: http_client(Duration::from_secs(30))?,
        })
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }
}

#[async_trait]
impl SttBackend for OpenAiStt {
    fn name(&self) -> &'static str {
        "OpenAI STT"
    }

    async fn transcribe(&self, audio: &[u8]) -> VoiceResult<Transcript> {
        let api_key = self.api_key.as_deref().ok_or(VoiceError::MissingCredential {
            provider: "OpenAI STT",
            env_var: "OPENAI_API_KEY",
        })?;
        if audio.is_empty() {
            return Ok(Transcript::default());
        }
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let mut form = Form::new()
            .part("file", wav_part(audio)?)
            .text("model", self.model.clone());
        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }
        debug!(bytes = audio.len(), model = %self.model, "sending batch transcription");
        let res = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;
        read_transcript(self.name(), res).await
    }
}

/// ElevenLabs Scribe: batch `/speech-to-text` plus the realtime socket.
#[derive(Debug, Clone)]
pub struct ElevenLabsStt {
    pub base_url: String,
    pub realtime_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub realtime_model: String,
    pub language: Option<String>,
    client: reqwest::Client,
}

impl ElevenLabsStt {
    pub fn new(
        base_url: impl Into<String>,
        realtime_url: impl Into<String>,
        api_key: Option<String>,
    ) -> VoiceResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            realtime_url: realtime_url.into(),
            api_key,
            model: "scribe_v1".to_string(),
            realtime_model: "scribe_v2_realtime".to_string(),
            language: None,
            client: http_client(Duration::from_secs(60))?,
        })
    }

    fn require_key(&self) -> VoiceResult<&str> {
        self.api_key.as_deref().ok_or(VoiceError::MissingCredential {
            provider: "ElevenLabs STT",
            env_var: "ELEVENLABS_API_KEY",
        })
    }
}

#[async_trait]
impl SttBackend for ElevenLabsStt {
    fn name(&self) -> &'static str {
        "ElevenLabs STT"
    }

    async fn transcribe(&self, audio: &[u8]) -> VoiceResult<Transcript> {
        let api_key = self.require_key()?;
        if audio.is_empty() {
            return Ok(Transcript::default());
        }
        let url = format!("{}/speech-to-text", self.base_url.trim_end_matches('/'));
        let mut form = Form::new()
            .part("file", wav_part(audio)?)
            .text("model_id", self.model.clone());
        if let Some(ref lang) = self.language {
            form = form.text("language_code", lang.clone());
        }
        let res = self
            .client
            .post(&url)
            .header("xi-api-key", api_key)
            .multipart(form)
            .send()
            .await?;
        read_transcript(self.name(), res).await
    }

    fn streaming(&self) -> Option<&dyn SupportsStreaming> {
        Some(self)
    }
}

impl SupportsStreaming for ElevenLabsStt {
    fn realtime_session(&self, mut options: SessionOptions) -> VoiceResult<StreamingTranscriptionSession> {
        let api_key = self.require_key()?.to_string();
        if options.language.is_none() {
            options.language = self.language.clone();
        }
        Ok(StreamingTranscriptionSession::new(
            RealtimeEndpoint {
                url: self.realtime_url.clone(),
                api_key: Some(api_key),
                model: self.realtime_model.clone(),
            },
            options,
        ))
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires whisper.cpp/ggml and a model on disk.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper STT: loads a ggml model (e.g. ggml-base.en.bin) and runs inference on-device.
    /// Input must be a 16 kHz mono WAV, which is what the recorder produces by default.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
        language: Option<String>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str, language: Option<String>) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Mutex::new(state),
                language,
            })
        }

        /// Build from env: `WHISPER_MODEL_PATH` must point to a .bin model file.
        pub fn from_env(language: Option<String>) -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH").map_err(|_| {
                VoiceError::MissingCredential {
                    provider: "Whisper STT",
                    env_var: "WHISPER_MODEL_PATH",
                }
            })?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path, language)
        }

        fn decode(audio: &[u8]) -> VoiceResult<Vec<f32>> {
            let reader = hound::WavReader::new(Cursor::new(audio))?;
            let spec = reader.spec();
            if spec.sample_rate != 16000 || spec.channels != 1 {
                return Err(VoiceError::Stt(format!(
                    "Whisper expects 16 kHz mono; got {} Hz x{}",
                    spec.sample_rate, spec.channels
                )));
            }
            reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0).map_err(VoiceError::from))
                .collect()
        }
    }

    #[async_trait]
    impl SttBackend for WhisperStt {
        fn name(&self) -> &'static str {
            "Whisper"
        }

        async fn transcribe(&self, audio: &[u8]) -> VoiceResult<Transcript> {
            if audio.is_empty() {
                return Ok(Transcript::default());
            }
            let samples = Self::decode(audio)?;
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some(self.language.as_deref().unwrap_or("en")));

            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(&params, &samples)
                .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
            let text = state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            Ok(Transcript {
                text,
                language: self.language.clone(),
            })
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Select the STT provider named in the config. Selection happens once, at construction.
pub fn create_stt(config: &VoiceConfig, credentials: &Credentials) -> VoiceResult<Box<dyn SttBackend>> {
    let backend: Box<dyn SttBackend> = match config.stt_provider {
        SttProvider::OpenAi => {
            let model = config.stt_model.clone().unwrap_or_else(|| "whisper-1".to_string());
            Box::new(
                OpenAiStt::new(&config.openai_base_url, credentials.openai_stt.clone(), model)?
                    .with_language(config.language.clone()),
            )
        }
        SttProvider::ElevenLabs => {
            let mut stt = ElevenLabsStt::new(
                &config.elevenlabs_base_url,
                &config.elevenlabs_realtime_url,
                credentials.elevenlabs.clone(),
            )?;
            if let Some(ref model) = config.stt_model {
                stt.model = model.clone();
            }
            stt.realtime_model = config.realtime_model.clone();
            stt.language = config.language.clone();
            Box::new(stt)
        }
        #[cfg(feature = "whisper")]
        SttProvider::Whisper => Box::new(WhisperStt::from_env(config.language.clone())?),
        #[cfg(not(feature = "whisper"))]
        SttProvider::Whisper => {
            return Err(VoiceError::Config(
                "stt_provider = \"whisper\" requires building with --features whisper".to_string(),
            ))
        }
    };
    info!(provider = backend.name(), streaming = backend.streaming().is_some(), "STT provider selected");
    Ok(backend)
}
