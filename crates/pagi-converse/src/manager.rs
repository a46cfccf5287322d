//! **VoiceManager** — the continuous spoken conversation loop.
//!
//! ```text
//!  talk() ─┬─▶ listen ──(streaming | batch)──▶ transcript
//!          │        ▲                              │ confirm? (auto_send off)
//!          │        │                              ▼
//!          │        └──── speak ◀── dispatch ◀── on_transcript
//!          └─ stop_talking(): is_talking=false, stop stream, playback, recorder
//! ```
//!
//! State lives in one [`watch`] channel owned by the manager. Only the manager writes to it; UIs
//! read a snapshot with [`VoiceManager::state`] or follow changes with [`VoiceManager::subscribe`].

use crate::config::{Credentials, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioPlayback, RodioPlayback};
use crate::realtime::{SessionOptions, SessionStopper, SessionUpdate};
use crate::recorder::{AudioRecorder, AudioSpec, RecordOptions, SilenceDetection, SilenceOptions};
use crate::stt::{create_stt, ensure_wav, SttBackend, SupportsStreaming};
use crate::tts::{create_tts, TtsBackend};
use crate::turn::{ConversationHandler, ConversationTurn};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause after a failed turn before listening again.
const TURN_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Voice-mode flags. At most one of `is_speaking` / `is_listening` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceState {
    pub enabled: bool,
    pub is_speaking: bool,
    pub is_listening: bool,
    /// The conversation loop is running.
    pub is_talking: bool,
}

/// Options for a single-shot [`VoiceManager::listen`].
#[derive(Default)]
pub struct ListenOptions<'a> {
    pub on_partial: Option<&'a (dyn Fn(&str) + Send + Sync)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnOutcome {
    Completed,
    /// Nothing to dispatch: silence, empty capture, or a declined confirmation.
    Skipped,
    /// The loop was stopped or superseded mid-turn.
    Cancelled,
}

pub struct VoiceManager {
    config: VoiceConfig,
    stt: Arc<dyn SttBackend>,
    tts: Arc<dyn TtsBackend>,
    playback: Arc<dyn AudioPlayback>,
    recorder: AudioRecorder,
    state: watch::Sender<VoiceState>,
    active_stream: Mutex<Option<SessionStopper>>,
    /// Bumped by every `talk()`; an older loop exits once it sees a newer value.
    generation: AtomicU64,
}

impl VoiceManager {
    pub fn new(
        config: VoiceConfig,
        stt: Arc<dyn SttBackend>,
        tts: Arc<dyn TtsBackend>,
        playback: Arc<dyn AudioPlayback>,
    ) -> Self {
        let recorder = AudioRecorder::from_command_template(config.recorder_command.as_deref());
        let (state, _) = watch::channel(VoiceState::default());
        Self {
            config,
            stt,
            tts,
            playback,
            recorder,
            state,
            active_stream: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Providers from config, playback on the default output device.
    pub fn from_config(config: VoiceConfig, credentials: &Credentials) -> VoiceResult<Self> {
        let stt: Arc<dyn SttBackend> = Arc::from(create_stt(&config, credentials)?);
        let tts: Arc<dyn TtsBackend> = Arc::from(create_tts(&config, credentials)?);
        let playback: Arc<dyn AudioPlayback> = Arc::new(RodioPlayback::new()?);
        info!(stt = stt.name(), tts = tts.name(), "voice manager ready");
        Ok(Self::new(config, stt, tts, playback))
    }

    pub fn with_recorder(mut self, recorder: AudioRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn recorder(&self) -> &AudioRecorder {
        &self.recorder
    }

    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceState> {
        self.state.subscribe()
    }

    pub fn enable(&self) {
        self.state.send_modify(|s| s.enabled = true);
    }

    /// Turn voice mode off, stopping the loop if it runs.
    pub fn disable(&self) {
        self.stop_talking();
        self.state.send_modify(|s| s.enabled = false);
    }

    /// Run the conversation loop until [`VoiceManager::stop_talking`] (or a newer `talk()`).
    ///
    /// Per-turn failures go to [`ConversationHandler::on_turn_error`] and the loop listens again.
    /// Configuration errors (no recorder, missing credential) end the loop with `Err`.
    pub async fn talk(&self, handler: &dyn ConversationHandler) -> VoiceResult<()> {
        self.halt_activity();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(VoiceState {
            enabled: true,
            is_talking: true,
            ..Default::default()
        });
        let path = if self.stt.streaming().is_some() { "streaming" } else { "batch" };
        info!(stt = self.stt.name(), path, "🗣️ conversation loop started");

        let result = loop {
            if !self.still_talking(generation) {
                break Ok(());
            }
            match self.run_turn(handler, generation).await {
                Ok(TurnOutcome::Cancelled) => break Ok(()),
                Ok(outcome) => debug!(?outcome, "turn finished"),
                Err(e) if !self.still_talking(generation) => {
                    debug!("turn error after stop: {}", e);
                    break Ok(());
                }
                Err(e) if e.is_configuration() => {
                    error!("conversation loop cannot continue: {}", e);
                    handler.on_turn_error(&e);
                    break Err(e);
                }
                Err(e) => {
                    warn!("turn failed: {}", e);
                    handler.on_turn_error(&e);
                    tokio::select! {
                        _ = tokio::time::sleep(TURN_ERROR_BACKOFF) => {}
                        _ = self.cancelled(Some(generation)) => {}
                    }
                }
            }
        };

        if self.is_current(Some(generation)) {
            self.halt_activity();
            self.state.send_modify(|s| {
                s.is_talking = false;
                s.is_listening = false;
                s.is_speaking = false;
            });
            info!("conversation loop ended");
        }
        result
    }

    /// Stop the loop. Safe from any task, at any point, any number of times.
    pub fn stop_talking(&self) {
        let was_talking = self.state.borrow().is_talking;
        self.state.send_modify(|s| s.is_talking = false);
        self.halt_activity();
        if was_talking {
            info!("conversation loop stop requested");
        }
    }

    /// Speak `text` once, outside the loop.
    pub async fn speak(&self, text: &str) -> VoiceResult<()> {
        self.ensure_enabled()?;
        self.speak_response(text, None).await
    }

    /// Listen for one utterance outside the loop and return its transcript.
    pub async fn listen(&self, options: ListenOptions<'_>) -> VoiceResult<String> {
        self.ensure_enabled()?;
        let on_partial = |text: &str| {
            if let Some(cb) = options.on_partial {
                cb(text);
            }
        };
        let result = self.capture_transcript(&on_partial, None).await;
        self.set_listening(false);
        Ok(result?.unwrap_or_default())
    }

    fn ensure_enabled(&self) -> VoiceResult<()> {
        if self.state.borrow().enabled {
            Ok(())
        } else {
            Err(VoiceError::Disabled)
        }
    }

    fn still_talking(&self, generation: u64) -> bool {
        self.state.borrow().is_talking && self.generation.load(Ordering::SeqCst) == generation
    }

    /// `None` is a standalone operation, always current.
    fn is_current(&self, generation: Option<u64>) -> bool {
        generation.map_or(true, |g| self.generation.load(Ordering::SeqCst) == g)
    }

    /// Resolves once the loop for `generation` is stopped or superseded. Never resolves for `None`.
    async fn cancelled(&self, generation: Option<u64>) {
        let Some(generation) = generation else {
            return std::future::pending().await;
        };
        let mut rx = self.state.subscribe();
        while self.still_talking(generation) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn halt_activity(&self) {
        let stopper = self
            .active_stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(stopper) = stopper {
            stopper.stop();
        }
        self.playback.stop();
        self.recorder.stop();
    }

    fn set_active_stream(&self, stopper: Option<SessionStopper>) {
        *self.active_stream.lock().unwrap_or_else(|e| e.into_inner()) = stopper;
    }

    fn set_listening(&self, listening: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.is_listening != listening || (listening && s.is_speaking);
            s.is_listening = listening;
            if listening {
                s.is_speaking = false;
            }
            changed
        });
    }

    fn set_speaking(&self, speaking: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.is_speaking != speaking || (speaking && s.is_listening);
            s.is_speaking = speaking;
            if speaking {
                s.is_listening = false;
            }
            changed
        });
    }

    fn audio_spec(&self) -> AudioSpec {
        AudioSpec {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
        }
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            audio: self.audio_spec(),
            commit_strategy: self.config.commit_strategy,
            silence_threshold_secs: self.config.silence_threshold_secs,
            vad_threshold: self.config.vad_threshold,
            language: self.config.language.clone(),
            finalize_grace: self.config.finalize_grace(),
            max_duration: self.config.max_listen(),
            capture_silence: Some(self.capture_vad()),
            ..Default::default()
        }
    }

    fn capture_vad(&self) -> SilenceDetection {
        SilenceDetection {
            start_threshold_pct: self.config.capture_threshold_pct,
            trailing_silence: self.config.trailing_silence(),
        }
    }

    async fn run_turn(
        &self,
        handler: &dyn ConversationHandler,
        generation: u64,
    ) -> VoiceResult<TurnOutcome> {
        let started_at = Utc::now();
        let on_partial = |text: &str| handler.on_partial_transcript(text);
        let captured = self.capture_transcript(&on_partial, Some(generation)).await;
        if self.is_current(Some(generation)) {
            self.set_listening(false);
        }

        let Some(transcript) = captured? else {
            return Ok(TurnOutcome::Cancelled);
        };
        if !self.still_talking(generation) {
            return Ok(TurnOutcome::Cancelled);
        }
        let transcript = transcript.trim();
        if transcript.is_empty() {
            debug!("no speech captured");
            return Ok(TurnOutcome::Skipped);
        }

        if !self.config.auto_send {
            let confirmed = handler.confirm(transcript).await;
            if !self.still_talking(generation) {
                return Ok(TurnOutcome::Cancelled);
            }
            if !confirmed {
                debug!("transcript declined");
                return Ok(TurnOutcome::Skipped);
            }
        }

        handler.on_transcript(transcript);
        let mut turn = ConversationTurn::begin(started_at, transcript);

        let response = match handler.dispatch(transcript).await {
            Ok(response) => response,
            Err(e) => {
                turn.error = Some(e.to_string());
                handler.on_turn_complete(&turn);
                return Err(e);
            }
        };
        if !self.still_talking(generation) {
            return Ok(TurnOutcome::Cancelled);
        }
        handler.on_response(&response);
        turn.response = Some(response.clone());

        if let Err(e) = self.speak_response(&response, Some(generation)).await {
            turn.error = Some(e.to_string());
            handler.on_turn_complete(&turn);
            return Err(e);
        }
        handler.on_turn_complete(&turn);
        Ok(TurnOutcome::Completed)
    }

    /// One utterance to text. `Ok(None)` means the loop was cancelled while listening.
    async fn capture_transcript(
        &self,
        on_partial: &(dyn Fn(&str) + Send + Sync),
        generation: Option<u64>,
    ) -> VoiceResult<Option<String>> {
        match self.stt.streaming() {
            Some(streaming) => self.listen_streaming(streaming, on_partial, generation).await,
            None => self.listen_batch(generation).await,
        }
    }

    async fn listen_streaming(
        &self,
        streaming: &dyn SupportsStreaming,
        on_partial: &(dyn Fn(&str) + Send + Sync),
        generation: Option<u64>,
    ) -> VoiceResult<Option<String>> {
        self.set_listening(true);
        let session = streaming.realtime_session(self.session_options())?;
        let mut live = tokio::select! {
            live = session.start(&self.recorder) => live?,
            _ = self.cancelled(generation) => return Ok(None),
        };
        self.set_active_stream(Some(live.stopper()));
        if generation.is_some_and(|g| !self.still_talking(g)) {
            live.stop();
        }

        let text = loop {
            let update = tokio::select! {
                update = live.next() => update,
                _ = self.cancelled(generation) => {
                    live.stop();
                    self.set_active_stream(None);
                    return Ok(None);
                }
            };
            match update {
                SessionUpdate::Partial(text) => on_partial(&text),
                SessionUpdate::Committed(text) => {
                    if self.config.auto_send && !text.trim().is_empty() {
                        debug!("committed transcript, ending listen early");
                        live.stop();
                        break text;
                    }
                }
                SessionUpdate::Done(text) => break text,
            }
        };
        self.set_active_stream(None);

        if generation.is_some_and(|g| !self.still_talking(g)) {
            return Ok(None);
        }
        Ok(Some(text))
    }

    async fn listen_batch(&self, generation: Option<u64>) -> VoiceResult<Option<String>> {
        self.set_listening(true);
        let audio = self.audio_spec();
        let capture = async {
            if self.recorder.supports_silence_detection() {
                self.recorder
                    .record_until_silence(SilenceOptions {
                        audio,
                        max_duration: self.config.max_listen(),
                        vad: self.capture_vad(),
                        fallback_duration: self.config.fallback_record(),
                    })
                    .await
            } else {
                self.recorder
                    .record(RecordOptions {
                        audio,
                        duration: self.config.fallback_record(),
                    })
                    .await
            }
        };
        let bytes = tokio::select! {
            bytes = capture => bytes?,
            _ = self.cancelled(generation) => return Ok(None),
        };
        if self.is_current(generation) {
            self.set_listening(false);
        }

        if generation.is_some_and(|g| !self.still_talking(g)) {
            return Ok(None);
        }
        if bytes.is_empty() {
            return Ok(Some(String::new()));
        }
        debug!(bytes = bytes.len(), "captured utterance");

        let wav = ensure_wav(bytes, audio)?;
        let transcript = tokio::select! {
            t = self.stt.transcribe(&wav) => t?,
            _ = self.cancelled(generation) => return Ok(None),
        };
        Ok(Some(transcript.text))
    }

    async fn speak_response(&self, text: &str, generation: Option<u64>) -> VoiceResult<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.set_speaking(true);
        let result = tokio::select! {
            r = self.play_speech(text) => r,
            _ = self.cancelled(generation) => {
                self.playback.stop();
                Ok(())
            }
        };
        self.set_speaking(false);
        result
    }

    async fn play_speech(&self, text: &str) -> VoiceResult<()> {
        if let Some(streaming) = self.tts.streaming() {
            if self.playback.supports_streaming() {
                let chunks = streaming.stream(text).await?;
                return self
                    .playback
                    .play_stream(chunks, streaming.stream_format())
                    .await;
            }
        }
        let audio = self.tts.synthesize(text).await?;
        if audio.is_empty() {
            return Ok(());
        }
        self.playback.play(audio.bytes, audio.format).await
    }
}
