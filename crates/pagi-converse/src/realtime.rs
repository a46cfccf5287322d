//! **Realtime STT** — one duplex socket per turn, fed by a piped capture process.
//!
//! ```text
//!  capture tool ──raw PCM──▶ session task ──input_audio_chunk──▶ provider
//!                               │   ◀── partial / committed ──────┘
//!                               ├──▶ events (Partial, Committed)
//!                               └──▶ done (oneshot, exactly once)
//! ```
//!
//! The session task is the only owner of the socket, the capture process and the phase. Four
//! things can end a session: an explicit stop, the capture tool ending, the socket closing, or a
//! provider error. Whichever comes first moves the phase to `Done` and sends the accumulated text
//! on the one-shot channel; the rest find the phase already `Done`.

use crate::error::{VoiceError, VoiceResult};
use crate::recorder::{
    AudioRecorder, AudioSpec, CaptureLimit, PcmCapture, SilenceDetection, STOP_GRACE,
};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 100 ms of 16 kHz mono 16-bit audio.
const DEFAULT_CHUNK_BYTES: usize = 3200;

/// When a streamed transcript is considered final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommitStrategy {
    /// Provider-side VAD commits after trailing silence.
    #[default]
    #[serde(alias = "vad")]
    Auto,
    /// The client commits explicitly when capture ends.
    Manual,
}

impl CommitStrategy {
    /// Value of the `commit_strategy` query parameter.
    pub fn as_query(&self) -> &'static str {
        match self {
            CommitStrategy::Auto => "vad",
            CommitStrategy::Manual => "manual",
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct RealtimeEndpoint {
    /// Base socket URL (`wss://...` or `ws://...`), without query.
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
}

/// Per-turn session parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub audio: AudioSpec,
    pub commit_strategy: CommitStrategy,
    /// Provider VAD: trailing silence that commits a segment.
    pub silence_threshold_secs: f32,
    /// Provider VAD sensitivity.
    pub vad_threshold: f32,
    pub language: Option<String>,
    /// Wait after capture ends naturally for a trailing transcript.
    pub finalize_grace: Duration,
    /// Capture ends after this long even if the tool keeps writing.
    pub max_duration: Duration,
    /// Local silence detection for the capture tool, where one supports it.
    pub capture_silence: Option<SilenceDetection>,
    pub chunk_bytes: usize,
}

impl SessionOptions {
    fn capture_limit(&self) -> CaptureLimit {
        match self.capture_silence {
            Some(vad) => CaptureLimit::UntilSilence {
                max: self.max_duration,
                vad,
            },
            None => CaptureLimit::Fixed(self.max_duration),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            audio: AudioSpec::default(),
            commit_strategy: CommitStrategy::Auto,
            silence_threshold_secs: 1.5,
            vad_threshold: 0.4,
            language: None,
            finalize_grace: Duration::from_millis(500),
            max_duration: Duration::from_secs(30),
            capture_silence: None,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

/// Outbound envelope. The sample rate travels in the connection URL, not per chunk.
#[derive(Serialize)]
struct AudioChunkMessage {
    message_type: &'static str,
    audio_base_64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<bool>,
}

fn audio_chunk_json(pcm: &[u8], commit: bool) -> serde_json::Result<String> {
    serde_json::to_string(&AudioChunkMessage {
        message_type: "input_audio_chunk",
        audio_base_64: base64::engine::general_purpose::STANDARD.encode(pcm),
        commit: commit.then_some(true),
    })
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// What a provider message means to the session.
#[derive(Debug, Clone, PartialEq)]
enum ServerEvent {
    SessionStarted,
    Partial(String),
    Committed(String),
    Error(String),
    Other,
}

/// Classify one text frame. `None` for anything that isn't a JSON envelope.
fn parse_server_message(raw: &str) -> Option<ServerEvent> {
    let msg: InboundMessage = serde_json::from_str(raw).ok()?;
    if let Some(err) = msg.error {
        let detail = match err {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Some(ServerEvent::Error(detail));
    }
    let kind = msg.message_type.unwrap_or_default();
    let text = msg.text.unwrap_or_default();
    Some(match kind.as_str() {
        "session_started" => ServerEvent::SessionStarted,
        "partial_transcript" => ServerEvent::Partial(text),
        "committed_transcript" | "committed_transcript_with_timestamps" => {
            ServerEvent::Committed(text)
        }
        k if k.ends_with("error") => ServerEvent::Error(if text.is_empty() { k.to_string() } else { text }),
        _ => ServerEvent::Other,
    })
}

/// Live transcript updates for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Partial(String),
    Committed(String),
}

/// What [`LiveSession::next`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Partial(String),
    Committed(String),
    /// The session is over; carries every committed segment, space-joined.
    Done(String),
}

/// Session lifecycle, owned by the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NotStarted,
    /// Socket open, audio flowing.
    Active,
    /// Capture ended; waiting for a trailing transcript.
    Finalizing { deadline: Instant },
    Done,
}

/// Why the session completed (for logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DoneReason {
    Stopped,
    CaptureEnded,
    SocketClosed,
    ServerError,
}

struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

/// Clonable, idempotent stop for a running session. Safe to call from any task.
#[derive(Clone)]
pub struct SessionStopper {
    signal: Arc<StopSignal>,
}

impl SessionStopper {
    fn new() -> Self {
        Self {
            signal: Arc::new(StopSignal {
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn stop(&self) {
        if !self.signal.stopped.swap(true, Ordering::SeqCst) {
            self.signal.notify.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.stopped.load(Ordering::SeqCst)
    }
}

/// A configured, not yet connected, realtime session.
#[derive(Debug, Clone)]
pub struct StreamingTranscriptionSession {
    endpoint: RealtimeEndpoint,
    options: SessionOptions,
}

impl StreamingTranscriptionSession {
    pub fn new(endpoint: RealtimeEndpoint, options: SessionOptions) -> Self {
        Self { endpoint, options }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Full connection URL with the provider's query parameters.
    pub fn connection_url(&self) -> String {
        let o = &self.options;
        let mut url = format!(
            "{}?model_id={}&audio_format=pcm_{}&commit_strategy={}&vad_silence_threshold_secs={}&vad_threshold={}",
            self.endpoint.url.trim_end_matches('/'),
            self.endpoint.model,
            o.audio.sample_rate,
            o.commit_strategy.as_query(),
            o.silence_threshold_secs,
            o.vad_threshold,
        );
        if let Some(ref lang) = o.language {
            url.push_str("&language_code=");
            url.push_str(lang);
        }
        url
    }

    /// Open the socket, then start piping audio from a fresh capture process.
    ///
    /// Failing to connect or to spawn the capture tool is an error here; once this returns, the
    /// session always ends through [`LiveSession`]'s single `Done`.
    pub async fn start(self, recorder: &AudioRecorder) -> VoiceResult<LiveSession> {
        let url = self.connection_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Connection(e.to_string()))?;
        if let Some(ref key) = self.endpoint.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| VoiceError::Config(format!("invalid API key header: {}", e)))?;
            request.headers_mut().insert("xi-api-key", value);
        }

        let (mut socket, _) = tokio_tungstenite::connect_async(request).await?;
        debug!(url = %self.endpoint.url, "realtime socket open");

        let capture = match recorder.open_pcm_stream(self.options.audio, self.options.capture_limit()) {
            Ok(c) => c,
            Err(e) => {
                let _ = socket.close(None).await;
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let stopper = SessionStopper::new();

        let task = SessionTask {
            capture_deadline: Instant::now() + self.options.max_duration,
            socket,
            capture: Some(capture),
            options: self.options,
            phase: SessionPhase::NotStarted,
            accumulated: Vec::new(),
            events: events_tx,
            done: Some(done_tx),
            stopper: stopper.clone(),
        };
        tokio::spawn(task.run());
        info!("🎙️ realtime transcription session started");

        Ok(LiveSession {
            events: events_rx,
            done: done_rx,
            final_text: None,
            stopper,
        })
    }
}

/// Handle to a running session.
pub struct LiveSession {
    events: mpsc::UnboundedReceiver<TranscriptEvent>,
    done: oneshot::Receiver<String>,
    final_text: Option<String>,
    stopper: SessionStopper,
}

impl LiveSession {
    /// Stop capture, close the socket and complete with what has been committed so far.
    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn stopper(&self) -> SessionStopper {
        self.stopper.clone()
    }

    /// Next update. Queued partial/committed events are delivered before `Done`; after `Done`,
    /// every call returns the same `Done`.
    pub async fn next(&mut self) -> SessionUpdate {
        if let Some(ref text) = self.final_text {
            return SessionUpdate::Done(text.clone());
        }
        tokio::select! {
            biased;
            Some(event) = self.events.recv() => match event {
                TranscriptEvent::Partial(t) => SessionUpdate::Partial(t),
                TranscriptEvent::Committed(t) => SessionUpdate::Committed(t),
            },
            result = &mut self.done => {
                let text = result.unwrap_or_default();
                self.final_text = Some(text.clone());
                SessionUpdate::Done(text)
            }
        }
    }

    /// Drain updates until the session completes; returns the accumulated text.
    pub async fn wait(mut self) -> String {
        loop {
            if let SessionUpdate::Done(text) = self.next().await {
                return text;
            }
        }
    }
}

struct SessionTask {
    socket: Socket,
    /// Capture ends here even if the tool ignores its own limit.
    capture_deadline: Instant,
    capture: Option<PcmCapture>,
    options: SessionOptions,
    phase: SessionPhase,
    accumulated: Vec<String>,
    events: mpsc::UnboundedSender<TranscriptEvent>,
    done: Option<oneshot::Sender<String>>,
    stopper: SessionStopper,
}

impl SessionTask {
    async fn run(mut self) {
        self.phase = SessionPhase::Active;
        let mut buf = vec![0u8; self.options.chunk_bytes.max(2)];
        let stopper = self.stopper.clone();

        while self.phase != SessionPhase::Done {
            let deadline = match self.phase {
                SessionPhase::Finalizing { deadline } => Some(deadline),
                _ => None,
            };
            let capturing = self.capture.is_some() && deadline.is_none();

            tokio::select! {
                _ = stopper.signal.notify.notified() => {
                    self.finish(DoneReason::Stopped).await;
                }
                msg = self.socket.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_text(&text).await,
                    Some(Ok(Message::Close(_))) | None => self.finish(DoneReason::SocketClosed).await,
                    Some(Err(e)) => {
                        warn!("realtime socket error: {}", e);
                        self.finish(DoneReason::SocketClosed).await;
                    }
                    Some(Ok(_)) => {}
                },
                read = read_capture(&mut self.capture, &mut buf), if capturing => match read {
                    Ok(n) if n > 0 => {
                        if let Err(e) = self.send_chunk(&buf[..n], false).await {
                            warn!("failed to send audio chunk: {}", e);
                            self.finish(DoneReason::SocketClosed).await;
                        }
                    }
                    _ => self.on_capture_ended().await,
                },
                _ = tokio::time::sleep_until(self.capture_deadline), if capturing => {
                    debug!("max listen duration reached");
                    self.on_capture_ended().await;
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.finish(DoneReason::CaptureEnded).await;
                }
            }
        }
    }

    async fn on_text(&mut self, raw: &str) {
        let Some(event) = parse_server_message(raw) else {
            debug!("ignoring malformed realtime message");
            return;
        };
        match event {
            ServerEvent::SessionStarted => debug!("realtime session acknowledged"),
            ServerEvent::Partial(text) => {
                let _ = self.events.send(TranscriptEvent::Partial(text));
            }
            ServerEvent::Committed(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    self.accumulated.push(trimmed.to_string());
                }
                let _ = self.events.send(TranscriptEvent::Committed(text));
                if matches!(self.phase, SessionPhase::Finalizing { .. }) {
                    self.finish(DoneReason::CaptureEnded).await;
                }
            }
            ServerEvent::Error(detail) => {
                warn!("realtime provider error: {}", detail);
                self.finish(DoneReason::ServerError).await;
            }
            ServerEvent::Other => {}
        }
    }

    async fn send_chunk(&mut self, pcm: &[u8], commit: bool) -> VoiceResult<()> {
        let json = audio_chunk_json(pcm, commit)
            .map_err(|e| VoiceError::Stt(format!("audio chunk encoding failed: {}", e)))?;
        self.socket.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Capture is over without a stop request: the tool closed its output or hit the deadline.
    async fn on_capture_ended(&mut self) {
        if let Some(capture) = self.capture.take() {
            tokio::spawn(capture.process.shutdown(STOP_GRACE));
        }
        if self.phase != SessionPhase::Active {
            return;
        }
        debug!("capture ended, finalizing");
        if self.options.commit_strategy == CommitStrategy::Manual {
            if let Err(e) = self.send_chunk(&[], true).await {
                warn!("failed to send commit: {}", e);
                self.finish(DoneReason::SocketClosed).await;
                return;
            }
        }
        self.phase = SessionPhase::Finalizing {
            deadline: Instant::now() + self.options.finalize_grace,
        };
    }

    /// Single completion point. Later calls find the phase `Done` and return.
    async fn finish(&mut self, reason: DoneReason) {
        if self.phase == SessionPhase::Done {
            return;
        }
        self.phase = SessionPhase::Done;
        self.stopper.signal.stopped.store(true, Ordering::SeqCst);

        let text = self.accumulated.join(" ");
        if let Some(done) = self.done.take() {
            let _ = done.send(text.clone());
        }
        info!(?reason, chars = text.len(), "realtime transcription session done");

        if let Some(capture) = self.capture.take() {
            tokio::spawn(capture.process.shutdown(STOP_GRACE));
        }
        let _ = self.socket.close(None).await;
    }
}

async fn read_capture(capture: &mut Option<PcmCapture>, buf: &mut [u8]) -> std::io::Result<usize> {
    match capture {
        Some(c) => c.read_chunk(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
