//! # PAGI Converse - Spoken Conversation Engine
//!
//! Captures microphone audio through an OS capture tool, turns speech into text (batch upload or
//! a realtime socket), hands each utterance to an agent, and speaks the reply. `stop_talking()`
//! interrupts any phase of a turn.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        VoiceManager                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │ AudioRecorder│→ │  SttBackend  │→ │ Conversation │      │
//! │  │ (sox/arecord │  │ batch | live │  │   Handler    │      │
//! │  │   /ffmpeg)   │  │  (socket)    │  │  (dispatch)  │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │         ↑                                      ↓             │
//! │  ┌──────────────┐                    ┌──────────────┐      │
//! │  │  next turn   │←───────────────────│  TtsBackend  │      │
//! │  │              │   AudioPlayback    │ (+ streaming)│      │
//! │  └──────────────┘      (rodio)       └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod playback;
pub mod realtime;
pub mod recorder;
pub mod stt;
pub mod tts;
pub mod turn;

pub use config::{Credentials, SttProvider, TtsProvider, VoiceConfig};
pub use error::{VoiceError, VoiceResult};
pub use manager::{ListenOptions, VoiceManager, VoiceState};
pub use playback::{AudioPlayback, RodioPlayback};
pub use realtime::{
    CommitStrategy, LiveSession, RealtimeEndpoint, SessionOptions, SessionStopper, SessionUpdate,
    StreamingTranscriptionSession, TranscriptEvent,
};
pub use recorder::{
    AudioRecorder, AudioSpec, CaptureLimit, ExitReason, RecordOptions, RecorderTool,
    SilenceDetection, SilenceOptions,
};
pub use stt::{
    create_stt, ensure_wav, ElevenLabsStt, OpenAiStt, PlaceholderStt, SttBackend,
    SupportsStreaming, Transcript,
};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tts::{
    create_tts, AudioFormat, AudioStream, OpenAiTts, PlaceholderTts, SpeechAudio, StreamingTts,
    TtsBackend,
};
pub use turn::{ConversationHandler, ConversationTurn};
