//! Turn records and the caller's side of the conversation loop
//!
//! A turn is one listen → transcribe → dispatch → speak cycle. The loop reports each step to a
//! [`ConversationHandler`]; only `dispatch` is required.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// What happened in one turn. Handed to [`ConversationHandler::on_turn_complete`], never stored.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub transcript: String,
    pub response: Option<String>,
    /// Set when the turn failed after a transcript was obtained.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub(crate) fn begin(started_at: DateTime<Utc>, transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            response: None,
            error: None,
            started_at,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.response.is_some()
    }
}

/// Callbacks for [`VoiceManager::talk`](crate::VoiceManager::talk).
///
/// `dispatch` is the call into the agent layer; the loop imposes no timeout on it.
#[async_trait]
pub trait ConversationHandler: Send + Sync {
    /// Turn the user's transcript into the text to speak back.
    async fn dispatch(&self, transcript: &str) -> VoiceResult<String>;

    /// Final transcript of a turn, emitted right before dispatch.
    fn on_transcript(&self, _transcript: &str) {}

    /// Provisional text while the user is still speaking (streaming providers only).
    fn on_partial_transcript(&self, _text: &str) {}

    fn on_response(&self, _response: &str) {}

    /// Asked before dispatch when auto-send is off. `false` discards the turn.
    async fn confirm(&self, _transcript: &str) -> bool {
        true
    }

    /// A turn failed; the loop keeps going unless it was stopped.
    fn on_turn_error(&self, _error: &VoiceError) {}

    fn on_turn_complete(&self, _turn: &ConversationTurn) {}
}
