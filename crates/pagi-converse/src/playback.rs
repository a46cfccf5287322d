//! **Playback** — where synthesized speech goes, and the kill-switch that silences it.
//!
//! [`RodioPlayback`] keeps the rodio `OutputStream` on its own thread (the stream is not `Send`)
//! and plays each utterance through a fresh `Sink`, so `stop()` only ever affects the utterance
//! currently playing.

use crate::error::{VoiceError, VoiceResult};
use crate::tts::{AudioFormat, AudioStream};
use async_trait::async_trait;
use futures::StreamExt;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::io::Cursor;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const DRAIN_POLL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait AudioPlayback: Send + Sync {
    /// Play one utterance and return when it has finished or been stopped.
    async fn play(&self, bytes: Vec<u8>, format: AudioFormat) -> VoiceResult<()>;

    /// Whether [`AudioPlayback::play_stream`] starts audio before the stream ends.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Play chunks as they arrive. The default buffers the whole stream, then plays it.
    async fn play_stream(&self, mut chunks: AudioStream, format: AudioFormat) -> VoiceResult<()> {
        let mut bytes = Vec::new();
        while let Some(chunk) = chunks.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        self.play(bytes, format).await
    }

    /// Silence the current utterance. No-op when idle.
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Default output device through rodio.
pub struct RodioPlayback {
    handle: OutputStreamHandle,
    current: Mutex<Option<Arc<Sink>>>,
    // Dropping the sender ends the thread that owns the OutputStream.
    _keepalive: mpsc::Sender<()>,
}

impl RodioPlayback {
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (keep_tx, keep_rx) = mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("pagi-playback".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    let _ = keep_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                }
            })?;
        let handle = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited".to_string()))?
            .map_err(VoiceError::Playback)?;
        info!("🔊 playback ready on default output device");
        Ok(Self {
            handle,
            current: Mutex::new(None),
            _keepalive: keep_tx,
        })
    }

    fn begin(&self) -> VoiceResult<Arc<Sink>> {
        let sink = Arc::new(Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?);
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.replace(sink.clone()) {
            previous.stop();
        }
        Ok(sink)
    }

    fn is_current(&self, sink: &Arc<Sink>) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().is_some_and(|c| Arc::ptr_eq(c, sink))
    }

    fn finish(&self, sink: &Arc<Sink>) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, sink)) {
            *current = None;
        }
    }

    async fn drain(&self, sink: &Arc<Sink>) {
        while !sink.empty() && self.is_current(sink) {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        self.finish(sink);
    }
}

/// Decode 16-bit LE samples; an odd trailing byte is left in `carry` for the next chunk.
fn pcm16_samples(carry: &mut Vec<u8>, chunk: &[u8]) -> Vec<i16> {
    carry.extend_from_slice(chunk);
    let whole = carry.len() - carry.len() % 2;
    let samples = carry[..whole]
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    carry.drain(..whole);
    samples
}

#[async_trait]
impl AudioPlayback for RodioPlayback {
    async fn play(&self, bytes: Vec<u8>, format: AudioFormat) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let sink = self.begin()?;
        match format {
            AudioFormat::Pcm16 { sample_rate } => {
                let samples = pcm16_samples(&mut Vec::new(), &bytes);
                sink.append(SamplesBuffer::new(1, sample_rate, samples));
            }
            AudioFormat::Wav | AudioFormat::Mp3 => {
                let source = rodio::Decoder::new(Cursor::new(bytes))
                    .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
                sink.append(source);
            }
        }
        debug!(?format, "playing utterance");
        self.drain(&sink).await;
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn play_stream(&self, mut chunks: AudioStream, format: AudioFormat) -> VoiceResult<()> {
        let AudioFormat::Pcm16 { sample_rate } = format else {
            let mut bytes = Vec::new();
            while let Some(chunk) = chunks.next().await {
                bytes.extend_from_slice(&chunk?);
            }
            return self.play(bytes, format).await;
        };

        let sink = self.begin()?;
        let mut carry = Vec::new();
        while let Some(chunk) = chunks.next().await {
            if !self.is_current(&sink) {
                debug!("stream playback stopped mid-utterance");
                return Ok(());
            }
            let samples = pcm16_samples(&mut carry, &chunk?);
            if !samples.is_empty() {
                sink.append(SamplesBuffer::new(1, sample_rate, samples));
            }
        }
        self.drain(&sink).await;
        Ok(())
    }

    fn stop(&self) {
        let taken = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sink) = taken {
            sink.stop();
            info!("playback stopped");
        }
    }

    fn is_playing(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().is_some_and(|s| !s.empty())
    }
}
