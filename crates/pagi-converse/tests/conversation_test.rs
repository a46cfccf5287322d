//! Conversation loop with scripted providers and `sh -c` capture tools.

#![cfg(unix)]

mod common;

use async_trait::async_trait;
use common::{
    drain, init_tracing, next_json, send_json, sh_recorder, spawn_realtime_server, transcript,
    ws_url,
};
use pagi_converse::{
    AudioFormat, AudioPlayback, AudioStream, CommitStrategy, ConversationHandler, ConversationTurn,
    RealtimeEndpoint, SessionOptions, SpeechAudio, StreamingTranscriptionSession, SttBackend,
    SupportsStreaming, Transcript, TtsBackend, VoiceConfig, VoiceError, VoiceManager, VoiceResult,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Writes 100 ms of raw PCM, like a short utterance.
const UTTERANCE: &str = "head -c 3200 /dev/zero > {output}";
/// A microphone that never goes quiet and ignores `{duration}`.
const ENDLESS_MIC: &str = "while true; do head -c 3200 /dev/zero; sleep 0.1; done";

/// Batch STT that replays scripted results, then hears silence.
struct ScriptedStt {
    script: Mutex<VecDeque<VoiceResult<String>>>,
    calls: AtomicUsize,
}

impl ScriptedStt {
    fn new(script: Vec<VoiceResult<String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn repeating(text: &str) -> Self {
        Self::new((0..100).map(|_| Ok(text.to_string())).collect())
    }
}

#[async_trait]
impl SttBackend for ScriptedStt {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn transcribe(&self, audio: &[u8]) -> VoiceResult<Transcript> {
        assert!(audio.starts_with(b"RIFF"), "uploads are WAV");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(Transcript {
                text,
                language: None,
            }),
            Some(Err(e)) => Err(e),
            None => Ok(Transcript::default()),
        }
    }
}

/// Streaming STT pointed at a loopback server.
struct LoopbackStt {
    addr: SocketAddr,
}

#[async_trait]
impl SttBackend for LoopbackStt {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn transcribe(&self, _audio: &[u8]) -> VoiceResult<Transcript> {
        Err(VoiceError::Stt("batch path not expected".into()))
    }

    fn streaming(&self) -> Option<&dyn SupportsStreaming> {
        Some(self)
    }
}

impl SupportsStreaming for LoopbackStt {
    fn realtime_session(&self, options: SessionOptions) -> VoiceResult<StreamingTranscriptionSession> {
        Ok(StreamingTranscriptionSession::new(
            RealtimeEndpoint {
                url: ws_url(self.addr),
                api_key: None,
                model: "scribe_v2_realtime".into(),
            },
            options,
        ))
    }
}

struct EchoTts;

#[async_trait]
impl TtsBackend for EchoTts {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<SpeechAudio> {
        Ok(SpeechAudio {
            bytes: text.as_bytes().to_vec(),
            format: AudioFormat::Wav,
        })
    }
}

#[derive(Default)]
struct RecordingPlayback {
    played: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

#[async_trait]
impl AudioPlayback for RecordingPlayback {
    async fn play(&self, bytes: Vec<u8>, _format: AudioFormat) -> VoiceResult<()> {
        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&bytes).into_owned());
        Ok(())
    }

    async fn play_stream(&self, _chunks: AudioStream, _format: AudioFormat) -> VoiceResult<()> {
        panic!("streaming playback not advertised");
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        false
    }
}

/// Records every callback and reports dispatches on a channel.
struct Agent {
    confirm: bool,
    fail_dispatch_first: bool,
    dispatched: Mutex<Vec<String>>,
    transcripts: Mutex<Vec<String>>,
    partials: Mutex<Vec<String>>,
    responses: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    confirms: AtomicUsize,
    completed: Mutex<Vec<ConversationTurn>>,
    events: mpsc::UnboundedSender<&'static str>,
}

impl Agent {
    fn new(events: mpsc::UnboundedSender<&'static str>) -> Self {
        Self {
            confirm: true,
            fail_dispatch_first: false,
            dispatched: Mutex::default(),
            transcripts: Mutex::default(),
            partials: Mutex::default(),
            responses: Mutex::default(),
            errors: Mutex::default(),
            confirms: AtomicUsize::new(0),
            completed: Mutex::default(),
            events,
        }
    }
}

#[async_trait]
impl ConversationHandler for Agent {
    async fn dispatch(&self, transcript: &str) -> VoiceResult<String> {
        let first = {
            let mut d = self.dispatched.lock().unwrap();
            d.push(transcript.to_string());
            d.len() == 1
        };
        let _ = self.events.send("dispatch");
        if first && self.fail_dispatch_first {
            return Err(VoiceError::Connection("agent unreachable".into()));
        }
        Ok(format!("You said: {}", transcript))
    }

    fn on_transcript(&self, transcript: &str) {
        self.transcripts.lock().unwrap().push(transcript.to_string());
    }

    fn on_partial_transcript(&self, text: &str) {
        self.partials.lock().unwrap().push(text.to_string());
    }

    fn on_response(&self, response: &str) {
        self.responses.lock().unwrap().push(response.to_string());
    }

    async fn confirm(&self, _transcript: &str) -> bool {
        self.confirms.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send("confirm");
        self.confirm
    }

    fn on_turn_error(&self, error: &VoiceError) {
        self.errors.lock().unwrap().push(error.to_string());
        let _ = self.events.send("error");
    }

    fn on_turn_complete(&self, turn: &ConversationTurn) {
        self.completed.lock().unwrap().push(turn.clone());
        let _ = self.events.send("complete");
    }
}

fn manager(
    config: VoiceConfig,
    stt: Arc<dyn SttBackend>,
    playback: Arc<RecordingPlayback>,
    capture: &str,
) -> Arc<VoiceManager> {
    Arc::new(
        VoiceManager::new(config, stt, Arc::new(EchoTts), playback).with_recorder(sh_recorder(capture)),
    )
}

fn spawn_talk(
    manager: &Arc<VoiceManager>,
    agent: &Arc<Agent>,
) -> tokio::task::JoinHandle<VoiceResult<()>> {
    let m = Arc::clone(manager);
    let a = Arc::clone(agent);
    tokio::spawn(async move { m.talk(a.as_ref()).await })
}

async fn wait_for(events: &mut mpsc::UnboundedReceiver<&'static str>, wanted: &str, count: usize) {
    let mut seen = 0;
    timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if event == wanted {
                seen += 1;
                if seen == count {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {} x{}", wanted, count));
}

#[tokio::test]
async fn failed_turn_does_not_end_the_loop() {
    init_tracing();
    let (tx, mut events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let stt = Arc::new(ScriptedStt::new(vec![
        Err(VoiceError::Stt("provider timeout".into())),
        Ok("second try".into()),
    ]));
    let playback = Arc::new(RecordingPlayback::default());
    let m = manager(VoiceConfig::default(), stt.clone(), playback.clone(), UTTERANCE);

    let talk = spawn_talk(&m, &agent);
    wait_for(&mut events, "complete", 1).await;
    m.stop_talking();
    timeout(Duration::from_secs(5), talk).await.unwrap().unwrap().unwrap();

    assert_eq!(agent.errors.lock().unwrap().as_slice(), ["STT error: provider timeout"]);
    assert_eq!(agent.dispatched.lock().unwrap()[0], "second try");
    assert_eq!(agent.responses.lock().unwrap()[0], "You said: second try");
    assert_eq!(playback.played.lock().unwrap()[0], "You said: second try");
    assert!(agent.completed.lock().unwrap()[0].succeeded());
    assert!(!m.state().is_talking);
}

#[tokio::test]
async fn dispatch_error_is_reported_on_the_turn() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut agent = Agent::new(tx);
    agent.fail_dispatch_first = true;
    let agent = Arc::new(agent);
    let stt = Arc::new(ScriptedStt::repeating("hello"));
    let playback = Arc::new(RecordingPlayback::default());
    let m = manager(VoiceConfig::default(), stt, playback, UTTERANCE);

    let talk = spawn_talk(&m, &agent);
    wait_for(&mut events, "complete", 2).await;
    m.stop_talking();
    timeout(Duration::from_secs(5), talk).await.unwrap().unwrap().unwrap();

    let completed = agent.completed.lock().unwrap();
    assert_eq!(completed[0].error.as_deref(), Some("Connection error: agent unreachable"));
    assert!(completed[1].succeeded());
    assert_eq!(agent.errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn declined_confirmation_never_dispatches() {
    init_tracing();
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut agent = Agent::new(tx);
    agent.confirm = false;
    let agent = Arc::new(agent);
    let config = VoiceConfig {
        auto_send: false,
        ..Default::default()
    };
    let stt = Arc::new(ScriptedStt::repeating("please do not send"));
    let playback = Arc::new(RecordingPlayback::default());
    let m = manager(config, stt, playback.clone(), UTTERANCE);

    let talk = spawn_talk(&m, &agent);
    wait_for(&mut events, "confirm", 2).await;
    m.stop_talking();
    timeout(Duration::from_secs(5), talk).await.unwrap().unwrap().unwrap();

    assert!(agent.dispatched.lock().unwrap().is_empty());
    assert!(agent.responses.lock().unwrap().is_empty());
    assert!(playback.played.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stop_right_after_start_exits_without_dispatch() {
    init_tracing();
    let (tx, _events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let stt = Arc::new(ScriptedStt::repeating("never heard"));
    let playback = Arc::new(RecordingPlayback::default());
    let m = manager(VoiceConfig::default(), stt.clone(), playback, "exec sleep 10");

    let mut state = m.subscribe();
    let talk = spawn_talk(&m, &agent);
    state.wait_for(|s| s.is_talking).await.unwrap();
    m.stop_talking();

    timeout(Duration::from_secs(3), talk).await.unwrap().unwrap().unwrap();
    let s = m.state();
    assert!(!s.is_talking && !s.is_listening && !s.is_speaking);
    assert!(s.enabled);
    assert!(agent.dispatched.lock().unwrap().is_empty());
    assert!(agent.responses.lock().unwrap().is_empty());
    assert_eq!(stt.calls.load(Ordering::SeqCst), 0);
    assert!(!m.recorder().is_recording());
}

#[tokio::test]
async fn missing_recorder_ends_the_loop_with_error() {
    let (tx, _events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let stt: Arc<dyn SttBackend> = Arc::new(ScriptedStt::repeating("x"));
    let m = VoiceManager::new(
        VoiceConfig::default(),
        stt,
        Arc::new(EchoTts),
        Arc::new(RecordingPlayback::default()),
    )
    .with_recorder(pagi_converse::AudioRecorder::with_tools(vec![
        pagi_converse::RecorderTool::Custom {
            program: "pagi-no-such-recorder".into(),
            args: vec![],
        },
    ]));

    let result = timeout(Duration::from_secs(3), m.talk(agent.as_ref())).await.unwrap();
    assert!(matches!(result, Err(VoiceError::NoRecorder(_))));
    assert!(!m.state().is_talking);
    assert_eq!(agent.errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn committed_transcript_ends_listening_early() {
    init_tracing();
    let addr = spawn_realtime_server(|mut ws| async move {
        if next_json(&mut ws).await.is_some() {
            send_json(&mut ws, transcript("partial_transcript", "turn")).await;
            send_json(&mut ws, transcript("committed_transcript", "turn one")).await;
        }
        drain(ws).await;
    })
    .await;

    let (tx, mut events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let playback = Arc::new(RecordingPlayback::default());
    // The capture tool would run for 10 s; the commit must not wait for it.
    let m = manager(
        VoiceConfig::default(),
        Arc::new(LoopbackStt { addr }),
        playback.clone(),
        "head -c 6400 /dev/zero; exec sleep 10",
    );

    let talk = spawn_talk(&m, &agent);
    timeout(Duration::from_secs(4), wait_for(&mut events, "dispatch", 1))
        .await
        .unwrap();
    m.stop_talking();
    timeout(Duration::from_secs(5), talk).await.unwrap().unwrap().unwrap();

    assert_eq!(agent.dispatched.lock().unwrap()[0], "turn one");
    assert_eq!(agent.transcripts.lock().unwrap()[0], "turn one");
    assert!(agent.partials.lock().unwrap().contains(&"turn".to_string()));
}

#[tokio::test]
async fn manual_commit_turn_is_dispatched_after_max_listen() {
    init_tracing();
    let addr = spawn_realtime_server(|mut ws| async move {
        while let Some(msg) = next_json(&mut ws).await {
            if msg["commit"] == true {
                send_json(&mut ws, transcript("committed_transcript", "manual turn")).await;
            }
        }
    })
    .await;

    let (tx, mut events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let playback = Arc::new(RecordingPlayback::default());
    let config = VoiceConfig {
        commit_strategy: CommitStrategy::Manual,
        max_listen_secs: 1,
        ..Default::default()
    };
    let m = manager(config, Arc::new(LoopbackStt { addr }), playback.clone(), ENDLESS_MIC);

    let talk = spawn_talk(&m, &agent);
    wait_for(&mut events, "dispatch", 1).await;
    m.stop_talking();
    timeout(Duration::from_secs(5), talk).await.unwrap().unwrap().unwrap();

    assert_eq!(agent.dispatched.lock().unwrap()[0], "manual turn");
    assert_eq!(playback.played.lock().unwrap()[0], "You said: manual turn");
}

#[tokio::test]
async fn streaming_without_auto_send_confirms_after_session_completes() {
    init_tracing();
    let addr = spawn_realtime_server(|mut ws| async move {
        if next_json(&mut ws).await.is_some() {
            send_json(&mut ws, transcript("committed_transcript", "confirm me")).await;
        }
        drain(ws).await;
    })
    .await;

    let (tx, mut events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let playback = Arc::new(RecordingPlayback::default());
    let config = VoiceConfig {
        auto_send: false,
        max_listen_secs: 1,
        ..Default::default()
    };
    let m = manager(config, Arc::new(LoopbackStt { addr }), playback, ENDLESS_MIC);

    let talk = spawn_talk(&m, &agent);
    let mut order = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            order.push(event);
            if event == "dispatch" {
                break;
            }
        }
    })
    .await
    .expect("dispatch after confirmation");
    m.stop_talking();
    timeout(Duration::from_secs(5), talk).await.unwrap().unwrap().unwrap();

    assert_eq!(order, ["confirm", "dispatch"]);
    assert_eq!(agent.confirms.load(Ordering::SeqCst), 1);
    assert_eq!(agent.transcripts.lock().unwrap()[0], "confirm me");
    assert_eq!(agent.dispatched.lock().unwrap()[0], "confirm me");
}

#[tokio::test]
async fn stop_while_listening_resolves_turn_empty() {
    init_tracing();
    let addr = spawn_realtime_server(|ws| drain(ws)).await;

    let (tx, _events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let playback = Arc::new(RecordingPlayback::default());
    let m = manager(
        VoiceConfig::default(),
        Arc::new(LoopbackStt { addr }),
        playback,
        "head -c 6400 /dev/zero; exec sleep 10",
    );

    let mut state = m.subscribe();
    let talk = spawn_talk(&m, &agent);
    timeout(Duration::from_secs(5), state.wait_for(|s| s.is_listening))
        .await
        .unwrap()
        .unwrap();
    m.stop_talking();

    timeout(Duration::from_secs(3), talk).await.unwrap().unwrap().unwrap();
    assert!(agent.dispatched.lock().unwrap().is_empty());
    let s = m.state();
    assert!(!s.is_talking && !s.is_listening);
}

#[tokio::test]
async fn newer_talk_supersedes_running_loop() {
    let (tx, _events) = mpsc::unbounded_channel();
    let agent = Arc::new(Agent::new(tx));
    let stt = Arc::new(ScriptedStt::repeating("x"));
    let playback = Arc::new(RecordingPlayback::default());
    let m = manager(VoiceConfig::default(), stt, playback, "exec sleep 10");

    let mut state = m.subscribe();
    let first = spawn_talk(&m, &agent);
    state.wait_for(|s| s.is_listening).await.unwrap();

    let second = spawn_talk(&m, &agent);
    timeout(Duration::from_secs(3), first).await.unwrap().unwrap().unwrap();
    assert!(m.state().is_talking, "second loop still running");

    m.stop_talking();
    timeout(Duration::from_secs(3), second).await.unwrap().unwrap().unwrap();
    assert!(!m.state().is_talking);
}
