//! **AudioRecorder** — supervises one external capture process (sox, arecord, ffmpeg).
//!
//! Capture runs out of process so the engine never links an audio stack. Tools are tried in a
//! fixed priority order; the first one installed wins. Recordings are written to a uniquely named
//! temp file (or piped as raw PCM for the realtime session) and read back once the tool exits.
//!
//! Stopping is graceful: the intentional-stop flag is recorded first, then the tool gets SIGINT so
//! it can flush. A non-zero exit after that is still a success.

use crate::error::{VoiceError, VoiceResult};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bit depth is fixed: 16-bit signed little-endian.
pub const BITS_PER_SAMPLE: u16 = 16;

/// How long a stopped capture tool gets to exit after SIGINT before it is killed.
pub(crate) const STOP_GRACE: Duration = Duration::from_millis(500);

/// Sample format shared by every capture and by the WAV wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
        }
    }
}

impl AudioSpec {
    /// Bytes of 16-bit PCM per second of audio.
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (BITS_PER_SAMPLE as usize / 8)
    }
}

/// Voice-activity parameters for silence-terminated capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceDetection {
    /// Input level (percent of full scale) that starts the capture.
    pub start_threshold_pct: f32,
    /// Trailing silence that ends the capture.
    pub trailing_silence: Duration,
}

impl Default for SilenceDetection {
    fn default() -> Self {
        Self {
            start_threshold_pct: 1.0,
            trailing_silence: Duration::from_millis(1500),
        }
    }
}

/// How long a capture runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureLimit {
    Fixed(Duration),
    UntilSilence {
        max: Duration,
        vad: SilenceDetection,
    },
}

impl CaptureLimit {
    /// Hard cap on the capture length.
    pub fn max_duration(&self) -> Duration {
        match *self {
            CaptureLimit::Fixed(d) => d,
            CaptureLimit::UntilSilence { max, .. } => max,
        }
    }
}

/// Where the captured audio goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutput {
    /// WAV file at this path.
    File(PathBuf),
    /// Raw PCM on stdout.
    Pipe,
}

/// Everything a tool needs to build its argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSpec {
    pub audio: AudioSpec,
    pub output: CaptureOutput,
    pub limit: CaptureLimit,
}

/// A resolved `{program, args}` pair, computed fresh per recording attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// A capture tool the recorder knows how to drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderTool {
    /// SoX (`sox -d ...`). Supports silence detection.
    Sox,
    /// ALSA `arecord` (Linux only).
    Arecord,
    /// ffmpeg with the host's audio subsystem as input.
    Ffmpeg,
    /// User-supplied command with `{sample_rate}`, `{channels}`, `{duration}`, `{output}` placeholders.
    Custom { program: String, args: Vec<String> },
}

impl RecorderTool {
    /// Built-in tools in priority order.
    pub fn defaults() -> Vec<RecorderTool> {
        vec![RecorderTool::Sox, RecorderTool::Arecord, RecorderTool::Ffmpeg]
    }

    /// Parse a whitespace-separated command template (config `recorder_command`).
    pub fn custom_from_template(template: &str) -> Option<RecorderTool> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(RecorderTool::Custom {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        match self {
            RecorderTool::Sox => "sox",
            RecorderTool::Arecord => "arecord",
            RecorderTool::Ffmpeg => "ffmpeg",
            RecorderTool::Custom { program, .. } => program,
        }
    }

    pub fn is_available(&self) -> bool {
        which::which(self.program()).is_ok()
    }

    pub fn supports_silence_detection(&self) -> bool {
        matches!(self, RecorderTool::Sox)
    }

    /// Build the invocation for `spec`, or `None` if this tool can't do it on this host.
    pub fn command(&self, spec: &CaptureSpec) -> Option<RecorderCommand> {
        let args = match self {
            RecorderTool::Sox => sox_args(spec)?,
            RecorderTool::Arecord => arecord_args(spec)?,
            RecorderTool::Ffmpeg => ffmpeg_args(spec)?,
            RecorderTool::Custom { args, .. } => {
                if matches!(spec.limit, CaptureLimit::UntilSilence { .. }) {
                    return None;
                }
                args.iter().map(|a| fill_template(a, spec)).collect()
            }
        };
        Some(RecorderCommand {
            program: self.program().to_string(),
            args,
        })
    }
}

fn duration_arg(d: Duration) -> String {
    let secs = d.as_secs_f32();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{:.2}", secs)
    }
}

fn sox_args(spec: &CaptureSpec) -> Option<Vec<String>> {
    let a = spec.audio;
    let mut args: Vec<String> = vec!["-q".into(), "-d".into()];
    args.extend([
        "-r".into(),
        a.sample_rate.to_string(),
        "-c".into(),
        a.channels.to_string(),
        "-b".into(),
        BITS_PER_SAMPLE.to_string(),
        "-e".into(),
        "signed-integer".into(),
    ]);
    match &spec.output {
        CaptureOutput::File(path) => {
            args.extend(["-t".into(), "wav".into(), path.display().to_string()])
        }
        CaptureOutput::Pipe => args.extend([
            "-t".into(),
            "raw".into(),
            "-L".into(),
            "-".into(),
        ]),
    }
    match spec.limit {
        CaptureLimit::Fixed(d) => args.extend(["trim".into(), "0".into(), duration_arg(d)]),
        CaptureLimit::UntilSilence { max, vad } => {
            let level = format!("{}%", vad.start_threshold_pct);
            args.extend(["trim".into(), "0".into(), duration_arg(max)]);
            args.extend([
                "silence".into(),
                "1".into(),
                "0.1".into(),
                level.clone(),
                "1".into(),
                duration_arg(vad.trailing_silence),
                level,
            ]);
        }
    }
    Some(args)
}

fn arecord_args(spec: &CaptureSpec) -> Option<Vec<String>> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let a = spec.audio;
    let mut args: Vec<String> = vec![
        "-q".into(),
        "-f".into(),
        "S16_LE".into(),
        "-r".into(),
        a.sample_rate.to_string(),
        "-c".into(),
        a.channels.to_string(),
    ];
    match spec.limit {
        CaptureLimit::Fixed(d) => args.extend(["-d".into(), d.as_secs().max(1).to_string()]),
        CaptureLimit::UntilSilence { .. } => return None,
    }
    match &spec.output {
        CaptureOutput::File(path) => {
            args.extend(["-t".into(), "wav".into(), path.display().to_string()])
        }
        CaptureOutput::Pipe => args.extend(["-t".into(), "raw".into()]),
    }
    Some(args)
}

/// Input device selection differs per host audio subsystem.
fn ffmpeg_input() -> Option<[&'static str; 4]> {
    if cfg!(target_os = "macos") {
        Some(["-f", "avfoundation", "-i", ":0"])
    } else if cfg!(target_os = "linux") {
        Some(["-f", "alsa", "-i", "default"])
    } else if cfg!(target_os = "windows") {
        Some(["-f", "dshow", "-i", "audio=default"])
    } else {
        None
    }
}

fn ffmpeg_args(spec: &CaptureSpec) -> Option<Vec<String>> {
    let input = ffmpeg_input()?;
    let a = spec.audio;
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.extend(input.iter().map(|s| s.to_string()));
    args.extend([
        "-ac".into(),
        a.channels.to_string(),
        "-ar".into(),
        a.sample_rate.to_string(),
    ]);
    match spec.limit {
        CaptureLimit::Fixed(d) => args.extend(["-t".into(), duration_arg(d)]),
        CaptureLimit::UntilSilence { .. } => return None,
    }
    match &spec.output {
        CaptureOutput::File(path) => args.extend([
            "-acodec".into(),
            "pcm_s16le".into(),
            "-y".into(),
            path.display().to_string(),
        ]),
        CaptureOutput::Pipe => args.extend([
            "-f".into(),
            "s16le".into(),
            "-acodec".into(),
            "pcm_s16le".into(),
            "pipe:1".into(),
        ]),
    }
    Some(args)
}

fn fill_template(arg: &str, spec: &CaptureSpec) -> String {
    let duration = duration_arg(spec.limit.max_duration());
    let output = match &spec.output {
        CaptureOutput::File(path) => path.display().to_string(),
        CaptureOutput::Pipe => "-".to_string(),
    };
    arg.replace("{sample_rate}", &spec.audio.sample_rate.to_string())
        .replace("{channels}", &spec.audio.channels.to_string())
        .replace("{duration}", &duration)
        .replace("{output}", &output)
}

/// Why a capture process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    /// We asked it to stop; the exit code is not meaningful.
    GracefullyStopped,
    Failed(Option<i32>),
}

impl ExitReason {
    /// Classify from the intentional-stop flag (recorded before signalling) and the exit status.
    pub fn classify(stop_requested: bool, success: bool, code: Option<i32>) -> ExitReason {
        if stop_requested {
            ExitReason::GracefullyStopped
        } else if success {
            ExitReason::Normal
        } else {
            ExitReason::Failed(code)
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ExitReason::Failed(_))
    }
}

/// A running capture tool.
pub struct CaptureProcess {
    child: Child,
    tool: String,
}

impl CaptureProcess {
    fn spawn(tool: &RecorderTool, cmd: &RecorderCommand, pipe: bool) -> VoiceResult<Self> {
        debug!(tool = %cmd.program, args = ?cmd.args, "spawning capture tool");
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(if pipe { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn()?;
        Ok(Self {
            child,
            tool: tool.program().to_string(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Ask the tool to finish: SIGINT on unix so it flushes, a kill elsewhere.
    pub fn interrupt(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: pid belongs to a child we spawned and have not reaped yet.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
                if rc != 0 {
                    debug!(tool = %self.tool, "SIGINT delivery failed (already exited?)");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Interrupt, wait up to `grace`, then force-kill if the tool ignores the signal.
    pub async fn stop_and_wait(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        self.interrupt();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(tool = %self.tool, "capture tool ignored SIGINT, killing");
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }

    /// [`CaptureProcess::stop_and_wait`], discarding the exit status.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Err(e) = self.stop_and_wait(grace).await {
            debug!(tool = %self.tool, "capture shutdown: {}", e);
        }
    }

    fn take_stderr_tail(&mut self) -> tokio::task::JoinHandle<String> {
        let stderr = self.child.stderr.take();
        tokio::spawn(async move {
            let mut out = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut out).await;
            }
            out
        })
    }
}

/// Raw PCM stream from a piped capture process. Owned by one realtime session.
pub struct PcmCapture {
    pub process: CaptureProcess,
    stdout: ChildStdout,
}

impl PcmCapture {
    /// Read the next chunk into `buf`. `Ok(0)` means the tool closed its output.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf).await
    }
}

/// Options for [`AudioRecorder::record`].
#[derive(Debug, Clone, Copy)]
pub struct RecordOptions {
    pub audio: AudioSpec,
    pub duration: Duration,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            audio: AudioSpec::default(),
            duration: Duration::from_secs(5),
        }
    }
}

/// Options for [`AudioRecorder::record_until_silence`].
#[derive(Debug, Clone, Copy)]
pub struct SilenceOptions {
    pub audio: AudioSpec,
    pub max_duration: Duration,
    pub vad: SilenceDetection,
    /// Fixed duration used when no installed tool supports silence detection.
    pub fallback_duration: Duration,
}

impl Default for SilenceOptions {
    fn default() -> Self {
        Self {
            audio: AudioSpec::default(),
            max_duration: Duration::from_secs(30),
            vad: SilenceDetection::default(),
            fallback_duration: Duration::from_secs(5),
        }
    }
}

/// The in-flight capture of one recorder.
struct RecordingHandle {
    stop_requested: AtomicBool,
    stop: Notify,
}

/// Clears the active slot and removes the temp file, including when the record future is dropped.
struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<Arc<RecordingHandle>>>,
    path: PathBuf,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove capture file: {}", e);
            }
        }
    }
}

struct RecorderInner {
    tools: Vec<RecorderTool>,
    active: Mutex<Option<Arc<RecordingHandle>>>,
    temp_dir: PathBuf,
}

/// Owns at most one capture process at a time. Cheap to clone; clones share the active capture.
#[derive(Clone)]
pub struct AudioRecorder {
    inner: Arc<RecorderInner>,
}

impl Default for AudioRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRecorder {
    /// Recorder over the built-in tools (sox, arecord, ffmpeg).
    pub fn new() -> Self {
        Self::with_tools(RecorderTool::defaults())
    }

    /// Recorder over an explicit priority list.
    pub fn with_tools(tools: Vec<RecorderTool>) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                tools,
                active: Mutex::new(None),
                temp_dir: std::env::temp_dir(),
            }),
        }
    }

    /// Custom command (if configured) first, then the built-ins.
    pub fn from_command_template(template: Option<&str>) -> Self {
        let mut tools = Vec::new();
        if let Some(custom) = template.and_then(RecorderTool::custom_from_template) {
            tools.push(custom);
        }
        tools.extend(RecorderTool::defaults());
        Self::with_tools(tools)
    }

    pub fn tools(&self) -> &[RecorderTool] {
        &self.inner.tools
    }

    /// Installed tools, in priority order.
    pub fn available_tools(&self) -> Vec<RecorderTool> {
        self.inner
            .tools
            .iter()
            .filter(|t| t.is_available())
            .cloned()
            .collect()
    }

    /// True if some installed tool can end a capture on trailing silence.
    pub fn supports_silence_detection(&self) -> bool {
        self.inner
            .tools
            .iter()
            .any(|t| t.supports_silence_detection() && t.is_available())
    }

    /// True while a `record*` call has a process running.
    pub fn is_recording(&self) -> bool {
        self.inner
            .active
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn no_recorder(&self) -> VoiceError {
        let names: Vec<&str> = self.inner.tools.iter().map(|t| t.program()).collect();
        VoiceError::NoRecorder(names.join(", "))
    }

    /// First installed tool that can run `spec`.
    fn resolve(&self, spec: &CaptureSpec) -> Option<(RecorderTool, RecorderCommand)> {
        self.inner
            .tools
            .iter()
            .filter(|t| t.is_available())
            .find_map(|t| t.command(spec).map(|cmd| (t.clone(), cmd)))
    }

    /// Record for a fixed duration. Returns the captured file's bytes (empty if nothing was flushed).
    pub async fn record(&self, opts: RecordOptions) -> VoiceResult<Vec<u8>> {
        self.capture_to_file(opts.audio, CaptureLimit::Fixed(opts.duration))
            .await
    }

    /// Record until trailing silence (or `max_duration`). Falls back to a short fixed recording
    /// when no installed tool supports silence detection.
    pub async fn record_until_silence(&self, opts: SilenceOptions) -> VoiceResult<Vec<u8>> {
        let limit = CaptureLimit::UntilSilence {
            max: opts.max_duration,
            vad: opts.vad,
        };
        let probe = CaptureSpec {
            audio: opts.audio,
            output: CaptureOutput::File(PathBuf::new()),
            limit,
        };
        if self.resolve(&probe).is_none() {
            debug!("no silence-detecting recorder installed, using fixed-length capture");
            return self
                .record(RecordOptions {
                    audio: opts.audio,
                    duration: opts.fallback_duration,
                })
                .await;
        }
        self.capture_to_file(opts.audio, limit).await
    }

    async fn capture_to_file(&self, audio: AudioSpec, limit: CaptureLimit) -> VoiceResult<Vec<u8>> {
        let path = self
            .inner
            .temp_dir
            .join(format!("pagi-capture-{}.wav", Uuid::new_v4()));
        let spec = CaptureSpec {
            audio,
            output: CaptureOutput::File(path.clone()),
            limit,
        };

        let handle = Arc::new(RecordingHandle {
            stop_requested: AtomicBool::new(false),
            stop: Notify::new(),
        });
        {
            let mut slot = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return Err(VoiceError::RecorderBusy);
            }
            *slot = Some(Arc::clone(&handle));
        }
        let _guard = ActiveGuard {
            slot: &self.inner.active,
            path: path.clone(),
        };

        let (tool, cmd) = self.resolve(&spec).ok_or_else(|| self.no_recorder())?;
        let mut process = CaptureProcess::spawn(&tool, &cmd, false)?;
        let stderr = process.take_stderr_tail();
        info!(tool = %tool.program(), "🎤 recording started");

        let status = tokio::select! {
            status = process.wait() => status?,
            _ = handle.stop.notified() => process.stop_and_wait(STOP_GRACE).await?,
        };

        let reason = ExitReason::classify(
            handle.stop_requested.load(Ordering::SeqCst),
            status.success(),
            status.code(),
        );
        debug!(tool = %tool.program(), ?reason, "capture tool exited");

        if let ExitReason::Failed(code) = reason {
            let stderr = tokio::time::timeout(Duration::from_millis(200), stderr)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default();
            return Err(VoiceError::RecorderFailed {
                code: code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr: stderr.trim().to_string(),
            });
        }
        stderr.abort();

        let bytes = read_capture(&path).await?;
        info!(tool = %tool.program(), bytes = bytes.len(), "recording finished");
        Ok(bytes)
    }

    /// Stop the active recording, if any. The tool gets SIGINT so it can flush what it has.
    pub fn stop(&self) {
        let active = match self.inner.active.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(handle) = active {
            if !handle.stop_requested.swap(true, Ordering::SeqCst) {
                info!("recording stop requested");
                handle.stop.notify_one();
            }
        }
    }

    /// Spawn a capture tool writing raw 16-bit PCM to a pipe. The tool ends on its own at
    /// `limit`; a silence limit no installed tool supports degrades to a fixed cap of `max`.
    pub fn open_pcm_stream(&self, audio: AudioSpec, limit: CaptureLimit) -> VoiceResult<PcmCapture> {
        let mut spec = CaptureSpec {
            audio,
            output: CaptureOutput::Pipe,
            limit,
        };
        let resolved = match self.resolve(&spec) {
            Some(found) => Some(found),
            None if matches!(limit, CaptureLimit::UntilSilence { .. }) => {
                debug!("no silence-detecting recorder installed, capping stream at max duration");
                spec.limit = CaptureLimit::Fixed(limit.max_duration());
                self.resolve(&spec)
            }
            None => None,
        };
        let (tool, cmd) = resolved.ok_or_else(|| self.no_recorder())?;
        let mut process = CaptureProcess::spawn(&tool, &cmd, true)?;
        let _ = process.take_stderr_tail();
        let stdout = process
            .take_stdout()
            .ok_or_else(|| {
                VoiceError::Io(std::io::Error::other("capture tool stdout not piped"))
            })?;
        info!(tool = %tool.program(), "🎤 streaming capture started");
        Ok(PcmCapture { process, stdout })
    }
}

async fn read_capture(path: &Path) -> VoiceResult<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
