//! Capture workflow state machine.
//!
//! Drives one run of the live-capture workflow: open camera, microphone, and
//! session; watch the camera feed for a stably framed object; capture and
//! analyze it; reconnect the session in conversation mode; collect the spoken
//! memory; persist. Everything runs on one task with run-to-completion
//! handlers, so the capture flag and transcript buffer need no locks.

use crate::analyze::{ObjectAnalyzer, ObjectDescription};
use crate::capture::{AudioCapture, CaptureConfig, CaptureEvent, MicFactory};
use crate::chime::ToneChime;
use crate::error::{LiveError, Result};
use crate::media::MediaChunk;
use crate::playback::{
    AudioPlayback, OutputSink, PlaybackConfig, PlaybackEvent, PlaybackEventKind, SystemClock,
};
use crate::session::{LiveSession, SessionConfig, SessionEvent, SessionEventKind};
use crate::stability::{StabilityConfig, StabilityDetector};
use crate::store::{MemoryRecord, MemoryStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hardware seam for the camera.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<()>;
    /// Grab the current frame. Per-tick failures while the device warms up
    /// are expected and swallowed by the caller.
    fn grab(&mut self) -> Result<RgbImage>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// Output-device factory shared by playback and the capture tone.
pub type SharedSinkFactory = Arc<dyn Fn() -> Result<Box<dyn OutputSink>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Scanning,
    Recording,
    Saving,
}

/// User actions driving the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Done,
    Cancel,
}

/// Feedback events for whatever front end is listening.
#[derive(Debug, Clone)]
pub enum Notice {
    Phase(Phase),
    InputLevel(f32),
    OutputLevel(f32),
    Captured { description: String },
    Transcript(String),
    Saved { memory_text: String },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub session: SessionConfig,
    pub tick_interval: Duration,
    pub stability: StabilityConfig,
    /// Width the scan-preview frames are downscaled to before transmission.
    pub preview_width: u32,
    /// Saved in place of the transcript when the user never said anything
    /// usable.
    pub placeholder_memory: String,
    pub scan_instruction: String,
    /// `{description}` is replaced with the analyzer's result.
    pub record_instruction: String,
    /// Synthetic user turn sent right after the mode switch so the model
    /// speaks first. `{description}` is replaced as above.
    pub trigger_text: String,
}

impl ControllerConfig {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            tick_interval: Duration::from_millis(500),
            stability: StabilityConfig::default(),
            preview_width: 320,
            placeholder_memory: "A moment worth remembering.".to_string(),
            scan_instruction: "You are watching a live camera feed. The user is framing a \
                 single object they want to remember. Stay quiet unless asked."
                .to_string(),
            record_instruction: "The user just captured a photo of: {description}. Warmly ask \
                 them to tell you the memory attached to it. While they talk, restate the full \
                 memory so far as a JSON object of the form {\"memory\": \"...\"} in your text \
                 output, rewriting it completely each time."
                .to_string(),
            trigger_text: "I captured a photo of: {description}. Please acknowledge it briefly \
                 and ask me about the memory behind it."
                .to_string(),
        }
    }
}

const JPEG_QUALITY: u8 = 75;

struct CapturedObject {
    image: String,
    description: ObjectDescription,
}

/// One live-capture workflow instance. Exclusively owns the audio devices and
/// the camera it is given; two instances must not share hardware.
pub struct CaptureSessionController<S, F, A, M> {
    cfg: ControllerConfig,
    session: S,
    camera: F,
    analyzer: A,
    store: M,
    capture: AudioCapture,
    playback: Option<AudioPlayback>,
    sink_factory: SharedSinkFactory,
    chime: ToneChime,
    detector: StabilityDetector,
    phase: Phase,
    /// Set synchronously the instant the stability debounce fires, before
    /// the analysis call suspends, so a queued tick cannot capture twice.
    capture_in_progress: bool,
    captured: Option<CapturedObject>,
    transcript: String,
    session_id: Uuid,
    /// Closes the controller initiated itself; matching inbound `Closed`
    /// events are swallowed instead of treated as remote failures.
    expected_closes: u32,
    notices: mpsc::UnboundedSender<Notice>,
    mic_rx: Option<mpsc::UnboundedReceiver<MediaChunk>>,
    session_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl<S, F, A, M> CaptureSessionController<S, F, A, M>
where
    S: LiveSession,
    F: FrameSource,
    A: ObjectAnalyzer,
    M: MemoryStore,
{
    pub fn new(
        cfg: ControllerConfig,
        session: S,
        camera: F,
        analyzer: A,
        store: M,
        mic_factory: MicFactory,
        sink_factory: SharedSinkFactory,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let capture = AudioCapture::new(CaptureConfig::default(), mic_factory);
        let (mic_tx, mic_rx) = mpsc::unbounded_channel();
        let level_tx = notice_tx.clone();
        capture.on_chunk(Box::new(move |ev| {
            let CaptureEvent::Chunk { chunk, level } = ev;
            let _ = level_tx.send(Notice::InputLevel(*level));
            let _ = mic_tx.send(chunk.clone());
        }));

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        for kind in [
            SessionEventKind::Open,
            SessionEventKind::SetupComplete,
            SessionEventKind::Audio,
            SessionEventKind::Content,
            SessionEventKind::Interrupted,
            SessionEventKind::TurnComplete,
            SessionEventKind::Error,
            SessionEventKind::Closed,
        ] {
            let tx = session_tx.clone();
            session.on(
                kind,
                Box::new(move |ev| {
                    let _ = tx.send(ev.clone());
                }),
            );
        }

        let tone_factory = sink_factory.clone();
        let chime = ToneChime::new(Box::new(move || tone_factory()));

        let detector = StabilityDetector::new(cfg.stability.clone());
        let controller = Self {
            cfg,
            session,
            camera,
            analyzer,
            store,
            capture,
            playback: None,
            sink_factory,
            chime,
            detector,
            phase: Phase::Idle,
            capture_in_progress: false,
            captured: None,
            transcript: String::new(),
            session_id: Uuid::new_v4(),
            expected_closes: 0,
            notices: notice_tx,
            mic_rx: Some(mic_rx),
            session_rx: Some(session_rx),
        };
        (controller, notice_rx)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Event loop: user commands, the scan timer, microphone chunks, and
    /// inbound session events all land on this one task.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut mic_rx = self.mic_rx.take().expect("run called once");
        let mut session_rx = self.session_rx.take().expect("run called once");
        let mut ticker = tokio::time::interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.cancel().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
                Some(chunk) = mic_rx.recv() => self.on_mic_chunk(chunk).await,
                Some(ev) = session_rx.recv() => self.on_session_event(ev).await,
            }
        }
        info!("controller loop exited");
    }

    pub(crate) async fn handle_command(&mut self, cmd: Command) {
        match (cmd, self.phase) {
            (Command::Start, Phase::Idle) => self.start_workflow().await,
            (Command::Done, Phase::Recording) => self.finish().await,
            (Command::Cancel, Phase::Connecting | Phase::Scanning | Phase::Recording) => {
                self.cancel().await
            }
            (cmd, phase) => debug!("ignoring {cmd:?} in phase {phase:?}"),
        }
    }

    async fn start_workflow(&mut self) {
        self.set_phase(Phase::Connecting);
        self.session_id = Uuid::new_v4();
        self.reset_run_state();

        if let Err(e) = self.camera.open() {
            self.abort(format!("camera unavailable: {e}")).await;
            return;
        }
        if let Err(e) = self.capture.start() {
            self.abort(format!("microphone unavailable: {e}")).await;
            return;
        }
        match (self.sink_factory)() {
            Ok(sink) => {
                let playback = AudioPlayback::new(
                    PlaybackConfig::default(),
                    sink,
                    Arc::new(SystemClock::new()),
                );
                let out_tx = self.notices.clone();
                playback.on(
                    PlaybackEventKind::Level,
                    Box::new(move |ev| {
                        if let PlaybackEvent::Level(level) = ev {
                            let _ = out_tx.send(Notice::OutputLevel(*level));
                        }
                    }),
                );
                self.playback = Some(playback);
            }
            Err(e) => {
                self.abort(format!("audio output unavailable: {e}")).await;
                return;
            }
        }

        let mut session_cfg = self.cfg.session.clone();
        session_cfg.system_instruction = self.cfg.scan_instruction.clone();
        if let Err(e) = self.session.connect(&session_cfg).await {
            self.abort(format!("session connect failed: {e}")).await;
            return;
        }
        self.set_phase(Phase::Scanning);
    }

    /// One scan tick: push a preview frame to the session and feed the
    /// stability detector. Grabbing may fail while the camera warms up;
    /// a bad tick is skipped, never fatal.
    pub(crate) async fn on_tick(&mut self) {
        if self.phase != Phase::Scanning || self.capture_in_progress {
            return;
        }
        let frame = match self.camera.grab() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("frame grab skipped: {e}");
                return;
            }
        };

        match jpeg_b64(&preview(&frame, self.cfg.preview_width)) {
            Ok(data) => {
                self.session
                    .send_realtime_input(&[MediaChunk::jpeg(data)])
                    .await;
            }
            Err(e) => debug!("preview encode skipped: {e}"),
        }

        if self.detector.observe(&frame) {
            // From here until the analysis resolves, queued ticks bail out
            // at the top. At-most-once capture hangs on this flag.
            self.capture_in_progress = true;
            self.capture_object(frame).await;
        }
    }

    async fn capture_object(&mut self, frame: RgbImage) {
        info!("stability debounce fired, capturing");
        let image = match jpeg_b64(&frame) {
            Ok(image) => image,
            Err(e) => {
                warn!("capture frame encode failed: {e}");
                self.capture_in_progress = false;
                self.detector.reset();
                return;
            }
        };

        match self.analyzer.analyze(&image).await {
            Ok(description) => {
                self.chime.play_capture_tone();
                self.notify(Notice::Captured {
                    description: description.description.clone(),
                });
                self.captured = Some(CapturedObject { image, description });
                self.enter_recording().await;
            }
            Err(e) => {
                warn!("analysis failed, staying in scanning: {e}");
                self.notify(Notice::Error(format!("analysis failed: {e}")));
                self.capture_in_progress = false;
                self.detector.reset();
            }
        }
    }

    /// The protocol cannot change a session's system instruction mid-flight,
    /// so entering the recording phase reconnects with the conversation
    /// instruction and a synthetic trigger turn.
    async fn enter_recording(&mut self) {
        let description = self
            .captured
            .as_ref()
            .map(|c| c.description.description.clone())
            .unwrap_or_default();

        self.expected_closes += 1;
        self.session.disconnect().await;

        let mut session_cfg = self.cfg.session.clone();
        session_cfg.system_instruction = self
            .cfg
            .record_instruction
            .replace("{description}", &description);
        if let Err(e) = self.session.connect(&session_cfg).await {
            self.abort(format!("reconnect for recording failed: {e}"))
                .await;
            return;
        }
        self.set_phase(Phase::Recording);

        let trigger = self.cfg.trigger_text.replace("{description}", &description);
        if let Err(e) = self.session.send_text(&trigger).await {
            warn!("trigger turn failed: {e}");
        }
    }

    pub(crate) async fn on_mic_chunk(&mut self, chunk: MediaChunk) {
        if self.phase != Phase::Recording {
            return;
        }
        self.session.send_realtime_input(&[chunk]).await;
    }

    pub(crate) async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Audio(data) => {
                if matches!(self.phase, Phase::Scanning | Phase::Recording) {
                    if let Some(playback) = &mut self.playback {
                        playback.enqueue(&data);
                    }
                }
            }
            SessionEvent::Content(text) => {
                if self.phase != Phase::Recording {
                    return;
                }
                if let Some(memory) = extract_memory_text(&text) {
                    // The model re-streams its running transcription, so the
                    // newest extraction replaces the buffer wholesale.
                    self.transcript = memory.clone();
                    self.notify(Notice::Transcript(memory));
                }
            }
            SessionEvent::Interrupted => {
                if let Some(playback) = &mut self.playback {
                    playback.stop();
                }
            }
            SessionEvent::Closed => {
                if self.expected_closes > 0 {
                    self.expected_closes -= 1;
                    return;
                }
                if matches!(self.phase, Phase::Scanning | Phase::Recording) {
                    self.abort("session closed by remote".to_string()).await;
                }
            }
            SessionEvent::Error(message) => {
                if matches!(self.phase, Phase::Scanning | Phase::Recording) {
                    self.abort(format!("session error: {message}")).await;
                }
            }
            SessionEvent::Open | SessionEvent::SetupComplete | SessionEvent::TurnComplete => {
                debug!("session event: {event:?}");
            }
        }
    }

    /// Done path: resources come down before persistence is attempted, so a
    /// save can never hang on a still-open session.
    async fn finish(&mut self) {
        let Some(captured) = self.captured.take() else {
            self.cancel().await;
            return;
        };
        self.set_phase(Phase::Saving);
        self.teardown().await;

        let memory_text = if self.transcript.trim().is_empty() {
            self.cfg.placeholder_memory.clone()
        } else {
            self.transcript.clone()
        };
        let record = MemoryRecord::new(
            self.session_id,
            captured.image,
            captured.description.description,
            memory_text.clone(),
        );
        match self.store.insert(&record).await {
            Ok(()) => {
                info!("memory saved");
                self.notify(Notice::Saved { memory_text });
            }
            Err(e) => {
                warn!("persistence failed: {e}");
                self.notify(Notice::Error(format!("save failed: {e}")));
            }
        }

        self.reset_run_state();
        self.set_phase(Phase::Idle);
    }

    pub(crate) async fn cancel(&mut self) {
        if self.phase == Phase::Idle {
            return;
        }
        info!("workflow cancelled");
        self.teardown().await;
        self.reset_run_state();
        self.set_phase(Phase::Idle);
    }

    async fn abort(&mut self, message: String) {
        warn!("workflow aborted: {message}");
        self.notify(Notice::Error(message));
        self.teardown().await;
        self.reset_run_state();
        self.set_phase(Phase::Idle);
    }

    /// Producer before consumer, session before camera. The order is part of
    /// the contract: no component may outlive one it feeds.
    async fn teardown(&mut self) {
        self.capture.stop();
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        self.expected_closes += 1;
        self.session.disconnect().await;
        self.camera.close();
    }

    fn reset_run_state(&mut self) {
        self.capture_in_progress = false;
        self.captured = None;
        self.transcript.clear();
        self.detector.reset();
        self.expected_closes = 0;
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("phase {:?} -> {phase:?}", self.phase);
            self.phase = phase;
            self.notify(Notice::Phase(phase));
        }
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

/// Encode a frame as base64 JPEG.
fn jpeg_b64(frame: &RgbImage) -> Result<String> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(frame)
        .map_err(|e| LiveError::Decode(format!("jpeg encode: {e}")))?;
    Ok(BASE64.encode(&buf))
}

/// Downscale a frame for scan previews, preserving aspect ratio.
fn preview(frame: &RgbImage, max_width: u32) -> RgbImage {
    if frame.width() <= max_width {
        return frame.clone();
    }
    let height = (u64::from(frame.height()) * u64::from(max_width) / u64::from(frame.width()))
        .max(1) as u32;
    imageops::resize(frame, max_width, height, FilterType::Triangle)
}

/// Pull the memory transcript out of one content event.
///
/// The model is asked to embed `{"memory": "..."}` in its free-form text;
/// when that shape is present the structured value wins, otherwise the
/// trimmed plain text is a best-effort fallback. Empty text yields nothing.
fn extract_memory_text(text: &str) -> Option<String> {
    if let Some(key_pos) = text.find("\"memory\"") {
        if let Some(open) = text[..key_pos].rfind('{') {
            if let Some(object) = balanced_object(&text[open..]) {
                if let Ok(v) = serde_json::from_str::<Value>(object) {
                    if let Some(memory) = v.get("memory").and_then(Value::as_str) {
                        return Some(memory.to_string());
                    }
                }
            }
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Slice of `text` spanning one balanced `{...}` object starting at byte 0,
/// respecting string literals and escapes.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
