//! Shared test utilities
//!
//! Scripted stand-ins for the microphone, speech services, response pipeline
//! and speaker, plus a harness that wires them into a running controller.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use hark::agent::{ConversationContext, ResponsePipeline, UserContext};
use hark::config::VoicePreferences;
use hark::history::{self, ExchangeRepo};
use hark::session::{
    ChannelObserver, Notice, SessionConfig, SessionEvent, SessionObserver, SessionParts,
    VoiceSessionController, VoiceState,
};
use hark::voice::{
    AudioSink, Endpointer, EndpointerConfig, Recorder, Recording, SpeechOptions, SpeechPlayer,
    Synthesizer, Transcriber, TranscriptionClient, WakeWordMatcher,
};
use hark::{Error, Result};

/// Level reported once a scripted take runs out
pub const QUIET_DB: f32 = -90.0;

/// Loud enough to count as speech
pub const SPEECH_DB: f32 = -20.0;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32, rate: u32) -> Vec<f32> {
    let num_samples = (rate as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

// -- stage monitor ---------------------------------------------------------

/// Counts how many pipeline stages are active at once
#[derive(Debug, Default)]
pub struct StageMonitor {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl StageMonitor {
    pub fn enter(self: &Arc<Self>) -> StageGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        StageGuard(Arc::clone(self))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Leaves its stage on drop
pub struct StageGuard(Arc<StageMonitor>);

impl Drop for StageGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// -- recorder --------------------------------------------------------------

/// What one call to `Recorder::start` does
#[derive(Debug, Clone)]
pub enum Take {
    /// Report these levels, then quiet
    Levels(Vec<f32>),
    /// Report speech for this many polls, then lose the device
    Glitch(usize),
    /// Refuse microphone access
    PermissionDenied,
}

impl Take {
    /// A short burst of speech followed by quiet
    pub fn speech() -> Self {
        Self::Levels(vec![SPEECH_DB; 4])
    }

    /// Speech that outlasts any test
    pub fn endless_speech() -> Self {
        Self::Levels(vec![SPEECH_DB; 1000])
    }

    pub fn silence() -> Self {
        Self::Levels(Vec::new())
    }
}

/// Plays back scripted takes; quiet once the script runs out
pub struct ScriptedRecorder {
    takes: Mutex<VecDeque<Take>>,
    starts: Mutex<Vec<Instant>>,
    monitor: Arc<StageMonitor>,
}

impl ScriptedRecorder {
    pub fn new(takes: Vec<Take>, monitor: Arc<StageMonitor>) -> Self {
        Self {
            takes: Mutex::new(takes.into()),
            starts: Mutex::new(Vec::new()),
            monitor,
        }
    }

    /// How many recordings were opened
    pub fn starts(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    /// When each recording was opened
    pub fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }
}

impl ScriptedRecorder {
    fn open(&self, levels: Vec<f32>, fails_when_done: bool) -> Box<dyn Recording> {
        self.starts.lock().unwrap().push(Instant::now());
        Box::new(ScriptedRecording {
            levels: levels.into(),
            fails_when_done,
            heard_speech: false,
            stage: Some(self.monitor.enter()),
        })
    }
}

#[async_trait]
impl Recorder for ScriptedRecorder {
    async fn start(&self) -> Result<Box<dyn Recording>> {
        let take = self
            .takes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Take::silence);

        match take {
            Take::PermissionDenied => Err(Error::PermissionDenied("denied by test".to_string())),
            Take::Levels(levels) => Ok(self.open(levels, false)),
            Take::Glitch(polls) => Ok(self.open(vec![SPEECH_DB; polls], true)),
        }
    }
}

struct ScriptedRecording {
    levels: VecDeque<f32>,
    fails_when_done: bool,
    heard_speech: bool,
    stage: Option<StageGuard>,
}

impl Recording for ScriptedRecording {
    fn level_db(&mut self) -> Result<f32> {
        if self.levels.is_empty() && self.fails_when_done {
            return Err(Error::Audio("input device disconnected".to_string()));
        }
        let level = self.levels.pop_front().unwrap_or(QUIET_DB);
        if level > -50.0 {
            self.heard_speech = true;
        }
        Ok(level)
    }

    fn stop(&mut self) -> Result<Vec<f32>> {
        self.stage = None;
        let amplitude = if self.heard_speech { 0.3 } else { 0.0 };
        Ok(generate_sine_samples(220.0, 0.1, amplitude, hark::voice::SAMPLE_RATE))
    }

    fn sample_rate(&self) -> u32 {
        hark::voice::SAMPLE_RATE
    }
}

// -- transcriber -----------------------------------------------------------

/// What one transcription returns
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// The service answers with a refusal
    Fail(String),
    /// The service cannot be reached
    Unreachable,
    /// Never answers
    Hang,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Connection errors from a port nothing listens on
///
/// Must run before the clock is paused; `reqwest::Error` cannot be cloned, so
/// collect one per `Reply::Unreachable`.
pub async fn connect_errors(count: usize) -> Vec<reqwest::Error> {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let mut errors = Vec::with_capacity(count);
    for _ in 0..count {
        let err = client
            .post("http://127.0.0.1:9/v1/audio/transcriptions")
            .send()
            .await
            .expect_err("nothing listens on the discard port");
        assert!(err.is_connect(), "expected a connect error: {err}");
        errors.push(err);
    }
    errors
}

/// Answers from a script; empty text once it runs out
pub struct ScriptedTranscriber {
    replies: Mutex<VecDeque<Reply>>,
    outages: Mutex<Vec<reqwest::Error>>,
    calls: AtomicUsize,
    monitor: Arc<StageMonitor>,
}

impl ScriptedTranscriber {
    pub fn new(replies: Vec<Reply>, outages: Vec<reqwest::Error>, monitor: Arc<StageMonitor>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            outages: Mutex::new(outages),
            calls: AtomicUsize::new(0),
            monitor,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _wav: &[u8], _locale: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _stage = self.monitor.enter();
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::text(""));

        tokio::time::sleep(Duration::from_millis(300)).await;
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(reason) => Err(Error::Stt(reason)),
            Reply::Unreachable => {
                let err = self
                    .outages
                    .lock()
                    .unwrap()
                    .pop()
                    .expect("one connect error per unreachable reply");
                Err(Error::Http(err))
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

// -- response pipeline -----------------------------------------------------

/// Records requests and answers with a fixed reply
pub struct MockPipeline {
    reply: Option<String>,
    delay: Duration,
    requests: Mutex<Vec<String>>,
    monitor: Arc<StageMonitor>,
}

impl MockPipeline {
    pub fn new(reply: Option<&str>, delay: Duration, monitor: Arc<StageMonitor>) -> Self {
        Self {
            reply: reply.map(ToString::to_string),
            delay,
            requests: Mutex::new(Vec::new()),
            monitor,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponsePipeline for MockPipeline {
    async fn respond(&self, text: &str, _context: &ConversationContext) -> Result<String> {
        self.requests.lock().unwrap().push(text.to_string());
        let _stage = self.monitor.enter();
        tokio::time::sleep(self.delay).await;
        self.reply
            .clone()
            .ok_or_else(|| Error::Response("pipeline unavailable".to_string()))
    }
}

// -- speech output ---------------------------------------------------------

pub struct MockSynth {
    monitor: Arc<StageMonitor>,
    fails: bool,
}

#[async_trait]
impl Synthesizer for MockSynth {
    async fn synthesize(&self, text: &str, _options: &SpeechOptions) -> Result<Vec<u8>> {
        let _stage = self.monitor.enter();
        tokio::time::sleep(Duration::from_millis(100)).await;
        if self.fails {
            return Err(Error::Tts("OpenAI TTS error 500: upstream failure".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// "Plays" for a fixed time, honouring cancellation
pub struct MockSink {
    monitor: Arc<StageMonitor>,
    plays: AtomicUsize,
    fails: bool,
}

impl MockSink {
    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for MockSink {
    async fn play(&self, _audio: Vec<u8>, cancel: CancellationToken) -> Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        let _stage = self.monitor.enter();
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(Duration::from_millis(800)) => {}
        }
        if self.fails {
            return Err(Error::Playback("output device lost".to_string()));
        }
        Ok(())
    }
}

// -- harness ---------------------------------------------------------------

/// Everything a scenario can vary
pub struct Setup {
    pub takes: Vec<Take>,
    pub replies: Vec<Reply>,
    /// `None` makes the pipeline fail
    pub pipeline_reply: Option<&'static str>,
    pub pipeline_delay: Duration,
    pub prefs: VoicePreferences,
    pub transcription_timeout: Duration,
    /// Errors handed out for `Reply::Unreachable`
    pub outages: Vec<reqwest::Error>,
    pub synth_fails: bool,
    pub sink_fails: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            takes: Vec::new(),
            replies: Vec::new(),
            pipeline_reply: Some("Milk and eggs."),
            pipeline_delay: Duration::from_millis(200),
            prefs: VoicePreferences::default(),
            transcription_timeout: Duration::from_secs(5),
            outages: Vec::new(),
            synth_fails: false,
            sink_fails: false,
        }
    }
}

pub struct Harness {
    pub controller: VoiceSessionController,
    pub events: broadcast::Receiver<SessionEvent>,
    pub recorder: Arc<ScriptedRecorder>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub pipeline: Arc<MockPipeline>,
    pub sink: Arc<MockSink>,
    pub monitor: Arc<StageMonitor>,
    pub history: ExchangeRepo,
    pub session_id: String,
}

impl Harness {
    /// Spawn a controller (still disabled) around scripted parts
    pub fn start(setup: Setup) -> Self {
        let monitor = Arc::new(StageMonitor::default());

        let recorder = Arc::new(ScriptedRecorder::new(setup.takes, Arc::clone(&monitor)));
        let transcriber = Arc::new(ScriptedTranscriber::new(
            setup.replies,
            setup.outages,
            Arc::clone(&monitor),
        ));
        let pipeline = Arc::new(MockPipeline::new(
            setup.pipeline_reply,
            setup.pipeline_delay,
            Arc::clone(&monitor),
        ));
        let sink = Arc::new(MockSink {
            monitor: Arc::clone(&monitor),
            plays: AtomicUsize::new(0),
            fails: setup.sink_fails,
        });
        let synth = Arc::new(MockSynth {
            monitor: Arc::clone(&monitor),
            fails: setup.synth_fails,
        });

        let observer = Arc::new(ChannelObserver::new(256));
        let events = observer.subscribe();
        let history = ExchangeRepo::new(history::init_memory().expect("in-memory history"));

        let parts = SessionParts {
            endpointer: Arc::new(Endpointer::new(
                Arc::clone(&recorder) as Arc<dyn Recorder>,
                EndpointerConfig::default(),
            )),
            transcriber: Arc::new(TranscriptionClient::new(
                Arc::clone(&transcriber) as Arc<dyn Transcriber>,
                setup.transcription_timeout,
            )),
            matcher: Arc::new(WakeWordMatcher::new("hey mccarthy")),
            player: Arc::new(SpeechPlayer::new(synth, Arc::clone(&sink) as Arc<dyn AudioSink>, Duration::from_secs(5))),
            pipeline: Arc::clone(&pipeline) as Arc<dyn ResponsePipeline>,
            observer: observer as Arc<dyn SessionObserver>,
            history: Some(history.clone()),
        };

        let session_id = "test-session".to_string();
        let context = ConversationContext::new(session_id.clone(), UserContext::default(), 10);
        let controller =
            VoiceSessionController::spawn(parts, SessionConfig::default(), setup.prefs, context);

        Self {
            controller,
            events,
            recorder,
            transcriber,
            pipeline,
            sink,
            monitor,
            history,
            session_id,
        }
    }

    /// Next event, failing the test if none arrives in time
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(120), self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    /// Assert the next state changes, in order, ignoring notices
    pub async fn expect_states(&mut self, expected: &[VoiceState]) {
        for want in expected {
            loop {
                match self.next_event().await {
                    SessionEvent::State(state) => {
                        assert_eq!(state, *want, "unexpected transition");
                        break;
                    }
                    SessionEvent::Notice(_) => {}
                }
            }
        }
    }

    /// Assert the next events exactly
    pub async fn expect_events(&mut self, expected: &[SessionEvent]) {
        for want in expected {
            assert_eq!(self.next_event().await, *want);
        }
    }

    /// Collect notices seen until the session next rests
    pub async fn notices_until_rest(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        loop {
            match self.next_event().await {
                SessionEvent::Notice(notice) => notices.push(notice),
                SessionEvent::State(state) if state.is_resting() => return notices,
                SessionEvent::State(_) => {}
            }
        }
    }
}

/// Poll `condition` until it holds, failing after `limit`
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
