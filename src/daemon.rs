//! Daemon - wires the default audio devices and HTTP services into a voice
//! session and runs it until interrupted

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::agent::{ChatCompletionPipeline, ConversationContext, UserContext};
use crate::config::{Config, VoicePreferences};
use crate::history::{self, ExchangeRepo};
use crate::session::{
    ChannelObserver, SessionEvent, SessionObserver, SessionParts, TracingObserver,
    VoiceSessionController,
};
use crate::voice::{
    CpalRecorder, CpalSink, Endpointer, SpeechPlayer, SpeechToText, SttProvider, Synthesizer,
    TextToSpeech, Transcriber, TranscriptionClient, TtsProvider, WakeWordMatcher,
};
use crate::{Error, Result};

/// Preference values forced from the command line
///
/// Re-applied on every reload so the file cannot silently undo them.
#[derive(Debug, Clone, Default)]
pub struct PreferenceOverrides {
    pub wake_word_enabled: Option<bool>,
    pub playback_rate: Option<f32>,
    pub locale: Option<String>,
    pub speech_output: Option<bool>,
}

impl PreferenceOverrides {
    /// Overwrite the fields that were set on the command line
    pub fn apply(&self, prefs: &mut VoicePreferences) {
        if let Some(enabled) = self.wake_word_enabled {
            prefs.wake_word_enabled = enabled;
        }
        if let Some(rate) = self.playback_rate {
            prefs.playback_rate = rate;
        }
        if let Some(locale) = &self.locale {
            prefs.locale.clone_from(locale);
        }
        if let Some(speech_output) = self.speech_output {
            prefs.speech_output = speech_output;
        }
    }
}

/// The hark daemon
pub struct Daemon {
    config: Config,
    overrides: PreferenceOverrides,
    events_json: bool,
}

impl Daemon {
    /// Create a daemon
    ///
    /// `overrides` are applied on top of `config` now and after every reload.
    #[must_use]
    pub fn new(mut config: Config, overrides: PreferenceOverrides, events_json: bool) -> Self {
        overrides.apply(&mut config.voice.preferences);
        Self {
            config,
            overrides,
            events_json,
        }
    }

    /// Run the voice session until Ctrl-C or `quit` on stdin
    ///
    /// # Errors
    ///
    /// Returns error if an audio device or a required API key is missing
    pub async fn run(self) -> Result<()> {
        let config = &self.config;

        let recorder = Arc::new(CpalRecorder::new()?);
        let sink = Arc::new(CpalSink::new()?);

        let endpointer = Arc::new(Endpointer::new(recorder, config.endpointing.clone()));
        let transcriber = Arc::new(TranscriptionClient::new(
            build_transcriber(config)?,
            config.voice.transcription_timeout,
        ));
        let player = Arc::new(SpeechPlayer::new(
            build_synthesizer(config)?,
            sink,
            config.voice.synthesis_timeout,
        ));
        let matcher = Arc::new(
            WakeWordMatcher::new(&config.voice.wake_word)
                .with_rules(config.voice.phonetic_rules.iter().cloned()),
        );
        let pipeline = Arc::new(ChatCompletionPipeline::new(
            &config.assistant.base_url,
            config.api_keys.chat_key(),
            config.assistant.model.clone(),
            config.assistant.system_prompt(),
            config.assistant.max_tokens,
        ));

        let history = match history::init(config.history_path()) {
            Ok(pool) => Some(ExchangeRepo::new(pool)),
            Err(e) => {
                tracing::warn!(error = %e, "history unavailable, exchanges will not be saved");
                None
            }
        };

        let observer = Arc::new(ChannelObserver::default());
        let printer = spawn_event_printer(observer.subscribe(), self.events_json);

        let prefs = config.voice.preferences.clone();
        let user = UserContext {
            timezone: config.assistant.timezone.clone(),
            location: config.assistant.location.clone(),
            locale: prefs.locale.clone(),
        };
        let session_id = format!("hark-{}", uuid::Uuid::new_v4());
        let context = ConversationContext::new(session_id, user, config.assistant.history_turns);

        let parts = SessionParts {
            endpointer,
            transcriber,
            matcher,
            player,
            pipeline,
            observer: Arc::clone(&observer) as Arc<dyn SessionObserver>,
            history,
        };
        let controller =
            VoiceSessionController::spawn(parts, config.session.clone(), prefs.clone(), context);
        drop(observer);

        controller.enable().await?;

        if prefs.wake_word_enabled {
            tracing::info!("hark ready - say \"{}\"", config.voice.wake_word);
        } else {
            tracing::info!("hark ready (wake word off)");
        }

        let mut reload = ReloadSignal::new();
        let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("shutdown requested");
                    break;
                }
                () = reload.recv() => self.reload(&controller).await?,
                line = next_line(&mut stdin) => {
                    let Some(line) = line else { continue };
                    match line.trim() {
                        "enable" | "on" => controller.enable().await?,
                        "disable" | "off" => controller.disable().await?,
                        "status" => println!("{}", controller.state()),
                        "quit" | "exit" => break,
                        "" => {}
                        other => tracing::warn!(command = other, "unknown command (enable, disable, status, quit)"),
                    }
                }
            }
        }

        controller.shutdown().await;
        if let Err(e) = printer.await {
            tracing::debug!(error = %e, "event printer ended abnormally");
        }

        tracing::info!("daemon stopped");
        Ok(())
    }

    /// Re-read the config file and push new preferences to the session
    async fn reload(&self, controller: &VoiceSessionController) -> Result<()> {
        match Config::load() {
            Ok(fresh) => {
                let mut prefs = fresh.voice.preferences;
                self.overrides.apply(&mut prefs);
                tracing::info!("configuration reloaded");
                controller.update_preferences(prefs).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "reload failed, keeping current preferences");
                Ok(())
            }
        }
    }
}

/// Build the configured speech-to-text backend
///
/// # Errors
///
/// Returns `Error::Config` if the provider's API key is missing
pub fn build_transcriber(config: &Config) -> Result<Arc<dyn Transcriber>> {
    let model = config.voice.stt_model.clone();
    let stt = match config.voice.stt_provider {
        SttProvider::Whisper => {
            let key = config.api_keys.openai.clone().ok_or_else(|| {
                Error::Config("OPENAI_API_KEY is required for Whisper transcription".to_string())
            })?;
            SpeechToText::new_whisper(key, model)?
        }
        SttProvider::Deepgram => {
            let key = config.api_keys.deepgram.clone().ok_or_else(|| {
                Error::Config("DEEPGRAM_API_KEY is required for Deepgram transcription".to_string())
            })?;
            SpeechToText::new_deepgram(key, model)?
        }
    };
    tracing::debug!(provider = ?config.voice.stt_provider, model = %config.voice.stt_model, "speech-to-text ready");
    Ok(Arc::new(stt))
}

/// Build the configured text-to-speech backend
///
/// # Errors
///
/// Returns `Error::Config` if the provider's API key is missing
pub fn build_synthesizer(config: &Config) -> Result<Arc<dyn Synthesizer>> {
    let voice = config.voice.tts_voice.clone();
    let model = config.voice.tts_model.clone();
    let tts = match config.voice.tts_provider {
        TtsProvider::OpenAI => {
            let key = config.api_keys.openai.clone().ok_or_else(|| {
                Error::Config("OPENAI_API_KEY is required for OpenAI speech".to_string())
            })?;
            TextToSpeech::new_openai(key, voice, model)?
        }
        TtsProvider::ElevenLabs => {
            let key = config.api_keys.elevenlabs.clone().ok_or_else(|| {
                Error::Config("ELEVENLABS_API_KEY is required for ElevenLabs speech".to_string())
            })?;
            TextToSpeech::new_elevenlabs(key, voice, model)?
        }
    };
    tracing::debug!(provider = ?config.voice.tts_provider, model = %config.voice.tts_model, "text-to-speech ready");
    Ok(Arc::new(tts))
}

/// Log session events and optionally print them as JSON lines
fn spawn_event_printer(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    json: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let log = TracingObserver;
        loop {
            match events.recv().await {
                Ok(event) => {
                    match event {
                        SessionEvent::State(state) => log.on_state(state),
                        SessionEvent::Notice(notice) => log.on_notice(notice),
                    }
                    if json {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{line}"),
                            Err(e) => tracing::warn!(error = %e, "failed to encode event"),
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Next stdin line; stops polling stdin once it closes
async fn next_line(stdin: &mut Option<Lines<BufReader<Stdin>>>) -> Option<String> {
    let Some(lines) = stdin.as_mut() else {
        return std::future::pending().await;
    };
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            tracing::debug!("stdin closed, control commands disabled");
            *stdin = None;
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to read stdin");
            *stdin = None;
            None
        }
    }
}

/// SIGHUP on Unix; never fires elsewhere
struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let hangup = signal(SignalKind::hangup())
                .map_err(|e| tracing::warn!(error = %e, "SIGHUP reload unavailable"))
                .ok();
            Self { hangup }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(hangup) = self.hangup.as_mut()
            && hangup.recv().await.is_some()
        {
            return;
        }
        std::future::pending::<()>().await;
    }
}
