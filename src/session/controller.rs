//! Voice session controller
//!
//! A single tokio task owns the [`VoiceSession`] and every transition.
//! Capture cycles, transcription, pipeline calls and playback run as worker
//! tasks that report back over an event channel. Each worker and restart
//! timer is stamped with the session epoch; disabling bumps the epoch so
//! anything still in flight is ignored when it reports.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::observer::{Notice, SessionObserver};
use super::state::{Busy, VoiceSession, VoiceState};
use crate::agent::{ConversationContext, ResponsePipeline};
use crate::config::VoicePreferences;
use crate::history::ExchangeRepo;
use crate::voice::{
    EndpointEvent, Endpointer, PlaybackEvent, SpeechOptions, SpeechPlayer, TranscriptionClient,
    Utterance, WakeWordMatcher,
};
use crate::{Error, ErrorKind, Result};

/// Controller timings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Dispatch words following the wake word as the request
    pub forward_wake_remainder: bool,

    /// Pause before re-arming capture after a normal outcome
    pub restart_delay: Duration,

    /// Retry delay when a restart finds the guard held
    pub busy_retry_delay: Duration,

    /// Delay growth after consecutive errors
    pub backoff: BackoffPolicy,

    /// Deadline for the response pipeline
    pub response_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            forward_wake_remainder: true,
            restart_delay: Duration::from_millis(500),
            busy_retry_delay: Duration::from_millis(750),
            backoff: BackoffPolicy::default(),
            response_timeout: Duration::from_secs(60),
        }
    }
}

/// Collaborators the controller drives
pub struct SessionParts {
    pub endpointer: Arc<Endpointer>,
    pub transcriber: Arc<TranscriptionClient>,
    pub matcher: Arc<WakeWordMatcher>,
    pub player: Arc<SpeechPlayer>,
    pub pipeline: Arc<dyn ResponsePipeline>,
    pub observer: Arc<dyn SessionObserver>,
    /// Where completed exchanges are persisted, if anywhere
    pub history: Option<ExchangeRepo>,
}

enum Command {
    Enable,
    Disable,
    Preferences(VoicePreferences),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session task
///
/// Dropping the handle ends the task once pending commands drain.
pub struct VoiceSessionController {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<VoiceState>,
    task: JoinHandle<()>,
}

impl VoiceSessionController {
    /// Spawn the controller task; the session starts `Disabled`
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        parts: SessionParts,
        config: SessionConfig,
        prefs: VoicePreferences,
        context: ConversationContext,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(32);
        let (snapshot, state) = watch::channel(VoiceState::Disabled);

        let task = SessionTask {
            session: VoiceSession::new(prefs.wake_word_enabled),
            parts,
            config,
            prefs,
            pending_prefs: None,
            context,
            epoch: 0,
            capture: None,
            draining: None,
            work: None,
            restart: None,
            speaking: None,
            failures: 0,
            events_tx,
            snapshot,
        };

        let task = tokio::spawn(task.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            state,
            task,
        }
    }

    /// Turn voice mode on
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the task has stopped
    pub async fn enable(&self) -> Result<()> {
        self.send(Command::Enable).await
    }

    /// Turn voice mode off, cancelling capture and playback
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the task has stopped
    pub async fn disable(&self) -> Result<()> {
        self.send(Command::Disable).await
    }

    /// Push new preferences
    ///
    /// Applied immediately while resting, otherwise at the next rest.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the task has stopped
    pub async fn update_preferences(&self, prefs: VoicePreferences) -> Result<()> {
        self.send(Command::Preferences(prefs)).await
    }

    /// Latest state
    #[must_use]
    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    /// Receiver that sees every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    /// Disable voice and wait for the task to finish
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "voice session task ended abnormally");
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

/// Worker output, stamped with the epoch it was started in
struct Envelope {
    epoch: u64,
    event: Event,
}

enum Event {
    Endpoint(EndpointEvent),
    CycleEnded,
    Transcribed(Result<Utterance>),
    Responded {
        request: String,
        reply: Result<String>,
    },
    Playback(PlaybackEvent),
    PlaybackClosed,
    RestartDue,
}

struct SessionTask {
    parts: SessionParts,
    config: SessionConfig,
    session: VoiceSession,
    prefs: VoicePreferences,
    pending_prefs: Option<VoicePreferences>,
    context: ConversationContext,
    epoch: u64,
    /// Cancels the live capture cycle
    capture: Option<CancellationToken>,
    /// A cancelled cycle still releasing the microphone
    draining: Option<JoinHandle<()>>,
    work: Option<JoinHandle<()>>,
    restart: Option<JoinHandle<()>>,
    /// Request and reply being spoken, recorded once playback starts
    speaking: Option<(String, String)>,
    failures: u32,
    events_tx: mpsc::Sender<Envelope>,
    snapshot: watch::Sender<VoiceState>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Envelope>,
    ) {
        tracing::debug!(session_id = %self.context.session_id, "voice session task started");

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Enable) => self.enable(),
                    Some(Command::Disable) => self.disable(),
                    Some(Command::Preferences(prefs)) => self.update_preferences(prefs),
                    Some(Command::Shutdown(ack)) => {
                        self.disable();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.disable();
                        break;
                    }
                },
                Some(envelope) = events.recv() => {
                    if envelope.epoch == self.epoch {
                        self.handle(envelope.event);
                    } else {
                        tracing::trace!(epoch = envelope.epoch, current = self.epoch, "dropping stale event");
                    }
                }
            }
        }

        tracing::debug!("voice session task stopped");
    }

    #[allow(clippy::too_many_lines)]
    fn handle(&mut self, event: Event) {
        match event {
            Event::Endpoint(EndpointEvent::SpeechDetected { level_db }) => {
                tracing::debug!(level_db, "speech onset");
                if self.session.state() == VoiceState::Available {
                    self.transition(VoiceState::Listening);
                }
            }
            Event::Endpoint(EndpointEvent::Captured(buffer)) => {
                self.session.end_capture();
                self.capture = None;

                if self.session.begin_processing().is_err() {
                    tracing::warn!("capture finished while still processing, dropping it");
                    self.settle(self.config.restart_delay);
                    return;
                }

                let client = Arc::clone(&self.parts.transcriber);
                let locale = self.prefs.locale.clone();
                self.spawn_work(async move {
                    Event::Transcribed(client.transcribe(&buffer, &locale).await)
                });
            }
            Event::Endpoint(EndpointEvent::Failed(e)) => {
                self.session.end_capture();
                self.capture = None;

                if e.kind() == ErrorKind::PermissionDenied {
                    self.permission_denied(&e);
                } else {
                    tracing::warn!(error = %e, "capture failed");
                    self.recover(e.kind());
                }
            }
            Event::CycleEnded => {
                // Cycle ended without handing anything off
                if self.session.is_capturing() {
                    self.session.end_capture();
                    self.capture = None;
                    self.settle(self.config.restart_delay);
                }
            }
            Event::Transcribed(Ok(utterance)) => {
                self.failures = 0;
                self.on_utterance(utterance);
            }
            Event::Transcribed(Err(e)) => {
                match &e {
                    Error::Transcription { cause, .. } if cause.is_user_facing() => {
                        tracing::warn!(error = %e, "transcription rejected");
                        self.parts.observer.on_notice(Notice::CouldNotUnderstand);
                    }
                    _ => tracing::warn!(error = %e, "transcription unavailable"),
                }
                self.recover(ErrorKind::Transcription);
            }
            Event::Responded { request, reply } => self.on_reply(request, reply),
            Event::Playback(PlaybackEvent::Started) => {
                if let Some((question, answer)) = self.speaking.take() {
                    self.record_exchange(&question, &answer);
                }
            }
            Event::Playback(PlaybackEvent::Finished) => {
                tracing::debug!("reply spoken");
                self.settle(self.config.restart_delay);
            }
            Event::Playback(PlaybackEvent::Failed(reason)) => {
                tracing::warn!(%reason, "could not speak reply");
                self.recover(ErrorKind::Playback);
            }
            Event::PlaybackClosed => {
                if self.session.state() == VoiceState::Saying {
                    tracing::debug!("playback ended without finishing");
                    self.settle(self.config.restart_delay);
                }
            }
            Event::RestartDue => {
                self.restart = None;
                self.start_capture();
            }
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        match self.session.state() {
            VoiceState::WaitingForWakeWord => {
                let wake = self.parts.matcher.matches(&utterance.text);
                if !wake.matched {
                    tracing::debug!(text = %utterance.text, "wake word not heard");
                    self.settle(self.config.restart_delay);
                    return;
                }

                tracing::info!(
                    kind = ?wake.kind,
                    confidence = wake.confidence,
                    remainder = %wake.remainder,
                    "wake word heard"
                );
                self.session.mark_awake();
                self.transition(VoiceState::Available);

                if self.config.forward_wake_remainder && !wake.remainder.is_empty() {
                    self.dispatch(wake.remainder);
                } else {
                    self.settle(self.config.restart_delay);
                }
            }
            VoiceState::Available | VoiceState::Listening => {
                if utterance.is_empty() {
                    tracing::debug!("empty utterance");
                    self.settle(self.config.restart_delay);
                } else {
                    self.dispatch(utterance.text);
                }
            }
            state => {
                tracing::warn!(%state, "utterance arrived in unexpected state");
                self.settle(self.config.restart_delay);
            }
        }
    }

    /// Hand a request to the response pipeline
    fn dispatch(&mut self, request: String) {
        if self.session.state() == VoiceState::Available {
            self.transition(VoiceState::Listening);
        }
        self.transition(VoiceState::Thinking);
        tracing::info!(%request, "dispatching request");

        let pipeline = Arc::clone(&self.parts.pipeline);
        let context = self.context.clone();
        let timeout = self.config.response_timeout;
        self.spawn_work(async move {
            let reply = tokio::time::timeout(timeout, pipeline.respond(&request, &context))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Response(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    )))
                });
            Event::Responded { request, reply }
        });
    }

    fn on_reply(&mut self, request: String, reply: Result<String>) {
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "response pipeline failed");
                self.parts.observer.on_notice(Notice::ResponseFailed);
                self.recover(ErrorKind::Response);
                return;
            }
        };

        if !self.prefs.speech_output {
            tracing::info!(%reply, "reply (speech output off)");
            self.record_exchange(&request, &reply);
            self.settle(self.config.restart_delay);
            return;
        }

        self.transition(VoiceState::Saying);

        let options = SpeechOptions {
            rate: self.prefs.playback_rate,
            locale: self.prefs.locale.clone(),
        };
        let mut playback = self.parts.player.speak(&reply, options);
        self.speaking = Some((request, reply));

        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        self.work = Some(tokio::spawn(async move {
            while let Some(event) = playback.recv().await {
                let event = Event::Playback(event);
                if tx.send(Envelope { epoch, event }).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Envelope {
                    epoch,
                    event: Event::PlaybackClosed,
                })
                .await;
        }));
    }

    fn start_capture(&mut self) {
        if self.draining.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("previous capture still releasing the microphone");
            self.schedule_restart(self.config.busy_retry_delay);
            return;
        }
        self.draining = None;

        match self.session.try_begin_capture() {
            Ok(()) => {}
            Err(Busy::Disabled) => return,
            Err(busy) => {
                tracing::debug!(?busy, "restart refused, retrying");
                self.schedule_restart(self.config.busy_retry_delay);
                return;
            }
        }

        let cancel = CancellationToken::new();
        self.capture = Some(cancel.clone());

        let endpointer = Arc::clone(&self.parts.endpointer);
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        self.work = Some(tokio::spawn(async move {
            let (cycle_tx, mut cycle_rx) = mpsc::channel(4);
            let forward = async {
                while let Some(event) = cycle_rx.recv().await {
                    let event = Event::Endpoint(event);
                    if tx.send(Envelope { epoch, event }).await.is_err() {
                        break;
                    }
                }
            };
            tokio::join!(endpointer.run_cycle(cycle_tx, cancel), forward);
            let _ = tx
                .send(Envelope {
                    epoch,
                    event: Event::CycleEnded,
                })
                .await;
        }));

        tracing::debug!(state = %self.session.state(), "capture started");
    }

    /// Run `work` and deliver its event under the current epoch
    fn spawn_work<F>(&mut self, work: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        self.work = Some(tokio::spawn(async move {
            let event = work.await;
            let _ = tx.send(Envelope { epoch, event }).await;
        }));
    }

    fn schedule_restart(&mut self, delay: Duration) {
        if self.session.state() == VoiceState::Disabled || self.restart.is_some() {
            return;
        }

        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        self.restart = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(Envelope {
                    epoch,
                    event: Event::RestartDue,
                })
                .await;
        }));
    }

    /// Return to rest and re-arm capture after `delay`
    fn settle(&mut self, delay: Duration) {
        self.session.end_processing();
        self.speaking = None;
        self.work = None;

        if let Some(prefs) = self.pending_prefs.take() {
            self.apply_preferences(prefs);
        }

        let rest = self.session.rest_state();
        self.transition(rest);
        self.schedule_restart(delay);
    }

    /// Log-and-continue path for recoverable errors
    fn recover(&mut self, kind: ErrorKind) {
        self.failures = self.failures.saturating_add(1);

        let delay = self.config.backoff.delay_after(self.failures);
        tracing::debug!(
            ?kind,
            failures = self.failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "backing off before next capture"
        );
        self.settle(delay);
    }

    fn permission_denied(&mut self, error: &Error) {
        tracing::error!(error = %error, "microphone access denied, turning voice off");
        self.parts.observer.on_notice(Notice::PermissionDenied);
        self.disable();
    }

    fn record_exchange(&mut self, question: &str, answer: &str) {
        self.context.record_exchange(question, answer);

        let Some(repo) = self.parts.history.clone() else {
            return;
        };
        let session_id = self.context.session_id.clone();
        let metadata = self.context.metadata();
        let question = question.to_string();
        let answer = answer.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = repo.record(&session_id, &question, &answer, &metadata) {
                tracing::warn!(error = %e, "failed to persist exchange");
            }
        });
    }

    fn enable(&mut self) {
        if self.session.state() != VoiceState::Disabled {
            tracing::debug!(state = %self.session.state(), "voice already enabled");
            return;
        }

        if let Some(prefs) = self.pending_prefs.take() {
            self.apply_preferences(prefs);
        }
        self.failures = 0;

        let state = self.session.enable();
        self.announce(state);
        self.start_capture();
    }

    fn disable(&mut self) {
        if self.session.state() == VoiceState::Disabled {
            return;
        }

        self.epoch = self.epoch.wrapping_add(1);

        if let Some(cancel) = self.capture.take() {
            // The cycle stops within one poll and releases the microphone
            cancel.cancel();
            self.draining = self.work.take();
        } else if let Some(work) = self.work.take() {
            work.abort();
        }
        if let Some(restart) = self.restart.take() {
            restart.abort();
        }
        self.parts.player.stop();
        self.speaking = None;

        self.session.disable();
        self.announce(VoiceState::Disabled);

        if let Some(prefs) = self.pending_prefs.take() {
            self.apply_preferences(prefs);
        }
    }

    fn update_preferences(&mut self, prefs: VoicePreferences) {
        if self.pending_prefs.is_none() && prefs == self.prefs {
            return;
        }

        let state = self.session.state();
        if state == VoiceState::Disabled {
            self.apply_preferences(prefs);
        } else if state.is_resting() {
            let gating_changed = prefs.wake_word_enabled != self.prefs.wake_word_enabled;
            self.apply_preferences(prefs);
            let rest = self.session.rest_state();
            self.transition(rest);
            if gating_changed {
                self.restart_capture();
            }
        } else {
            tracing::debug!(%state, "deferring preferences until the session rests");
            self.pending_prefs = Some(prefs);
        }
    }

    /// Abandon the live capture and listen again under the current gating
    fn restart_capture(&mut self) {
        let Some(cancel) = self.capture.take() else {
            return;
        };

        tracing::debug!("gating changed, restarting capture");
        self.epoch = self.epoch.wrapping_add(1);
        cancel.cancel();
        self.draining = self.work.take();
        if let Some(restart) = self.restart.take() {
            restart.abort();
        }
        self.session.end_capture();
        self.start_capture();
    }

    fn apply_preferences(&mut self, prefs: VoicePreferences) {
        tracing::info!(
            wake_word_enabled = prefs.wake_word_enabled,
            playback_rate = prefs.playback_rate,
            locale = %prefs.locale,
            speech_output = prefs.speech_output,
            "voice preferences applied"
        );
        self.session.set_wake_word_required(prefs.wake_word_enabled);
        self.context.user.locale.clone_from(&prefs.locale);
        self.prefs = prefs;
    }

    fn transition(&mut self, to: VoiceState) {
        let from = self.session.state();
        if self.session.transition(to) {
            tracing::debug!(%from, %to, "transition");
            self.announce(to);
        }
    }

    fn announce(&self, state: VoiceState) {
        self.snapshot.send_replace(state);
        self.parts.observer.on_state(state);
    }
}
