//! Observers notified of session transitions
//!
//! Observers only watch; they cannot force a transition.

use serde::Serialize;
use tokio::sync::broadcast;

use super::state::VoiceState;

/// One-shot user-facing notices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    /// Microphone access was refused; voice mode was turned off
    PermissionDenied,
    /// Audio was captured but could not be transcribed
    CouldNotUnderstand,
    /// The response pipeline failed or timed out
    ResponseFailed,
}

impl Notice {
    /// Text suitable for showing to the user
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Microphone access is needed for voice mode. Grant access and turn voice back on."
            }
            Self::CouldNotUnderstand => "Sorry, I couldn't understand that.",
            Self::ResponseFailed => "Sorry, something went wrong getting an answer.",
        }
    }
}

/// Receives state changes from the controller
pub trait SessionObserver: Send + Sync {
    /// Called once per transition with the state entered
    fn on_state(&self, state: VoiceState);

    /// Called for one-shot notices
    fn on_notice(&self, _notice: Notice) {}
}

/// Logs transitions and notices
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_state(&self, state: VoiceState) {
        tracing::info!(%state, "voice state");
    }

    fn on_notice(&self, notice: Notice) {
        tracing::warn!(?notice, message = notice.message(), "voice notice");
    }
}

/// Anything the controller reports to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A transition
    State(VoiceState),
    /// A notice
    Notice(Notice),
}

/// Fans session events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: broadcast::Sender<SessionEvent>,
}

impl ChannelObserver {
    /// Create with room for `capacity` unread events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events sent from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelObserver {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SessionObserver for ChannelObserver {
    fn on_state(&self, state: VoiceState) {
        // No subscribers is fine
        let _ = self.tx.send(SessionEvent::State(state));
    }

    fn on_notice(&self, notice: Notice) {
        let _ = self.tx.send(SessionEvent::Notice(notice));
    }
}
