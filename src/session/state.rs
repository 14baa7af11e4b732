//! Session state and the reentrancy guard

use std::fmt;

use serde::Serialize;

/// Where the voice session is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    /// Voice mode is off; nothing is captured
    Disabled,
    /// Capturing, but only a wake word will be acted on
    WaitingForWakeWord,
    /// Capturing and ready for a request
    Available,
    /// Speech has been detected in the current capture
    Listening,
    /// Transcribed request is with the response pipeline
    Thinking,
    /// Reply is being spoken
    Saying,
}

impl VoiceState {
    /// States the session settles into between exchanges
    #[must_use]
    pub const fn is_resting(self) -> bool {
        matches!(self, Self::WaitingForWakeWord | Self::Available)
    }

    /// Stable lowercase name, used in logs and events
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::WaitingForWakeWord => "waiting_for_wake_word",
            Self::Available => "available",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Saying => "saying",
        }
    }
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a new capture was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Busy {
    /// Voice mode is off
    Disabled,
    /// A capture is already live
    Capturing,
    /// Transcription, the pipeline or playback is still running
    Processing,
}

/// Mutable session record, owned by the controller task
#[derive(Debug, Clone)]
pub struct VoiceSession {
    state: VoiceState,
    wake_word_required: bool,
    awake: bool,
    is_capturing: bool,
    is_processing: bool,
}

impl VoiceSession {
    /// A disabled session
    #[must_use]
    pub const fn new(wake_word_required: bool) -> Self {
        Self {
            state: VoiceState::Disabled,
            wake_word_required,
            awake: false,
            is_capturing: false,
            is_processing: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> VoiceState {
        self.state
    }

    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.is_capturing
    }

    /// Resting state for the current gating
    #[must_use]
    pub const fn rest_state(&self) -> VoiceState {
        if self.wake_word_required && !self.awake {
            VoiceState::WaitingForWakeWord
        } else {
            VoiceState::Available
        }
    }

    /// Turn voice on; returns the state entered
    pub const fn enable(&mut self) -> VoiceState {
        self.awake = false;
        self.is_capturing = false;
        self.is_processing = false;
        self.state = self.rest_state();
        self.state
    }

    /// Turn voice off and clear every flag
    pub const fn disable(&mut self) {
        self.state = VoiceState::Disabled;
        self.awake = false;
        self.is_capturing = false;
        self.is_processing = false;
    }

    /// Move to `to`; returns whether the state changed
    pub fn transition(&mut self, to: VoiceState) -> bool {
        if self.state == to {
            return false;
        }
        self.state = to;
        true
    }

    /// Claim the microphone for a new capture
    ///
    /// # Errors
    ///
    /// Returns why the capture may not start
    pub const fn try_begin_capture(&mut self) -> Result<(), Busy> {
        if matches!(self.state, VoiceState::Disabled) {
            return Err(Busy::Disabled);
        }
        if self.is_capturing {
            return Err(Busy::Capturing);
        }
        if self.is_processing {
            return Err(Busy::Processing);
        }
        self.is_capturing = true;
        Ok(())
    }

    /// The capture handed off or failed
    pub const fn end_capture(&mut self) {
        self.is_capturing = false;
    }

    /// Set the reentrancy guard before transcription
    ///
    /// # Errors
    ///
    /// Returns `Busy::Processing` if the guard is already held
    pub const fn begin_processing(&mut self) -> Result<(), Busy> {
        if self.is_processing {
            return Err(Busy::Processing);
        }
        self.is_processing = true;
        Ok(())
    }

    /// Clear the reentrancy guard
    pub const fn end_processing(&mut self) {
        self.is_processing = false;
    }

    /// The wake word was heard
    pub const fn mark_awake(&mut self) {
        self.awake = true;
    }

    pub const fn set_wake_word_required(&mut self, required: bool) {
        self.wake_word_required = required;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_respects_gating() {
        let mut gated = VoiceSession::new(true);
        assert_eq!(gated.enable(), VoiceState::WaitingForWakeWord);

        let mut open = VoiceSession::new(false);
        assert_eq!(open.enable(), VoiceState::Available);
    }

    #[test]
    fn test_wake_word_changes_rest_state() {
        let mut session = VoiceSession::new(true);
        session.enable();
        session.mark_awake();
        assert_eq!(session.rest_state(), VoiceState::Available);

        session.disable();
        assert_eq!(session.enable(), VoiceState::WaitingForWakeWord);
    }

    #[test]
    fn test_guard_rejects_restart_while_processing() {
        let mut session = VoiceSession::new(false);
        assert_eq!(session.try_begin_capture(), Err(Busy::Disabled));

        session.enable();
        assert_eq!(session.try_begin_capture(), Ok(()));
        assert_eq!(session.try_begin_capture(), Err(Busy::Capturing));

        session.end_capture();
        session.begin_processing().unwrap();
        assert_eq!(session.try_begin_capture(), Err(Busy::Processing));
        assert_eq!(session.begin_processing(), Err(Busy::Processing));

        session.end_processing();
        assert_eq!(session.try_begin_capture(), Ok(()));
    }

    #[test]
    fn test_disable_clears_guard() {
        let mut session = VoiceSession::new(false);
        session.enable();
        session.try_begin_capture().unwrap();
        session.begin_processing().unwrap();
        session.disable();
        assert!(!session.is_capturing());
        assert_eq!(session.state(), VoiceState::Disabled);

        session.enable();
        assert_eq!(session.begin_processing(), Ok(()));
    }

    #[test]
    fn test_transition_reports_change() {
        let mut session = VoiceSession::new(false);
        session.enable();
        assert!(!session.transition(VoiceState::Available));
        assert!(session.transition(VoiceState::Listening));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VoiceState::WaitingForWakeWord.to_string(), "waiting_for_wake_word");
        assert!(VoiceState::Available.is_resting());
        assert!(!VoiceState::Saying.is_resting());
    }
}
