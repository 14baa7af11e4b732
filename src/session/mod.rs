//! Voice session: state machine, restart policy and observers

mod backoff;
mod controller;
mod observer;
mod state;

pub use backoff::{BackoffPolicy, delay_for_attempt};
pub use controller::{SessionConfig, SessionParts, VoiceSessionController};
pub use observer::{ChannelObserver, Notice, SessionEvent, SessionObserver, TracingObserver};
pub use state::{Busy, VoiceSession, VoiceState};
