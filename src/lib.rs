//! hark - continuous voice-interaction engine
//!
//! This library turns a live microphone stream into a spoken conversation:
//! - Endpointing (speech onset, silence timer, maximum utterance length)
//! - Transcription through a pluggable speech-to-text backend
//! - Fuzzy wake-word matching on the transcript
//! - Reply generation through a response pipeline
//! - Synthesis and playback of the reply
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Voice Session Controller                │
//! │   state machine │ reentrancy guard │ backoff        │
//! └──────┬──────────────┬───────────────┬───────────────┘
//!        │              │               │
//! ┌──────▼──────┐ ┌─────▼──────┐ ┌──────▼──────┐
//! │ Endpointer  │ │ Wake Word  │ │   Speech    │
//! │ + Recorder  │ │  Matcher   │ │   Player    │
//! └──────┬──────┘ └────────────┘ └──────┬──────┘
//!        │                              │
//! ┌──────▼──────────┐  ┌──────────┐ ┌───▼─────────────┐
//! │ Transcription   │  │ Response │ │ Synthesizer     │
//! │ Client (STT)    │  │ Pipeline │ │ + Audio Sink    │
//! └─────────────────┘  └──────────┘ └─────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod daemon;
pub mod error;
pub mod history;
pub mod session;
pub mod voice;

pub use config::{Config, VoicePreferences};
pub use daemon::Daemon;
pub use error::{Error, ErrorKind, Result, TranscriptionFailure};
pub use session::{SessionConfig, SessionParts, VoiceSessionController, VoiceState};
