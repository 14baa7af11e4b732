//! Voice processing module
//!
//! Capture and endpointing on the way in, wake-word matching on the
//! transcript, synthesis and playback on the way out. Device and vendor
//! access sits behind the [`Recorder`], [`Transcriber`], [`Synthesizer`] and
//! [`AudioSink`] traits so the session can run without hardware.

mod capture;
mod endpointer;
mod playback;
mod player;
mod stt;
mod tts;
mod wake_word;

pub use capture::{
    AudioBuffer, CpalRecorder, Recorder, Recording, SAMPLE_RATE, SILENCE_FLOOR_DB,
    calculate_rms, rms_to_dbfs, samples_to_wav,
};
pub use endpointer::{
    CaptureHandle, EndReason, EndpointEvent, Endpointer, EndpointerConfig, Finalized, SignalLevel,
};
pub use playback::{AudioSink, CpalSink, PLAYBACK_SAMPLE_RATE, decode_mp3};
pub use player::{DEFAULT_SYNTHESIS_TIMEOUT, PlaybackEvent, SpeechPlayer};
pub use stt::{
    DEFAULT_TRANSCRIPTION_TIMEOUT, SpeechToText, SttProvider, Transcriber, TranscriptionClient,
    Utterance, language_hint, normalize_transcript,
};
pub use tts::{
    MAX_SPEED, MIN_SPEED, SpeechOptions, Synthesizer, TextToSpeech, TtsProvider, clamp_speed,
};
pub use wake_word::{
    Anchor, MatchKind, PhoneticRule, WakeWordMatch, WakeWordMatcher, edit_distance, matches,
};
