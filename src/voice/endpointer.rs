//! Endpointing: decides when an utterance starts and ends
//!
//! The endpointer polls the recorder's signal level on a fixed interval. The
//! first reading above the speech threshold fires a one-shot speech-detected
//! event and arms the silence timer; each further reading above threshold
//! re-arms it. Capture is finalized when the silence timer runs out or the
//! maximum utterance length is reached.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::capture::{AudioBuffer, Recorder, Recording};
use crate::{Error, Result};

/// Endpointing thresholds and timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointerConfig {
    /// How often the signal level is sampled
    pub poll_interval: Duration,
    /// Level (dBFS) above which a reading counts as speech
    pub speech_threshold_db: f32,
    /// Quiet time after speech that ends the utterance
    pub silence_duration: Duration,
    /// Hard cap on a single capture
    pub max_duration: Duration,
}

impl Default for EndpointerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(150),
            speech_threshold_db: -50.0,
            silence_duration: Duration::from_millis(1500),
            max_duration: Duration::from_secs(30),
        }
    }
}

/// Why a capture was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Silence timer ran out after speech
    Silence,
    /// Maximum utterance length reached
    MaxDuration,
}

/// One signal-level reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalLevel {
    /// Level in dBFS
    pub db: f32,
    /// Reading is above the speech threshold
    pub is_speech: bool,
    /// First speech reading of this capture
    pub onset: bool,
}

/// Outcome of finalizing a capture
#[derive(Debug, Clone)]
pub enum Finalized {
    /// Audio ready for transcription
    Audio(AudioBuffer),
    /// The capture was cancelled before finalization
    Cancelled,
}

/// Events emitted by one capture cycle
#[derive(Debug)]
pub enum EndpointEvent {
    /// The first reading above threshold
    SpeechDetected {
        /// Level of the triggering reading
        level_db: f32,
    },
    /// The capture was finalized
    Captured(AudioBuffer),
    /// Recording could not start or broke mid-capture
    Failed(Error),
}

/// Exclusive owner of one in-flight recording
pub struct CaptureHandle {
    started_at: Instant,
    captured_at: DateTime<Utc>,
    metering: Vec<f32>,
    last_speech_at: Option<Instant>,
    recording: Option<Box<dyn Recording>>,
    outcome: Option<Finalized>,
}

impl CaptureHandle {
    fn new(recording: Box<dyn Recording>) -> Self {
        Self {
            started_at: Instant::now(),
            captured_at: Utc::now(),
            metering: Vec::new(),
            last_speech_at: None,
            recording: Some(recording),
            outcome: None,
        }
    }

    /// When recording began
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Every level reading so far, oldest first
    #[must_use]
    pub fn metering_samples(&self) -> &[f32] {
        &self.metering
    }

    /// Whether any reading crossed the speech threshold
    #[must_use]
    pub const fn speech_detected(&self) -> bool {
        self.last_speech_at.is_some()
    }

    /// Whether the microphone is still held by this handle
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.recording.is_some()
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("started_at", &self.started_at)
            .field("readings", &self.metering.len())
            .field("speech_detected", &self.speech_detected())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// Turns a [`Recorder`] into utterance-sized audio buffers
pub struct Endpointer {
    recorder: Arc<dyn Recorder>,
    config: EndpointerConfig,
}

impl Endpointer {
    /// Create an endpointer over `recorder`
    #[must_use]
    pub fn new(recorder: Arc<dyn Recorder>, config: EndpointerConfig) -> Self {
        Self { recorder, config }
    }

    /// Current thresholds
    #[must_use]
    pub const fn config(&self) -> &EndpointerConfig {
        &self.config
    }

    /// Start recording
    ///
    /// A transient failure is retried once with a fresh recording.
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` immediately, or the recorder error
    /// if the retry also fails
    pub async fn begin_capture(&self) -> Result<CaptureHandle> {
        match self.recorder.start().await {
            Ok(recording) => Ok(CaptureHandle::new(recording)),
            Err(e @ Error::PermissionDenied(_)) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "recorder failed to start, retrying once");
                let recording = self.recorder.start().await?;
                Ok(CaptureHandle::new(recording))
            }
        }
    }

    /// Take one level reading and update the silence timer
    ///
    /// # Errors
    ///
    /// Returns error if the handle is no longer live or the recording failed
    pub fn poll_signal_level(&self, handle: &mut CaptureHandle) -> Result<SignalLevel> {
        let recording = handle
            .recording
            .as_mut()
            .ok_or_else(|| Error::Audio("capture already finalized".to_string()))?;

        let db = recording.level_db()?;
        handle.metering.push(db);

        let is_speech = db > self.config.speech_threshold_db;
        let onset = is_speech && handle.last_speech_at.is_none();
        if is_speech {
            handle.last_speech_at = Some(Instant::now());
        }

        if onset {
            tracing::debug!(level_db = db, "speech detected");
        } else {
            tracing::trace!(level_db = db, is_speech, "signal level");
        }

        Ok(SignalLevel {
            db,
            is_speech,
            onset,
        })
    }

    /// Whether the capture should end now
    #[must_use]
    pub fn end_reason(&self, handle: &CaptureHandle, now: Instant) -> Option<EndReason> {
        if now.duration_since(handle.started_at) >= self.config.max_duration {
            return Some(EndReason::MaxDuration);
        }
        handle
            .last_speech_at
            .filter(|&at| now.duration_since(at) >= self.config.silence_duration)
            .map(|_| EndReason::Silence)
    }

    /// Stop recording and hand back the audio
    ///
    /// Idempotent: later calls return the same buffer, and a cancelled handle
    /// always yields `Cancelled`.
    pub fn finalize(&self, handle: &mut CaptureHandle) -> Finalized {
        if let Some(outcome) = &handle.outcome {
            return outcome.clone();
        }

        let Some(mut recording) = handle.recording.take() else {
            handle.outcome = Some(Finalized::Cancelled);
            return Finalized::Cancelled;
        };

        let sample_rate = recording.sample_rate();
        let samples = recording.stop().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to stop recording cleanly");
            Vec::new()
        });

        let buffer = AudioBuffer::new(
            samples,
            sample_rate,
            handle.captured_at,
            handle.started_at.elapsed(),
            handle.speech_detected(),
        );

        tracing::debug!(
            samples = buffer.samples().len(),
            readings = handle.metering.len(),
            speech_detected = buffer.speech_detected(),
            "capture finalized"
        );

        let outcome = Finalized::Audio(buffer);
        handle.outcome = Some(outcome.clone());
        outcome
    }

    /// Discard the capture without producing audio
    pub fn cancel(&self, handle: &mut CaptureHandle) {
        if handle.outcome.is_some() {
            return;
        }
        if let Some(mut recording) = handle.recording.take()
            && let Err(e) = recording.stop()
        {
            tracing::warn!(error = %e, "failed to stop cancelled recording");
        }
        handle.outcome = Some(Finalized::Cancelled);
        tracing::debug!("capture cancelled");
    }

    /// Run one full capture: start, meter, finalize
    ///
    /// Stops within one polling interval of `cancel` firing, discarding the
    /// audio. The sender is dropped when the cycle ends.
    pub async fn run_cycle(&self, events: mpsc::Sender<EndpointEvent>, cancel: CancellationToken) {
        let mut handle = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            started = self.begin_capture() => match started {
                Ok(handle) => handle,
                Err(e) => {
                    let _ = events.send(EndpointEvent::Failed(e)).await;
                    return;
                }
            },
        };

        let first_tick = Instant::now() + self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(first_tick, self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.cancel(&mut handle);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.poll_signal_level(&mut handle) {
                Ok(level) if level.onset => {
                    let _ = events
                        .send(EndpointEvent::SpeechDetected { level_db: level.db })
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "recording failed mid-capture");
                    self.cancel(&mut handle);
                    let _ = events.send(EndpointEvent::Failed(e)).await;
                    return;
                }
            }

            if let Some(reason) = self.end_reason(&handle, Instant::now()) {
                tracing::debug!(?reason, "end of utterance");
                if let Finalized::Audio(buffer) = self.finalize(&mut handle) {
                    let _ = events.send(EndpointEvent::Captured(buffer)).await;
                }
                return;
            }
        }
    }
}
