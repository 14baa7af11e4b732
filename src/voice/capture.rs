//! Audio capture from microphone

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Level reported for digital silence
pub const SILENCE_FLOOR_DB: f32 = -160.0;

/// Opens the microphone for one recording at a time
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Start a new recording
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` if microphone access is refused,
    /// or `Error::Audio` for device failures
    async fn start(&self) -> Result<Box<dyn Recording>>;
}

/// A live recording owned by exactly one capture
pub trait Recording: Send {
    /// Signal level of the audio captured since the previous call, in dBFS
    ///
    /// # Errors
    ///
    /// Returns error if the underlying stream has failed
    fn level_db(&mut self) -> Result<f32>;

    /// Stop recording and hand back everything captured
    ///
    /// # Errors
    ///
    /// Returns error if the stream could not be shut down cleanly
    fn stop(&mut self) -> Result<Vec<f32>>;

    /// Sample rate of the recorded audio
    fn sample_rate(&self) -> u32;
}

/// A finalized capture ready for transcription
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    captured_at: DateTime<Utc>,
    duration: Duration,
    speech_detected: bool,
}

impl AudioBuffer {
    /// Wrap captured samples
    #[must_use]
    pub fn new(
        samples: Vec<f32>,
        sample_rate: u32,
        captured_at: DateTime<Utc>,
        duration: Duration,
        speech_detected: bool,
    ) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            captured_at,
            duration,
            speech_detected,
        }
    }

    /// Raw mono samples in `[-1.0, 1.0]`
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// When recording started
    #[must_use]
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Wall-clock length of the capture
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether any metering sample crossed the speech threshold
    #[must_use]
    pub const fn speech_detected(&self) -> bool {
        self.speech_detected
    }

    /// True when no audio was recorded at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as 16-bit PCM WAV
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, self.sample_rate)
    }
}

/// Records from the default input device via `cpal`
///
/// `cpal` streams are not `Send`, so each recording owns a dedicated thread
/// that keeps the stream alive until the recording is stopped.
pub struct CpalRecorder {
    config: StreamConfig,
}

impl CpalRecorder {
    /// Query the default input device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| classify_device_error(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self { config })
    }
}

#[async_trait]
impl Recorder for CpalRecorder {
    async fn start(&self) -> Result<Box<dyn Recording>> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("hark-capture".to_string())
            .spawn({
                let config = self.config.clone();
                let buffer = Arc::clone(&buffer);
                let stop = Arc::clone(&stop);
                move || hold_input_stream(&config, buffer, &stop, ready_tx)
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("capture thread exited before starting".to_string()))??;

        tracing::debug!("audio capture started");

        Ok(Box::new(CpalRecording {
            buffer,
            cursor: 0,
            stop,
            thread: Some(thread),
            sample_rate: self.config.sample_rate.0,
        }))
    }
}

/// Open the input stream and keep it alive until `stop` is raised
fn hold_input_stream(
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    stop: &AtomicBool,
    ready: oneshot::Sender<Result<()>>,
) {
    let stream = match open_input_stream(config, buffer) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }

    while !stop.load(Ordering::Acquire) {
        std::thread::park_timeout(Duration::from_millis(50));
    }

    drop(stream);
    tracing::debug!("audio capture stopped");
}

fn open_input_stream(config: &StreamConfig, buffer: Arc<Mutex<Vec<f32>>>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device".to_string()))?;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| classify_device_error(e.to_string()))?;

    stream
        .play()
        .map_err(|e| classify_device_error(e.to_string()))?;

    Ok(stream)
}

/// Map a device error message onto the permission / transient split
fn classify_device_error(message: String) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        Error::PermissionDenied(message)
    } else {
        Error::Audio(message)
    }
}

/// A live `cpal` recording
struct CpalRecording {
    buffer: Arc<Mutex<Vec<f32>>>,
    cursor: usize,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl CpalRecording {
    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }
}

impl Recording for CpalRecording {
    fn level_db(&mut self) -> Result<f32> {
        let buf = self
            .buffer
            .lock()
            .map_err(|_| Error::Audio("capture buffer poisoned".to_string()))?;
        let fresh = buf.get(self.cursor..).unwrap_or_default();
        let level = rms_to_dbfs(calculate_rms(fresh));
        self.cursor = buf.len();
        drop(buf);
        Ok(level)
    }

    fn stop(&mut self) -> Result<Vec<f32>> {
        self.shutdown();
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .map_err(|_| Error::Audio("capture buffer poisoned".to_string()))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalRecording {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert an RMS amplitude to dBFS, floored at [`SILENCE_FLOOR_DB`]
#[must_use]
pub fn rms_to_dbfs(rms: f32) -> f32 {
    if rms <= 0.0 {
        return SILENCE_FLOOR_DB;
    }
    (20.0 * rms.log10()).max(SILENCE_FLOOR_DB)
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
