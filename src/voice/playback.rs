//! Audio playback to speakers

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Plays encoded audio until it ends or `cancel` fires
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play MP3 bytes to completion
    ///
    /// Returns `Ok(())` both when playback finishes and when it is cancelled.
    ///
    /// # Errors
    ///
    /// Returns error if decoding or the output device fails
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<()>;
}

/// Plays audio to the default output device
pub struct CpalSink {
    config: StreamConfig,
}

impl CpalSink {
    /// Query the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let rate_fits = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| rate_fits(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| rate_fits(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }

    /// Play raw mono samples at [`PLAYBACK_SAMPLE_RATE`]
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    pub async fn play_samples(&self, samples: Vec<f32>, cancel: CancellationToken) -> Result<()> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || play_blocking(&config, samples, &cancel))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<()> {
        let (samples, sample_rate) = decode_mp3(&audio)?;
        let samples = if sample_rate == 0 || sample_rate == PLAYBACK_SAMPLE_RATE {
            samples
        } else {
            tracing::debug!(sample_rate, to = PLAYBACK_SAMPLE_RATE, "resampling reply audio");
            tokio::task::spawn_blocking(move || resample(&samples, sample_rate, PLAYBACK_SAMPLE_RATE))
                .await
                .map_err(|e| Error::Playback(format!("resample task failed: {e}")))??
        };
        self.play_samples(samples, cancel).await
    }
}

/// Drive an output stream until the samples run out or playback is cancelled
fn play_blocking(config: &StreamConfig, samples: Vec<f32>, cancel: &CancellationToken) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device".to_string()))?;

    let channels = usize::from(config.channels);
    let sample_count = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let stream_error = Arc::new(Mutex::new(None::<String>));

    let stream = device
        .build_output_stream(
            config,
            {
                let samples = Arc::clone(&samples);
                let position = Arc::clone(&position);
                let finished = Arc::clone(&finished);
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(pos).copied().unwrap_or_else(|| {
                            finished.store(true, Ordering::Release);
                            0.0
                        });
                        frame.fill(sample);
                        pos = (pos + 1).min(samples.len());
                    }
                    position.store(pos, Ordering::Relaxed);
                }
            },
            {
                let stream_error = Arc::clone(&stream_error);
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    if let Ok(mut slot) = stream_error.lock() {
                        *slot = Some(err.to_string());
                    }
                }
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
    let start = Instant::now();
    let timeout = Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::Acquire) {
        if cancel.is_cancelled() {
            tracing::debug!("playback cancelled");
            return Ok(());
        }
        if let Some(err) = stream_error.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(Error::Playback(err));
        }
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(100));

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");

    Ok(())
}

/// Decode MP3 bytes to mono f32 samples and the stream's sample rate
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

/// Resample mono audio between rates
///
/// The input is zero-padded to whole chunks plus one flush chunk so the tail
/// of the audio is not left inside the resampler.
///
/// # Errors
///
/// Returns error if the resampler rejects the rates
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    const CHUNK_SIZE: usize = 1024;
    const SUB_CHUNKS: usize = 2;

    if samples.is_empty() || from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, SUB_CHUNKS, 1)
            .map_err(|e| Error::Playback(format!("resampler init failed: {e}")))?;

    let mut input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let padded = input.len().div_ceil(CHUNK_SIZE) * CHUNK_SIZE + CHUNK_SIZE;
    input.resize(padded, 0.0);

    let mut output = Vec::with_capacity(padded * to_rate as usize / from_rate as usize);
    for chunk in input.chunks(CHUNK_SIZE) {
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| Error::Playback(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_input() {
        let (samples, rate) = decode_mp3(&[]).unwrap();
        assert!(samples.is_empty());
        assert_eq!(rate, 0);
    }

    #[test]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn test_resample_elevenlabs_rate_to_output_rate() {
        // One second of a 440 Hz tone at 44.1 kHz
        let input: Vec<f32> = (0..44_100)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44_100.0).sin() * 0.5)
            .collect();

        let output = resample(&input, 44_100, PLAYBACK_SAMPLE_RATE).unwrap();

        // About one second at the output rate, plus at most the padding
        let expected = PLAYBACK_SAMPLE_RATE as usize;
        assert!(output.len() >= expected, "too short: {}", output.len());
        assert!(output.len() <= expected + 2048, "too long: {}", output.len());
        assert!(output.iter().any(|s| s.abs() > 0.3));
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let input = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&input, PLAYBACK_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE).unwrap(), input);
    }

    #[test]
    fn test_play_nothing_returns_immediately() {
        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(PLAYBACK_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        play_blocking(&config, Vec::new(), &CancellationToken::new()).unwrap();
    }
}
