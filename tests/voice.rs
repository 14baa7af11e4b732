//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use hark::voice::{
    EndReason, Endpointer, EndpointerConfig, Finalized, MatchKind, SAMPLE_RATE, SILENCE_FLOOR_DB,
    WakeWordMatcher, calculate_rms, matches, rms_to_dbfs, samples_to_wav,
};

mod common;

use common::{ScriptedRecorder, StageMonitor, Take, generate_sine_samples};

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

#[test]
fn test_sine_is_speech_and_silence_is_not() {
    let threshold = EndpointerConfig::default().speech_threshold_db;

    let speech = generate_sine_samples(440.0, 0.15, 0.3, SAMPLE_RATE);
    assert!(rms_to_dbfs(calculate_rms(&speech)) > threshold);

    let whisper = generate_sine_samples(440.0, 0.15, 0.001, SAMPLE_RATE);
    assert!(rms_to_dbfs(calculate_rms(&whisper)) < threshold);

    let silence = generate_silence(0.15);
    assert!((rms_to_dbfs(calculate_rms(&silence)) - SILENCE_FLOOR_DB).abs() < f32::EPSILON);
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5, SAMPLE_RATE);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    // WAV header is 44 bytes
    assert!(wav_data.len() > 44);
}

#[test]
fn test_wav_keeps_format_and_length() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, SAMPLE_RATE).unwrap();

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
    assert_eq!(read_samples[3], i16::MAX);
}

#[test]
fn test_wake_word_matches_common_transcripts() {
    let matcher = WakeWordMatcher::new("Hey McCarthy");

    let hit = matcher.matches("Hey McCarthy, what's on my list?");
    assert!(hit.matched);
    assert_eq!(hit.kind, MatchKind::Exact);
    assert_eq!(hit.remainder, "what's on my list?");

    let fuzzy = matcher.matches("hey mccarty set a timer");
    assert!(fuzzy.matched);
    assert_ne!(fuzzy.kind, MatchKind::Exact);

    assert!(!matcher.matches("what's the weather").matched);
    assert!(!matcher.matches("").matched);
}

#[test]
fn test_free_function_matches_builds_matcher() {
    let m = matches("Hey Orin, what time is it?", "hey orin");
    assert!(m.matched);
    assert_eq!(m.remainder, "what time is it?");
}

#[tokio::test(start_paused = true)]
async fn test_endpointer_finalizes_after_silence() {
    let monitor = Arc::new(StageMonitor::default());
    let recorder = Arc::new(ScriptedRecorder::new(vec![Take::speech()], Arc::clone(&monitor)));
    let endpointer = Endpointer::new(recorder, EndpointerConfig::default());

    let mut handle = endpointer.begin_capture().await.unwrap();
    let mut reason = None;
    while reason.is_none() {
        tokio::time::sleep(Duration::from_millis(150)).await;
        endpointer.poll_signal_level(&mut handle).unwrap();
        reason = endpointer.end_reason(&handle, tokio::time::Instant::now());
    }

    assert_eq!(reason, Some(EndReason::Silence));
    assert!(handle.speech_detected());

    let Finalized::Audio(first) = endpointer.finalize(&mut handle) else {
        panic!("expected audio");
    };
    let Finalized::Audio(second) = endpointer.finalize(&mut handle) else {
        panic!("expected audio");
    };
    assert_eq!(first.samples(), second.samples());
    assert!(first.speech_detected());
    assert_eq!(monitor.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_endpointer_cancel_discards_audio() {
    let monitor = Arc::new(StageMonitor::default());
    let recorder = Arc::new(ScriptedRecorder::new(
        vec![Take::endless_speech()],
        Arc::clone(&monitor),
    ));
    let endpointer = Endpointer::new(recorder, EndpointerConfig::default());

    let mut handle = endpointer.begin_capture().await.unwrap();
    endpointer.poll_signal_level(&mut handle).unwrap();
    endpointer.cancel(&mut handle);

    assert!(matches!(endpointer.finalize(&mut handle), Finalized::Cancelled));
    assert!(!handle.is_live());
    assert_eq!(monitor.active(), 0);
}
