//! Speech-to-text (STT) processing

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::capture::AudioBuffer;
use crate::{Error, Result, TranscriptionFailure};

/// Default deadline for a transcription round-trip
pub const DEFAULT_TRANSCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Converts WAV audio into raw text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if the service rejects the request or is unreachable
    async fn transcribe(&self, wav: &[u8], locale: &str) -> Result<String>;
}

/// A recognized user utterance; empty text is a valid result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utterance {
    /// Normalized transcript
    pub text: String,
    /// When the audio was captured
    pub captured_at: DateTime<Utc>,
}

impl Utterance {
    /// Build an utterance from raw service output
    #[must_use]
    pub fn new(raw: &str, captured_at: DateTime<Utc>) -> Self {
        Self {
            text: normalize_transcript(raw),
            captured_at,
        }
    }

    /// Nothing was heard
    #[must_use]
    pub const fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            text: String::new(),
            captured_at,
        }
    }

    /// True when no speech was recognized
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Trim and collapse internal whitespace
#[must_use]
pub fn normalize_transcript(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Wraps a [`Transcriber`] with the deadline and soft-failure rules the
/// session relies on
pub struct TranscriptionClient {
    backend: Arc<dyn Transcriber>,
    timeout: Duration,
}

impl TranscriptionClient {
    /// Create a client around a backend
    #[must_use]
    pub fn new(backend: Arc<dyn Transcriber>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Transcribe a finalized capture
    ///
    /// Empty buffers, blank results and unreadable responses all resolve to an
    /// empty utterance.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` on timeout, transport or service failure
    pub async fn transcribe(&self, audio: &AudioBuffer, locale: &str) -> Result<Utterance> {
        let captured_at = audio.captured_at();

        if audio.is_empty() {
            tracing::debug!("empty capture, skipping transcription");
            return Ok(Utterance::empty(captured_at));
        }

        let wav = audio.to_wav().map_err(|e| Error::Transcription {
            reason: e.to_string(),
            cause: TranscriptionFailure::Rejected,
        })?;

        tracing::debug!(
            wav_bytes = wav.len(),
            duration_ms = u64::try_from(audio.duration().as_millis()).unwrap_or(u64::MAX),
            speech_detected = audio.speech_detected(),
            "sending capture for transcription"
        );

        let outcome = tokio::time::timeout(self.timeout, self.backend.transcribe(&wav, locale)).await;

        match outcome {
            Err(_) => Err(Error::Transcription {
                reason: format!("timed out after {}s", self.timeout.as_secs()),
                cause: TranscriptionFailure::Timeout,
            }),
            Ok(Ok(text)) => {
                let utterance = Utterance::new(&text, captured_at);
                if utterance.is_empty() {
                    tracing::debug!("transcription returned no speech");
                }
                Ok(utterance)
            }
            Ok(Err(e)) if is_unreadable_response(&e) => {
                tracing::warn!(error = %e, "unreadable transcription response, treating as silence");
                Ok(Utterance::empty(captured_at))
            }
            Ok(Err(e)) => Err(Error::Transcription {
                reason: e.to_string(),
                cause: failure_cause(&e),
            }),
        }
    }
}

/// Sort a backend error into timeout, transport or rejection
fn failure_cause(error: &Error) -> TranscriptionFailure {
    if error.is_timeout() {
        TranscriptionFailure::Timeout
    } else if error.is_transport() {
        TranscriptionFailure::Transport
    } else {
        TranscriptionFailure::Rejected
    }
}

fn is_unreadable_response(error: &Error) -> bool {
    match error {
        Error::Serialization(_) => true,
        Error::Http(e) => e.is_decode(),
        _ => false,
    }
}

/// Map a BCP-47 locale ("en-AU") onto the ISO-639-1 hint Whisper accepts
#[must_use]
pub fn language_hint(locale: &str) -> Option<String> {
    let lang = locale.split(['-', '_']).next()?.trim().to_lowercase();
    (lang.len() == 2 && lang.chars().all(|c| c.is_ascii_alphabetic())).then_some(lang)
}

/// Response from OpenAI Whisper transcription API
#[derive(Debug, serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// `OpenAI` Whisper
    #[default]
    Whisper,
    /// Deepgram
    Deepgram,
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// HTTP speech-to-text backend
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: SecretString, model: String) -> Result<Self> {
        Self::build(api_key, model, SttProvider::Whisper)
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: SecretString, model: String) -> Result<Self> {
        Self::build(api_key, model, SttProvider::Deepgram)
    }

    fn build(api_key: SecretString, model: String, provider: SttProvider) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("API key required for {provider:?} STT")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            provider,
        })
    }

    /// Transcribe using `OpenAI` Whisper
    async fn transcribe_whisper(&self, audio: &[u8], locale: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        if let Some(language) = language_hint(locale) {
            form = form.text("language", language);
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;

        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8], locale: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true&language={locale}",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();

        tracing::debug!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, wav: &[u8], locale: &str) -> Result<String> {
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav, locale).await,
            SttProvider::Deepgram => self.transcribe_deepgram(wav, locale).await,
        }
    }
}
