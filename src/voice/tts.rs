//! Text-to-speech (TTS) processing

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Slowest speed the `OpenAI` speech endpoint accepts
pub const MIN_SPEED: f32 = 0.25;

/// Fastest speed the `OpenAI` speech endpoint accepts
pub const MAX_SPEED: f32 = 4.0;

/// Per-utterance speaking options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechOptions {
    /// Playback rate, 1.0 is normal speed
    pub rate: f32,
    /// BCP-47 locale of the reply
    pub locale: String,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            rate: 1.0,
            locale: "en-AU".to_string(),
        }
    }
}

/// Turns text into encoded (MP3) audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`
    ///
    /// # Errors
    ///
    /// Returns error if the service rejects the request or is unreachable
    async fn synthesize(&self, text: &str, options: &SpeechOptions) -> Result<Vec<u8>>;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// `OpenAI` speech endpoint
    #[default]
    OpenAI,
    /// `ElevenLabs`
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// HTTP text-to-speech backend
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    model: String,
    provider: TtsProvider,
    /// Set once the user has been told the backend ignores the playback rate
    rate_warned: AtomicBool,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: SecretString, voice: String, model: String) -> Result<Self> {
        Self::build(api_key, voice, model, TtsProvider::OpenAI)
    }

    /// Create a new TTS instance using `ElevenLabs`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: SecretString, voice_id: String, model: String) -> Result<Self> {
        Self::build(api_key, voice_id, model, TtsProvider::ElevenLabs)
    }

    fn build(
        api_key: SecretString,
        voice: String,
        model: String,
        provider: TtsProvider,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("API key required for {provider:?} TTS")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            model,
            provider,
            rate_warned: AtomicBool::new(false),
        })
    }

    /// Warn the first time a non-default rate is asked of a backend that has
    /// no speed control; returns whether this call warned
    fn warn_rate_ignored(&self, rate: f32) -> bool {
        if (rate - 1.0).abs() < f32::EPSILON || self.rate_warned.swap(true, Ordering::Relaxed) {
            return false;
        }
        tracing::warn!(
            provider = ?self.provider,
            rate,
            "speech backend has no speed control, playing at normal rate"
        );
        true
    }

    /// Synthesize using `OpenAI` TTS
    async fn synthesize_openai(&self, text: &str, options: &SpeechOptions) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: clamp_speed(options.rate),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    /// Synthesize using `ElevenLabs` TTS
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{}", self.voice);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, options: &SpeechOptions) -> Result<Vec<u8>> {
        tracing::debug!(
            provider = ?self.provider,
            chars = text.len(),
            rate = options.rate,
            "synthesizing reply"
        );

        match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text, options).await,
            TtsProvider::ElevenLabs => {
                self.warn_rate_ignored(options.rate);
                self.synthesize_elevenlabs(text).await
            }
        }
    }
}

/// Clamp a playback rate into the range the speech endpoint accepts
#[must_use]
pub fn clamp_speed(rate: f32) -> f32 {
    if rate.is_finite() {
        rate.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}
