//! Configuration management
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file,
//! environment variables, then command-line flags (applied by the binary).

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::session::{BackoffPolicy, SessionConfig};
use crate::voice::{
    DEFAULT_SYNTHESIS_TIMEOUT, DEFAULT_TRANSCRIPTION_TIMEOUT, EndpointerConfig, MAX_SPEED,
    MIN_SPEED, PhoneticRule, SttProvider, TtsProvider,
};
use crate::{Error, Result};

use file::HarkConfigFile;

/// Default wake phrase
pub const DEFAULT_WAKE_WORD: &str = "hey mccarthy";

/// hark configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (history database)
    pub data_dir: PathBuf,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Endpointing thresholds
    pub endpointing: EndpointerConfig,

    /// Controller timings
    pub session: SessionConfig,

    /// Response pipeline
    pub assistant: AssistantConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Settings the user controls at runtime
///
/// Pushed to a running session with `update_preferences`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicePreferences {
    /// Require the wake word before acting on speech
    pub wake_word_enabled: bool,

    /// Speaking rate multiplier (0.25 to 4.0)
    pub playback_rate: f32,

    /// BCP-47 locale for recognition and speech
    pub locale: String,

    /// Speak replies aloud; when off replies are only recorded
    pub speech_output: bool,
}

impl Default for VoicePreferences {
    fn default() -> Self {
        Self {
            wake_word_enabled: true,
            playback_rate: 1.0,
            locale: "en-AU".to_string(),
            speech_output: true,
        }
    }
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Wake phrase
    pub wake_word: String,

    /// Extra phonetic confusion rules on top of the built-in ones
    pub phonetic_rules: Vec<PhoneticRule>,

    /// Runtime preferences
    pub preferences: VoicePreferences,

    /// STT backend
    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// TTS backend
    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1", "eleven_monolingual_v1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// Deadline for one transcription
    pub transcription_timeout: Duration,

    /// Deadline for one synthesis request
    pub synthesis_timeout: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            wake_word: DEFAULT_WAKE_WORD.to_string(),
            phonetic_rules: Vec::new(),
            preferences: VoicePreferences::default(),
            stt_provider: SttProvider::Whisper,
            stt_model: "whisper-1".to_string(),
            tts_provider: TtsProvider::OpenAI,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            transcription_timeout: DEFAULT_TRANSCRIPTION_TIMEOUT,
            synthesis_timeout: DEFAULT_SYNTHESIS_TIMEOUT,
        }
    }
}

/// Response pipeline configuration
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Name the assistant answers to
    pub name: String,

    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Chat model identifier
    pub model: String,

    /// Max tokens per reply
    pub max_tokens: u32,

    /// Overrides the generated system prompt
    pub system_prompt: Option<String>,

    /// Conversation turns sent with each request
    pub history_turns: usize,

    /// IANA timezone name shared with the model
    pub timezone: String,

    /// Free-form location shared with the model
    pub location: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: "McCarthy".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 300,
            system_prompt: None,
            history_turns: crate::agent::DEFAULT_HISTORY_TURNS,
            timezone: "UTC".to_string(),
            location: None,
        }
    }
}

impl AssistantConfig {
    /// The system prompt sent with every request
    #[must_use]
    pub fn system_prompt(&self) -> String {
        self.system_prompt.clone().unwrap_or_else(|| {
            format!(
                "You are {}, a voice assistant. Your replies are spoken aloud, so keep them \
                 short and conversational and avoid markdown, lists and URLs.",
                self.name
            )
        })
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (for Whisper, TTS and the default chat endpoint)
    pub openai: Option<SecretString>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<SecretString>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<SecretString>,

    /// Key for the chat endpoint when it is not `OpenAI`
    pub llm: Option<SecretString>,
}

impl ApiKeys {
    /// Key used for the chat endpoint
    #[must_use]
    pub fn chat_key(&self) -> Option<SecretString> {
        self.llm.clone().or_else(|| self.openai.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            voice: VoiceConfig::default(),
            endpointing: EndpointerConfig::default(),
            session: SessionConfig::default(),
            assistant: AssistantConfig::default(),
            api_keys: ApiKeys::default(),
        }
    }
}

/// Default data directory: `~/.local/share/hark` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from(".hark"), |d| d.data_dir().join("hark"))
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file and an environment lookup over the defaults
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or the result is invalid
    #[allow(clippy::too_many_lines)]
    pub fn resolve(fc: HarkConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let ms = Duration::from_millis;

        // API keys (env > toml > None)
        let secret = |var: &str, file_value: Option<String>| {
            env(var)
                .or(file_value)
                .filter(|k| !k.is_empty())
                .map(SecretString::from)
        };
        let api_keys = ApiKeys {
            openai: secret("OPENAI_API_KEY", fc.api_keys.openai),
            deepgram: secret("DEEPGRAM_API_KEY", fc.api_keys.deepgram),
            elevenlabs: secret("ELEVENLABS_API_KEY", fc.api_keys.elevenlabs),
            llm: secret("HARK_LLM_API_KEY", fc.api_keys.llm),
        };

        let parse_env = |var: &str| -> Result<Option<u64>> {
            env(var)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| Error::Config(format!("{var}: {e}")))
                })
                .transpose()
        };

        // Voice (env > toml > default)
        let fv = fc.voice;
        let preferences = VoicePreferences {
            wake_word_enabled: fv
                .wake_word_enabled
                .unwrap_or(defaults.voice.preferences.wake_word_enabled),
            playback_rate: fv
                .playback_rate
                .unwrap_or(defaults.voice.preferences.playback_rate),
            locale: env("HARK_LOCALE")
                .or(fv.locale)
                .unwrap_or(defaults.voice.preferences.locale),
            speech_output: fv
                .speech_output
                .unwrap_or(defaults.voice.preferences.speech_output),
        };

        let stt_provider = env("HARK_STT_PROVIDER")
            .map(|p| p.parse::<SttProvider>())
            .transpose()?
            .or(fv.stt_provider)
            .unwrap_or(defaults.voice.stt_provider);
        let tts_provider = env("HARK_TTS_PROVIDER")
            .map(|p| p.parse::<TtsProvider>())
            .transpose()?
            .or(fv.tts_provider)
            .unwrap_or(defaults.voice.tts_provider);

        let voice = VoiceConfig {
            wake_word: env("HARK_WAKE_WORD")
                .or(fv.wake_word)
                .unwrap_or(defaults.voice.wake_word),
            phonetic_rules: fv.phonetic_rules.unwrap_or_default(),
            preferences,
            stt_provider,
            stt_model: env("HARK_STT_MODEL").or(fv.stt_model).unwrap_or_else(|| {
                match stt_provider {
                    SttProvider::Whisper => defaults.voice.stt_model.clone(),
                    SttProvider::Deepgram => "nova-2".to_string(),
                }
            }),
            tts_provider,
            tts_model: env("HARK_TTS_MODEL").or(fv.tts_model).unwrap_or_else(|| {
                match tts_provider {
                    TtsProvider::OpenAI => defaults.voice.tts_model.clone(),
                    TtsProvider::ElevenLabs => "eleven_monolingual_v1".to_string(),
                }
            }),
            tts_voice: env("HARK_TTS_VOICE")
                .or(fv.tts_voice)
                .unwrap_or(defaults.voice.tts_voice),
            transcription_timeout: fv
                .transcription_timeout_ms
                .map_or(defaults.voice.transcription_timeout, ms),
            synthesis_timeout: fv
                .synthesis_timeout_ms
                .map_or(defaults.voice.synthesis_timeout, ms),
        };

        // Endpointing (env > toml > default)
        let fe = fc.endpointing;
        let endpointing = EndpointerConfig {
            poll_interval: fe
                .poll_interval_ms
                .map_or(defaults.endpointing.poll_interval, ms),
            speech_threshold_db: fe
                .speech_threshold_db
                .unwrap_or(defaults.endpointing.speech_threshold_db),
            silence_duration: parse_env("HARK_SILENCE_MS")?
                .or(fe.silence_ms)
                .map_or(defaults.endpointing.silence_duration, ms),
            max_duration: fe
                .max_duration_ms
                .map_or(defaults.endpointing.max_duration, ms),
        };

        let fs = fc.session;
        let session = SessionConfig {
            forward_wake_remainder: fv
                .forward_wake_remainder
                .unwrap_or(defaults.session.forward_wake_remainder),
            restart_delay: fs
                .restart_delay_ms
                .map_or(defaults.session.restart_delay, ms),
            busy_retry_delay: fs
                .busy_retry_ms
                .map_or(defaults.session.busy_retry_delay, ms),
            backoff: BackoffPolicy {
                base_delay: fs
                    .backoff_base_ms
                    .map_or(defaults.session.backoff.base_delay, ms),
                max_delay: fs
                    .backoff_max_ms
                    .map_or(defaults.session.backoff.max_delay, ms),
            },
            response_timeout: fs
                .response_timeout_ms
                .map_or(defaults.session.response_timeout, ms),
        };

        let fa = fc.assistant;
        let assistant = AssistantConfig {
            name: fa.name.unwrap_or(defaults.assistant.name),
            base_url: env("HARK_LLM_URL")
                .or(fa.base_url)
                .unwrap_or(defaults.assistant.base_url),
            model: env("HARK_LLM_MODEL")
                .or(fa.model)
                .unwrap_or(defaults.assistant.model),
            max_tokens: fa.max_tokens.unwrap_or(defaults.assistant.max_tokens),
            system_prompt: fa.system_prompt,
            history_turns: fa.history_turns.unwrap_or(defaults.assistant.history_turns),
            timezone: env("HARK_TIMEZONE")
                .or_else(|| env("TZ"))
                .or(fa.timezone)
                .unwrap_or(defaults.assistant.timezone),
            location: fa.location,
        };

        let data_dir = env("HARK_DATA_DIR")
            .or(fc.data_dir)
            .map_or(defaults.data_dir, PathBuf::from);

        let config = Self {
            data_dir,
            voice,
            endpointing,
            session,
            assistant,
            api_keys,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.voice.wake_word.trim().is_empty() {
            return Err(Error::Config("wake word must not be empty".to_string()));
        }

        let rate = self.voice.preferences.playback_rate;
        if !(MIN_SPEED..=MAX_SPEED).contains(&rate) {
            return Err(Error::Config(format!(
                "playback rate {rate} outside {MIN_SPEED}..={MAX_SPEED}"
            )));
        }

        if self.voice.preferences.locale.trim().is_empty() {
            return Err(Error::Config("locale must not be empty".to_string()));
        }

        let ep = &self.endpointing;
        if ep.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if ep.silence_duration < ep.poll_interval {
            return Err(Error::Config(
                "silence duration must be at least one poll interval".to_string(),
            ));
        }
        if ep.max_duration <= ep.silence_duration {
            return Err(Error::Config(
                "max utterance duration must exceed the silence duration".to_string(),
            ));
        }

        if self.session.backoff.max_delay < self.session.backoff.base_delay {
            return Err(Error::Config(
                "backoff cap must not be below the base delay".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the history database
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.db")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(HarkConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.voice.wake_word, DEFAULT_WAKE_WORD);
        assert!(config.voice.preferences.wake_word_enabled);
        assert_eq!(config.voice.preferences.locale, "en-AU");
        assert_eq!(config.endpointing.silence_duration, Duration::from_millis(1500));
        assert_eq!(config.session.busy_retry_delay, Duration::from_millis(750));
        assert_eq!(config.assistant.history_turns, 10);
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = file::parse_config(
            r#"
            [voice]
            wake_word = "hey orin"
            locale = "en-GB"

            [endpointing]
            silence_ms = 1200

            [api_keys]
            openai = "from-file"
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            fc,
            env_from(&[
                ("HARK_WAKE_WORD", "ok jarvis"),
                ("HARK_SILENCE_MS", "900"),
                ("OPENAI_API_KEY", "from-env"),
            ]),
        )
        .unwrap();

        assert_eq!(config.voice.wake_word, "ok jarvis");
        assert_eq!(config.voice.preferences.locale, "en-GB");
        assert_eq!(config.endpointing.silence_duration, Duration::from_millis(900));
        assert_eq!(
            config.api_keys.openai.as_ref().unwrap().expose_secret(),
            "from-env"
        );
    }

    #[test]
    fn test_provider_specific_model_defaults() {
        let config = Config::resolve(
            HarkConfigFile::default(),
            env_from(&[("HARK_STT_PROVIDER", "deepgram"), ("HARK_TTS_PROVIDER", "elevenlabs")]),
        )
        .unwrap();
        assert_eq!(config.voice.stt_model, "nova-2");
        assert_eq!(config.voice.tts_model, "eleven_monolingual_v1");
    }

    #[test]
    fn test_bad_env_values_are_rejected() {
        assert!(Config::resolve(HarkConfigFile::default(), env_from(&[("HARK_SILENCE_MS", "soon")])).is_err());
        assert!(Config::resolve(HarkConfigFile::default(), env_from(&[("HARK_STT_PROVIDER", "vosk")])).is_err());
    }

    #[test]
    fn test_empty_keys_are_ignored() {
        let config =
            Config::resolve(HarkConfigFile::default(), env_from(&[("OPENAI_API_KEY", "")])).unwrap();
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn test_chat_key_falls_back_to_openai() {
        let keys = ApiKeys {
            openai: Some(SecretString::from("sk-openai")),
            ..ApiKeys::default()
        };
        assert_eq!(keys.chat_key().unwrap().expose_secret(), "sk-openai");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.voice.preferences.playback_rate = 9.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.endpointing.silence_duration = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.voice.wake_word = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_system_prompt_uses_name() {
        let assistant = AssistantConfig {
            name: "Orin".to_string(),
            ..AssistantConfig::default()
        };
        assert!(assistant.system_prompt().starts_with("You are Orin"));
    }
}
