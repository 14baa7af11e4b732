//! TOML configuration file loading
//!
//! Supports `~/.config/hark/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.
//! Durations are given in milliseconds.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;
use crate::voice::{PhoneticRule, SttProvider, TtsProvider};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarkConfigFile {
    /// Where the history database lives
    pub data_dir: Option<String>,

    /// Wake word, speech services and user preferences
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Endpointing thresholds
    #[serde(default)]
    pub endpointing: EndpointingFileConfig,

    /// Restart and timeout timings
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Response pipeline
    #[serde(default)]
    pub assistant: AssistantFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Voice configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceFileConfig {
    /// Wake phrase (e.g. "hey mccarthy")
    pub wake_word: Option<String>,

    /// Require the wake word before acting on speech
    pub wake_word_enabled: Option<bool>,

    /// Treat words after the wake word as the request
    pub forward_wake_remainder: Option<bool>,

    /// Extra phonetic confusion rules for the wake word
    pub phonetic_rules: Option<Vec<PhoneticRule>>,

    /// Speaking rate multiplier
    pub playback_rate: Option<f32>,

    /// BCP-47 locale (e.g. "en-AU")
    pub locale: Option<String>,

    /// Speak replies aloud
    pub speech_output: Option<bool>,

    pub stt_provider: Option<SttProvider>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    pub tts_provider: Option<TtsProvider>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,

    pub transcription_timeout_ms: Option<u64>,

    pub synthesis_timeout_ms: Option<u64>,
}

/// Endpointing configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointingFileConfig {
    pub poll_interval_ms: Option<u64>,

    /// Speech threshold in dBFS
    pub speech_threshold_db: Option<f32>,

    pub silence_ms: Option<u64>,

    pub max_duration_ms: Option<u64>,
}

/// Session timing configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionFileConfig {
    pub restart_delay_ms: Option<u64>,

    pub busy_retry_ms: Option<u64>,

    pub backoff_base_ms: Option<u64>,

    pub backoff_max_ms: Option<u64>,

    pub response_timeout_ms: Option<u64>,
}

/// Response pipeline configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssistantFileConfig {
    /// Assistant name used in the default system prompt
    pub name: Option<String>,

    /// OpenAI-compatible base URL
    pub base_url: Option<String>,

    pub model: Option<String>,

    pub max_tokens: Option<u32>,

    /// Replaces the default system prompt entirely
    pub system_prompt: Option<String>,

    /// Conversation turns sent with each request
    pub history_turns: Option<usize>,

    /// IANA timezone name
    pub timezone: Option<String>,

    pub location: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
    pub llm: Option<String>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or has unknown keys
pub fn parse_config(content: &str) -> Result<HarkConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `HarkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HarkConfigFile {
    config_file_path().map_or_else(HarkConfigFile::default, |path| load_config_from(&path))
}

/// Load a config file from `path`, falling back to defaults
pub fn load_config_from(path: &Path) -> HarkConfigFile {
    if !path.exists() {
        return HarkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HarkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HarkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/hark/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hark").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::Anchor;

    #[test]
    fn test_parse_full_file() {
        let config = parse_config(
            r#"
            data_dir = "/tmp/hark"

            [voice]
            wake_word = "hey orin"
            wake_word_enabled = false
            locale = "en-GB"
            stt_provider = "deepgram"
            tts_provider = "elevenlabs"

            [[voice.phonetic_rules]]
            pattern = "oran"
            anchor = "prefix"
            confidence = 0.7

            [endpointing]
            silence_ms = 1200

            [session]
            backoff_max_ms = 5000

            [assistant]
            base_url = "http://localhost:11434/v1"
            history_turns = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir.as_deref(), Some("/tmp/hark"));
        assert_eq!(config.voice.wake_word_enabled, Some(false));
        assert_eq!(config.voice.stt_provider, Some(SttProvider::Deepgram));
        assert_eq!(config.voice.tts_provider, Some(TtsProvider::ElevenLabs));
        let rules = config.voice.phonetic_rules.unwrap();
        assert_eq!(rules[0].anchor, Anchor::Prefix);
        assert_eq!(config.endpointing.silence_ms, Some(1200));
        assert_eq!(config.session.backoff_max_ms, Some(5000));
        assert_eq!(config.assistant.history_turns, Some(6));
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.voice.wake_word.is_none());
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(parse_config("[voice]\nwake_wrod = \"hey\"").is_err());
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[voice\nnot toml").unwrap();

        let config = load_config_from(&path);
        assert!(config.voice.wake_word.is_none());
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml"));
        assert!(config.data_dir.is_none());
    }
}
