//! Orchestrator configuration.
//!
//! Timing constants for the turn pipeline plus the fixed assistant phrases.
//! Precedence: defaults < TOML file < `CARELINE_VOICE__*` environment.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | min_utterance_chars | 3 | Utterances must be strictly longer than this to start a turn. |
//! | debounce_ms | 600 | Quiet period after the last utterance update before resolving. |
//! | interim_debounce | true | Non-trivial interim results feed the debounce window. |
//! | follow_up_delay_ms | 8000 | Silence after a reply before the follow-up prompt. |
//! | interpreter_timeout_ms | 8000 | Upper bound on one interpreter call. |
//! | console_words_per_minute | 180 | Pace of the console sink. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Env var naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "CARELINE_VOICE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/voice.toml";

fn default_min_utterance_chars() -> usize {
    3
}

fn default_debounce_ms() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_follow_up_delay_ms() -> u64 {
    8_000
}

fn default_interpreter_timeout_ms() -> u64 {
    8_000
}

fn default_apology_reply() -> String {
    "Sorry, I couldn't process that request right now. Please try again.".to_string()
}

fn default_follow_up_prompt() -> String {
    "Is there anything else I can help you with?".to_string()
}

fn default_action_failure_note() -> String {
    "I couldn't complete that.".to_string()
}

fn default_console_wpm() -> u32 {
    180
}

/// Configuration for the voice orchestrator and its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Utterances must be strictly longer than this (in chars, trimmed).
    #[serde(default = "default_min_utterance_chars")]
    pub min_utterance_chars: usize,
    /// Trailing-edge debounce window.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// When true, non-trivial interim utterances also (re)start the debounce window.
    #[serde(default = "default_true")]
    pub interim_debounce: bool,
    /// Delay between the end of a reply and the follow-up prompt.
    #[serde(default = "default_follow_up_delay_ms")]
    pub follow_up_delay_ms: u64,
    /// Bounded timeout for the intent interpreter.
    #[serde(default = "default_interpreter_timeout_ms")]
    pub interpreter_timeout_ms: u64,
    /// Spoken when the interpreter fails.
    #[serde(default = "default_apology_reply")]
    pub apology_reply: String,
    /// Spoken when the follow-up timer fires.
    #[serde(default = "default_follow_up_prompt")]
    pub follow_up_prompt: String,
    /// Appended to a reply whose action failed.
    #[serde(default = "default_action_failure_note")]
    pub action_failure_note: String,
    /// Speaking pace used by [`crate::playback::ConsoleSink`].
    #[serde(default = "default_console_wpm")]
    pub console_words_per_minute: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            min_utterance_chars: default_min_utterance_chars(),
            debounce_ms: default_debounce_ms(),
            interim_debounce: true,
            follow_up_delay_ms: default_follow_up_delay_ms(),
            interpreter_timeout_ms: default_interpreter_timeout_ms(),
            apology_reply: default_apology_reply(),
            follow_up_prompt: default_follow_up_prompt(),
            action_failure_note: default_action_failure_note(),
            console_words_per_minute: default_console_wpm(),
        }
    }
}

impl VoiceConfig {
    /// Load from `CARELINE_VOICE_CONFIG` (or `config/voice.toml` when present) and environment.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from an explicit file (skipped if missing) layered under `CARELINE_VOICE__*` env vars.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("CARELINE_VOICE").separator("__"))
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document (no environment layering).
    pub fn from_toml_str(toml: &str) -> VoiceResult<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject timing values that would stall or spin the state machine.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.debounce_ms == 0 {
            return Err(VoiceError::Config("debounce_ms must be greater than 0".to_string()));
        }
        if self.follow_up_delay_ms == 0 {
            return Err(VoiceError::Config(
                "follow_up_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.interpreter_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "interpreter_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn follow_up_delay(&self) -> Duration {
        Duration::from_millis(self.follow_up_delay_ms)
    }

    pub fn interpreter_timeout(&self) -> Duration {
        Duration::from_millis(self.interpreter_timeout_ms)
    }

    /// True when `text` is long enough to start a turn.
    pub fn is_substantive(&self, text: &str) -> bool {
        text.trim().chars().count() > self.min_utterance_chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = VoiceConfig::default();
        assert_eq!(c.min_utterance_chars, 3);
        assert_eq!(c.debounce(), Duration::from_millis(600));
        assert!(c.interim_debounce);
        assert_eq!(c.follow_up_delay(), Duration::from_secs(8));
        assert_eq!(c.interpreter_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn substantive_threshold_is_strict() {
        let c = VoiceConfig::default();
        assert!(!c.is_substantive("hey"));
        assert!(!c.is_substantive("  hi  "));
        assert!(c.is_substantive("labs"));
    }

    #[test]
    fn toml_overrides_and_keeps_defaults() {
        let c = VoiceConfig::from_toml_str(
            r#"
            debounce_ms = 250
            follow_up_prompt = "Anything else?"
            "#,
        )
        .unwrap();
        assert_eq!(c.debounce_ms, 250);
        assert_eq!(c.follow_up_prompt, "Anything else?");
        assert_eq!(c.follow_up_delay_ms, 8_000);
    }

    #[test]
    fn zero_debounce_rejected() {
        let err = VoiceConfig::from_toml_str("debounce_ms = 0").unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let c = VoiceConfig::load_from(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(c, VoiceConfig::default());
    }
}
