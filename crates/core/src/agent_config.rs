//! Per-agent configuration as served by the backend.
//!
//! The backend stores prompts and provider keys for every agent and hands a
//! decrypted copy to the worker once per session. The worker never persists it.

use serde::Deserialize;
use std::fmt;
use tracing::warn;

/// Speakers supported by the `bulbul:v2` TTS model.
pub const SUPPORTED_SPEAKERS: &[&str] = &[
    "anushka", "manisha", "vidya", "arya", "abhilash", "karun", "hitesh",
];

pub const DEFAULT_SPEAKER: &str = "anushka";
pub const DEFAULT_LLM_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_WELCOME_MESSAGE: &str = "Hello! How can I help you?";

fn default_llm_model() -> String {
    DEFAULT_LLM_MODEL.to_string()
}

fn default_speaker() -> String {
    DEFAULT_SPEAKER.to_string()
}

fn default_welcome_message() -> String {
    DEFAULT_WELCOME_MESSAGE.to_string()
}

/// Configuration for one agent, fetched fresh for every session.
#[derive(Clone, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Display name, used only for logging.
    #[serde(default)]
    pub name: String,
    pub system_prompt: String,
    pub sarvam_api_key: String,
    pub llm_api_key: String,
    pub stt_language_code: String,
    pub tts_language_code: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_speaker")]
    pub tts_voice: String,
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("name", &self.name)
            .field("system_prompt", &self.system_prompt)
            .field("sarvam_api_key", &"[REDACTED]")
            .field("llm_api_key", &"[REDACTED]")
            .field("stt_language_code", &self.stt_language_code)
            .field("tts_language_code", &self.tts_language_code)
            .field("llm_model", &self.llm_model)
            .field("tts_voice", &self.tts_voice)
            .field("welcome_message", &self.welcome_message)
            .finish()
    }
}

impl AgentConfig {
    /// Returns the TTS speaker to use, falling back to the default speaker
    /// when the configured one is not supported by the TTS model.
    pub fn resolved_speaker(&self) -> &str {
        if SUPPORTED_SPEAKERS.contains(&self.tts_voice.as_str()) {
            &self.tts_voice
        } else {
            warn!(
                speaker = %self.tts_voice,
                fallback = DEFAULT_SPEAKER,
                "Speaker is not compatible with bulbul:v2. Falling back."
            );
            DEFAULT_SPEAKER
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_body() -> serde_json::Value {
        serde_json::json!({
            "name": "Support Bot",
            "system_prompt": "You are a helpful support agent.",
            "sarvam_api_key": "sk-sarvam",
            "llm_api_key": "sk-llm",
            "stt_language_code": "hi-IN",
            "tts_language_code": "hi-IN",
            "llm_model": "gemini-2.0-flash",
            "tts_voice": "vidya",
            "welcome_message": "Namaste!"
        })
    }

    #[test]
    fn test_deserialize_full_body() {
        let config: AgentConfig = serde_json::from_value(full_body()).unwrap();
        assert_eq!(config.name, "Support Bot");
        assert_eq!(config.llm_model, "gemini-2.0-flash");
        assert_eq!(config.tts_voice, "vidya");
        assert_eq!(config.welcome_message, "Namaste!");
    }

    #[test]
    fn test_optional_fields_fall_back_to_defaults() {
        let mut body = full_body();
        let obj = body.as_object_mut().unwrap();
        obj.remove("name");
        obj.remove("llm_model");
        obj.remove("tts_voice");
        obj.remove("welcome_message");

        let config: AgentConfig = serde_json::from_value(body).unwrap();
        assert_eq!(config.name, "");
        assert_eq!(config.llm_model, DEFAULT_LLM_MODEL);
        assert_eq!(config.tts_voice, DEFAULT_SPEAKER);
        assert_eq!(config.welcome_message, DEFAULT_WELCOME_MESSAGE);
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let mut body = full_body();
        body.as_object_mut().unwrap().remove("system_prompt");
        assert!(serde_json::from_value::<AgentConfig>(body).is_err());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let mut body = full_body();
        body.as_object_mut()
            .unwrap()
            .insert("created_at".into(), serde_json::json!("2024-01-01"));
        assert!(serde_json::from_value::<AgentConfig>(body).is_ok());
    }

    #[test]
    fn test_resolved_speaker() {
        let mut config: AgentConfig = serde_json::from_value(full_body()).unwrap();
        assert_eq!(config.resolved_speaker(), "vidya");

        config.tts_voice = "meera".to_string();
        assert_eq!(config.resolved_speaker(), DEFAULT_SPEAKER);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config: AgentConfig = serde_json::from_value(full_body()).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-sarvam"));
        assert!(!debug.contains("sk-llm"));
        assert!(debug.contains("[REDACTED]"));
    }
}
