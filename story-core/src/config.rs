//! Configuration shared by the lead and specialist editors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::prompts::Specialty;

/// Options passed to each editor at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Model id sent with every inference call. `None` uses the backend's
    /// default model.
    pub model: Option<String>,

    /// Maximum tokens for one response.
    pub max_tokens: usize,

    /// Sampling temperature, clamped to 0.0..=1.0 by the backend.
    pub temperature: Option<f32>,

    /// How many extra attempts the lead makes when a specialist reports the
    /// inference capability unavailable for a transient reason. Malformed
    /// responses, missing targets and rejected or unconfigured inference are
    /// never retried.
    pub inference_retries: u32,

    /// Upper bound on a single inference call, enforced by the specialist.
    #[serde(with = "duration_secs")]
    pub inference_timeout: Duration,

    /// How many specialists may be in flight at once.
    pub max_concurrent_specialists: usize,

    /// Specialty used when a request gives no hint of its genre.
    pub default_specialty: Specialty,

    /// Language the editors should write in, e.g. "Japanese".
    pub response_language: Option<String>,

    /// Extra instructions appended to every system prompt.
    pub custom_instructions: Option<String>,

    /// Ask for brief feedback on the revised story once a run is done.
    pub request_feedback: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 2048,
            temperature: Some(0.7),
            inference_retries: 0,
            inference_timeout: Duration::from_secs(60),
            max_concurrent_specialists: 4,
            default_specialty: Specialty::General,
            response_language: None,
            custom_instructions: None,
            request_feedback: false,
        }
    }
}

impl EditorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_inference_retries(mut self, retries: u32) -> Self {
        self.inference_retries = retries;
        self
    }

    pub fn with_inference_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    /// At least one specialist always runs.
    pub fn with_max_concurrent_specialists(mut self, limit: usize) -> Self {
        self.max_concurrent_specialists = limit.max(1);
        self
    }

    pub fn with_default_specialty(mut self, specialty: Specialty) -> Self {
        self.default_specialty = specialty;
        self
    }

    pub fn with_response_language(mut self, language: impl Into<String>) -> Self {
        self.response_language = Some(language.into());
        self
    }

    pub fn with_custom_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.custom_instructions = Some(instructions.into());
        self
    }

    pub fn with_feedback(mut self) -> Self {
        self.request_feedback = true;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = EditorConfig::new()
            .with_model("claude-3-5-haiku-20241022")
            .with_temperature(0.2)
            .with_inference_retries(2)
            .with_max_concurrent_specialists(0)
            .with_response_language("Japanese")
            .with_feedback();

        assert_eq!(config.model.as_deref(), Some("claude-3-5-haiku-20241022"));
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(config.inference_retries, 2);
        assert_eq!(config.max_concurrent_specialists, 1);
        assert_eq!(config.response_language.as_deref(), Some("Japanese"));
        assert!(config.request_feedback);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EditorConfig =
            serde_json::from_str(r#"{"inference_timeout": 2.5, "default_specialty": "novels"}"#).unwrap();
        assert_eq!(config.inference_timeout, Duration::from_millis(2500));
        assert_eq!(config.default_specialty, Specialty::Novels);
        assert_eq!(config.max_tokens, 2048);
        assert_eq!(config.inference_retries, 0);
    }
}
