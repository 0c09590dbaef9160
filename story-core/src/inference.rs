//! The inference capability the editors delegate language work to.
//!
//! Editors only see the [`Inference`] trait. [`ClaudeInference`] is the
//! production implementation; tests use
//! [`ScriptedInference`](crate::testing::ScriptedInference).

use async_trait::async_trait;
use claude::{Claude, Message, Request};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::EditorConfig;
use crate::story::StoryView;

/// Errors from an inference call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// The backend did not answer in time.
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not be reached or is overloaded.
    #[error("inference unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the call, or its answer could not be read.
    #[error("inference rejected: {0}")]
    Rejected(String),

    /// No credentials or an invalid client setup.
    #[error("inference not configured: {0}")]
    NotConfigured(String),
}

impl InferenceError {
    /// Whether the same call may succeed if made again.
    pub fn is_transient(&self) -> bool {
        matches!(self, InferenceError::Timeout(_) | InferenceError::Unavailable(_))
    }
}

impl From<claude::Error> for InferenceError {
    fn from(error: claude::Error) -> Self {
        match error {
            claude::Error::Timeout(duration) => InferenceError::Timeout(duration),
            claude::Error::NoApiKey | claude::Error::Config(_) => {
                InferenceError::NotConfigured(error.to_string())
            }
            other if other.is_transient() => InferenceError::Unavailable(other.to_string()),
            other => InferenceError::Rejected(other.to_string()),
        }
    }
}

/// Tokens consumed by inference calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Usage accrued since `earlier` was read from the same counter.
    pub fn since(&self, earlier: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
        }
    }
}

/// A prompt plus the sampling parameters for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// Role and rules for the model.
    pub system: String,
    /// The task itself. The story is appended by the backend.
    pub user: String,
    /// Model override; the client default when `None`.
    pub model: Option<String>,
    pub max_tokens: usize,
    pub temperature: Option<f32>,
}

impl Prompt {
    /// Build a prompt using the model parameters from `config`.
    pub fn new(system: impl Into<String>, user: impl Into<String>, config: &EditorConfig) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// Given a prompt and the story it is about, produce a text response.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn infer(&self, prompt: &Prompt, context: &StoryView) -> Result<String, InferenceError>;

    /// Running total of tokens consumed through this backend.
    fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}

#[derive(Debug, Default)]
struct UsageCounter {
    input: AtomicU64,
    output: AtomicU64,
}

/// Inference backed by the Claude Messages API.
///
/// Clones share one usage counter.
#[derive(Debug, Clone)]
pub struct ClaudeInference {
    client: Claude,
    usage: Arc<UsageCounter>,
}

impl ClaudeInference {
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            usage: Arc::new(UsageCounter::default()),
        }
    }

    /// Create from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env() -> Result<Self, InferenceError> {
        Ok(Self::new(Claude::from_env()?))
    }

    fn render_context(context: &StoryView) -> Result<String, InferenceError> {
        let story = serde_json::to_string_pretty(context.data())
            .map_err(|e| InferenceError::Rejected(format!("cannot render story: {e}")))?;
        Ok(format!("## Full Story (revision {})\n```json\n{story}\n```", context.revision()))
    }
}

#[async_trait]
impl Inference for ClaudeInference {
    async fn infer(&self, prompt: &Prompt, context: &StoryView) -> Result<String, InferenceError> {
        let user = format!("{}\n\n{}", prompt.user, Self::render_context(context)?);

        let mut request = Request::new(vec![Message::user(user)])
            .with_system(&prompt.system)
            .with_max_tokens(prompt.max_tokens);
        if let Some(ref model) = prompt.model {
            request = request.with_model(model);
        }
        if let Some(temp) = prompt.temperature {
            request = request.with_temperature(temp);
        }

        let response = self.client.complete(request).await?;
        self.usage.input.fetch_add(response.usage.input_tokens as u64, Ordering::Relaxed);
        self.usage.output.fetch_add(response.usage.output_tokens as u64, Ordering::Relaxed);
        tracing::debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "inference completed"
        );
        Ok(response.text())
    }

    fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.usage.input.load(Ordering::Relaxed),
            output_tokens: self.usage.output.load(Ordering::Relaxed),
        }
    }
}
