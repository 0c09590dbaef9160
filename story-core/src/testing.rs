//! Testing utilities for the editors.
//!
//! This module provides:
//! - `ScriptedInference` for deterministic runs without API calls
//! - `sample_story` as a small, valid starting story

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::inference::{Inference, InferenceError, Prompt, TokenUsage};
use crate::story::{CharacterData, SceneData, StoryData, StoryView};

/// A scripted reply, optionally delivered after a delay.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    /// What the call returns.
    pub result: Result<String, InferenceError>,
    /// How long the call takes before returning.
    pub delay: Option<Duration>,
    /// Tokens added to the running total when the reply is delivered.
    pub usage: TokenUsage,
}

impl ScriptedReply {
    /// A successful reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            result: Ok(text.into()),
            delay: None,
            usage: TokenUsage::default(),
        }
    }

    /// A failed reply.
    pub fn error(error: InferenceError) -> Self {
        Self {
            result: Err(error),
            delay: None,
            usage: TokenUsage::default(),
        }
    }

    /// Deliver the reply after `delay`.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report token usage with the reply.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }
}

/// One call seen by a [`ScriptedInference`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// System prompt of the call.
    pub system: String,
    /// User prompt of the call, without the rendered story.
    pub user: String,
    /// Revision of the story view passed with the call.
    pub revision: u64,
}

/// An inference double that returns scripted replies.
///
/// Replies are keyed by a substring of the user prompt. The first key found
/// in the prompt wins, and each key hands out its replies in the order they
/// were queued. A call with no reply left fails with
/// [`InferenceError::Unavailable`].
#[derive(Debug, Default)]
pub struct ScriptedInference {
    scripts: Mutex<Vec<(String, VecDeque<ScriptedReply>)>>,
    calls: Mutex<Vec<RecordedCall>>,
    usage: Mutex<TokenUsage>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedInference {
    /// An inference with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for prompts containing `key`.
    pub fn push(&self, key: impl Into<String>, reply: ScriptedReply) {
        let key = key.into();
        let mut scripts = lock(&self.scripts);
        match scripts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, queue)) => queue.push_back(reply),
            None => scripts.push((key, VecDeque::from([reply]))),
        }
    }

    /// Queue a text reply for prompts containing `key`.
    pub fn reply(self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.push(key, ScriptedReply::text(text));
        self
    }

    /// Queue a text reply delivered after `delay`.
    pub fn reply_after(self, key: impl Into<String>, delay: Duration, text: impl Into<String>) -> Self {
        self.push(key, ScriptedReply::text(text).after(delay));
        self
    }

    /// Queue a failure for prompts containing `key`.
    pub fn fail(self, key: impl Into<String>, error: InferenceError) -> Self {
        self.push(key, ScriptedReply::error(error));
        self
    }

    /// Every call made so far, in call order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    fn next_reply(&self, user: &str) -> Option<ScriptedReply> {
        let mut scripts = lock(&self.scripts);
        scripts
            .iter_mut()
            .find(|(key, queue)| !queue.is_empty() && user.contains(key.as_str()))
            .and_then(|(_, queue)| queue.pop_front())
    }
}

#[async_trait]
impl Inference for ScriptedInference {
    async fn infer(&self, prompt: &Prompt, context: &StoryView) -> Result<String, InferenceError> {
        lock(&self.calls).push(RecordedCall {
            system: prompt.system.clone(),
            user: prompt.user.clone(),
            revision: context.revision(),
        });

        let reply = self.next_reply(&prompt.user).ok_or_else(|| {
            InferenceError::Unavailable("no scripted reply for this prompt".to_string())
        })?;

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        let mut usage = lock(&self.usage);
        usage.input_tokens += reply.usage.input_tokens;
        usage.output_tokens += reply.usage.output_tokens;
        reply.result
    }

    fn usage(&self) -> TokenUsage {
        *lock(&self.usage)
    }
}

/// A small story with two characters, two scenes and a theme.
pub fn sample_story() -> StoryData {
    StoryData::new()
        .with_character(
            CharacterData::new("Mira")
                .with_attribute("background", "lighthouse keeper")
                .with_attribute("motivation", "keep the light burning"),
        )
        .with_character(
            CharacterData::new("Tobias")
                .with_attribute("background", "smuggler")
                .with_attribute("motivation", "pay off an old debt"),
        )
        .with_scene(SceneData::new("The Lighthouse", "A storm rolls in and the lamp fails."))
        .with_scene(SceneData::new("Harbor", "Tobias unloads crates at night."))
        .with_theme("trust between strangers")
        .with_narrative("On the night of the storm, Mira saw a boat without lights.")
}
