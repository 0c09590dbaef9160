//! Specialist editor: one bounded task in, one proposed patch out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EditorConfig;
use crate::inference::{Inference, InferenceError, Prompt};
use crate::prompts::{specialist_system_prompt, specialist_task_prompt, Specialty};
use crate::story::{StoryPatch, StoryView, Target};
use crate::tools::EditingTool;

/// Why a specialist produced no patch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecialistError {
    /// The task's target is not in the view the specialist was given.
    #[error("{target} does not exist in the story")]
    TargetNotFound { target: Target },

    /// The reply was not a patch this specialist may produce.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// The inference call failed or timed out.
    #[error(transparent)]
    InferenceUnavailable(#[from] InferenceError),
}

impl SpecialistError {
    fn malformed(reason: impl Into<String>) -> Self {
        SpecialistError::MalformedResponse {
            reason: reason.into(),
        }
    }
}

/// Outcome of one specialist run: a patch or a failure, never both.
pub type EditResult = Result<StoryPatch, SpecialistError>;

/// A unit of delegated work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Position in the decomposition.
    pub ordinal: usize,
    /// The one part of the story the task may change.
    pub target: Target,
    pub instruction: String,
    pub specialty: Specialty,
}

/// Reply shape the specialists are asked to produce.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialistReply {
    Edits { edits: Vec<ToolInvocation> },
    Decline { decline: String },
}

#[derive(Debug, Deserialize)]
struct ToolInvocation {
    tool: String,
    #[serde(default)]
    input: Value,
}

/// An editor that works on exactly one target per task.
#[derive(Clone)]
pub struct SpecialistEditorAgent {
    specialty: Specialty,
    config: EditorConfig,
    inference: Arc<dyn Inference>,
}

impl SpecialistEditorAgent {
    /// Create a specialist that calls `inference` for every task.
    pub fn new(specialty: Specialty, config: EditorConfig, inference: Arc<dyn Inference>) -> Self {
        Self {
            specialty,
            config,
            inference,
        }
    }

    pub fn specialty(&self) -> Specialty {
        self.specialty
    }

    /// Propose a patch for `task` against the snapshot `view`.
    ///
    /// The only side effect is the inference call. Nothing is retried here.
    #[tracing::instrument(
        skip_all,
        fields(ordinal = task.ordinal, edit_target = %task.target, revision = view.revision())
    )]
    pub async fn run(&self, task: &Subtask, view: &StoryView) -> EditResult {
        if !view.contains(&task.target) {
            warn!("target not found");
            return Err(SpecialistError::TargetNotFound {
                target: task.target.clone(),
            });
        }

        let tools = EditingTool::for_target(task.target.kind());
        let prompt = Prompt::new(
            specialist_system_prompt(self.specialty, tools, &self.config),
            specialist_task_prompt(&task.target, &task.instruction, view.data()),
            &self.config,
        );

        let timeout = self.config.inference_timeout;
        let response = tokio::time::timeout(timeout, self.inference.infer(&prompt, view))
            .await
            .map_err(|_| InferenceError::Timeout(timeout))??;

        let patch = parse_response(&response, &task.target, tools)?;
        debug!(changes = patch.len(), "specialist proposed patch");
        Ok(patch)
    }
}

/// Turn a model response into a patch confined to `target` and `tools`.
fn parse_response(
    response: &str,
    target: &Target,
    tools: &[EditingTool],
) -> Result<StoryPatch, SpecialistError> {
    let reply: SpecialistReply = serde_json::from_str(extract_json(response))
        .map_err(|e| SpecialistError::malformed(format!("response is not an edit list: {e}")))?;

    let invocations = match reply {
        SpecialistReply::Edits { edits } => edits,
        SpecialistReply::Decline { decline } => {
            return Err(SpecialistError::malformed(format!("declined: {decline}")));
        }
    };

    let mut patch = StoryPatch::default();
    for invocation in invocations {
        let change = EditingTool::parse_invocation(&invocation.tool, invocation.input)
            .map_err(|e| SpecialistError::malformed(e.to_string()))?;

        if !tools.contains(&change.tool()) {
            return Err(SpecialistError::malformed(format!(
                "{} is not available for {target}",
                change.tool().name()
            )));
        }
        let touched = change.target();
        if !touched.matches(target) {
            return Err(SpecialistError::malformed(format!(
                "edit touches {touched}, task is limited to {target}"
            )));
        }
        patch.changes.push(change);
    }
    Ok(patch)
}

/// Strip markdown fences and surrounding prose from a JSON reply.
fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}
