//! System and task prompts for the editors.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::EditorConfig;
use crate::story::{StoryData, Target};
use crate::tools::{render_definitions, EditingTool};

/// Persona shared by every editor.
const EDITOR_PERSONA: &str = "You are an editor at a leading publishing house, known for discovering \
and nurturing new talent. You ask the right questions, you want the best for your authors, and you \
tell them plainly when an idea is not good enough yet.";

/// The genre an editor specializes in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialty {
    #[default]
    General,
    ChildrensBooks,
    Novels,
}

impl Specialty {
    /// Human-readable name used in prompts and logs.
    pub fn label(self) -> &'static str {
        match self {
            Specialty::General => "general fiction",
            Specialty::ChildrensBooks => "children's books",
            Specialty::Novels => "novels",
        }
    }

    fn guidance(self) -> &'static str {
        match self {
            Specialty::General => "Keep edits faithful to the author's voice and intent.",
            Specialty::ChildrensBooks => {
                "Favor simple, vivid language, warm characters, and clear stakes a young reader can follow."
            }
            Specialty::Novels => {
                "Favor layered motivations, consistent characterization, and scenes that earn their place."
            }
        }
    }
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn push_common_sections(prompt: &mut String, config: &EditorConfig) {
    if let Some(ref custom) = config.custom_instructions {
        prompt.push_str("\n\n## Additional Instructions\n");
        prompt.push_str(custom);
    }
    if let Some(ref language) = config.response_language {
        prompt.push_str(&format!(
            "\n\n**IMPORTANT:** Write every piece of story text in {language}. Keep JSON keys and tool names in English."
        ));
    }
}

/// System prompt for a specialist working on one target with `tools`.
pub fn specialist_system_prompt(
    specialty: Specialty,
    tools: &[EditingTool],
    config: &EditorConfig,
) -> String {
    let mut prompt = format!(
        "{EDITOR_PERSONA} You specialize in {specialty}, have worked with some of the greats, and have \
written a few books yourself. {guidance}\n\n\
## Your Task\n\
You receive one bounded editing task about a single part of a story. Propose edits using only the \
tools listed below. You cannot change the story yourself; the lead editor reviews and applies what \
you propose.\n\n\
## Tools\n{tools}\n\n\
## Response Format\n\
Respond with ONLY a JSON object (no explanation outside the JSON):\n\
{{\"edits\": [{{\"tool\": \"<tool name>\", \"input\": {{ ... }}}}]}}\n\n\
If the task cannot be done with these tools, respond with {{\"decline\": \"<short reason>\"}}.",
        specialty = specialty.label(),
        guidance = specialty.guidance(),
        tools = render_definitions(tools),
    );
    push_common_sections(&mut prompt, config);
    prompt
}

/// User prompt describing the task and the current state of its target.
pub fn specialist_task_prompt(target: &Target, instruction: &str, story: &StoryData) -> String {
    let mut prompt = format!("## Target\n{target}\n\n## Request\n{instruction}\n\n## Current State\n");

    match target {
        Target::Character(name) => {
            if let Some(character) = story.character(name) {
                prompt.push_str(&format!("Name: {}\n", character.name));
                for (key, value) in &character.attributes {
                    prompt.push_str(&format!("- {key}: {value}\n"));
                }
            }
        }
        Target::Scene(location) => {
            if let Some(scene) = story.scene(location) {
                prompt.push_str(&format!("Location: {}\nSummary: {}\n", scene.location, scene.summary));
            }
        }
        Target::Narrative => {
            prompt.push_str(&format!(
                "Theme: {}\nCharacters: {}\nScenes: {}\n\nNarrative:\n{}\n",
                story.theme.as_deref().unwrap_or("(none)"),
                story.character_names().join(", "),
                story
                    .scenes
                    .iter()
                    .map(|s| s.location.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                story.narrative,
            ));
        }
    }

    prompt
}

/// System prompt for the lead's closing feedback.
pub fn feedback_system_prompt(config: &EditorConfig) -> String {
    let mut prompt = format!(
        "{EDITOR_PERSONA} You are the lead editor. You have just finished a round of revisions with \
your specialist editors."
    );
    push_common_sections(&mut prompt, config);
    prompt
}

/// User prompt asking for feedback on a finished run.
pub fn feedback_task_prompt(request: &str, applied: usize, failed: usize) -> String {
    format!(
        "The author asked: \"{request}\"\n\n\
{applied} edit(s) were applied and {failed} could not be applied. \
Give brief but honest feedback on the story idea as it stands now, in a few sentences."
    )
}
