//! Editing tools available to the editors.
//!
//! The tool set is closed: every operation is a variant of [`EditingTool`]
//! with a declared input schema, and every invocation parses into exactly one
//! [`StoryChange`]. Each target kind only gets the subset of tools that can
//! touch it.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::story::{StoryChange, TargetKind};

/// Errors from interpreting a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// No tool has this name.
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    /// The input does not match the tool's schema.
    #[error("invalid input for {tool}: {reason}")]
    InvalidInput { tool: String, reason: String },
}

static INTRODUCE_CHARACTER_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": "Name of the new character, unique within the story"
            },
            "attributes": {
                "type": "object",
                "additionalProperties": { "type": "string" },
                "description": "Traits such as background, motivation or appearance"
            }
        },
        "required": ["name"]
    })
});

static REVISE_CHARACTER_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": "Name of the character to revise"
            },
            "attributes": {
                "type": "object",
                "additionalProperties": { "type": "string" },
                "description": "Traits to replace. An empty string removes the trait."
            }
        },
        "required": ["name", "attributes"]
    })
});

static RENAME_CHARACTER_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "description": "Current name" },
            "new_name": { "type": "string", "description": "New name, unique within the story" }
        },
        "required": ["name", "new_name"]
    })
});

static INTRODUCE_SCENE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "location": { "type": "string", "description": "Where the scene takes place" },
            "summary": { "type": "string", "description": "What happens there" }
        },
        "required": ["location"]
    })
});

static REVISE_SCENE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "location": { "type": "string", "description": "Location of the scene to revise" },
            "summary": { "type": "string", "description": "Replacement summary" }
        },
        "required": ["location", "summary"]
    })
});

static SET_THEME_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "theme": { "type": "string", "description": "The central theme. Empty clears it." }
        },
        "required": ["theme"]
    })
});

static REVISE_NARRATIVE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "text": { "type": "string", "description": "The complete replacement narrative body" }
        },
        "required": ["text"]
    })
});

static REORDER_CHARACTERS_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "order": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Every character name exactly once, in the new introduction order"
            }
        },
        "required": ["order"]
    })
});

/// A named editing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditingTool {
    IntroduceCharacter,
    ReviseCharacter,
    RenameCharacter,
    IntroduceScene,
    ReviseScene,
    SetTheme,
    ReviseNarrative,
    ReorderCharacters,
}

const CHARACTER_TOOLS: &[EditingTool] = &[EditingTool::ReviseCharacter, EditingTool::RenameCharacter];

const SCENE_TOOLS: &[EditingTool] = &[EditingTool::ReviseScene];

const NARRATIVE_TOOLS: &[EditingTool] = &[
    EditingTool::ReviseNarrative,
    EditingTool::SetTheme,
    EditingTool::IntroduceCharacter,
    EditingTool::IntroduceScene,
    EditingTool::ReorderCharacters,
];

impl EditingTool {
    pub const ALL: [EditingTool; 8] = [
        EditingTool::IntroduceCharacter,
        EditingTool::ReviseCharacter,
        EditingTool::RenameCharacter,
        EditingTool::IntroduceScene,
        EditingTool::ReviseScene,
        EditingTool::SetTheme,
        EditingTool::ReviseNarrative,
        EditingTool::ReorderCharacters,
    ];

    /// Name the model uses to invoke the tool.
    pub fn name(self) -> &'static str {
        match self {
            EditingTool::IntroduceCharacter => "introduce_character",
            EditingTool::ReviseCharacter => "revise_character",
            EditingTool::RenameCharacter => "rename_character",
            EditingTool::IntroduceScene => "introduce_scene",
            EditingTool::ReviseScene => "revise_scene",
            EditingTool::SetTheme => "set_theme",
            EditingTool::ReviseNarrative => "revise_narrative",
            EditingTool::ReorderCharacters => "reorder_characters",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            EditingTool::IntroduceCharacter => "Add a new character at the end of the cast.",
            EditingTool::ReviseCharacter => {
                "Replace some of a character's traits. Traits not mentioned are kept."
            }
            EditingTool::RenameCharacter => "Give an existing character a new name.",
            EditingTool::IntroduceScene => "Add a new scene at a location not used yet.",
            EditingTool::ReviseScene => "Rewrite the summary of an existing scene.",
            EditingTool::SetTheme => "Set the central theme of the story.",
            EditingTool::ReviseNarrative => "Replace the narrative body with a revised version.",
            EditingTool::ReorderCharacters => "Change the order in which characters are introduced.",
        }
    }

    /// JSON schema of the tool's input.
    pub fn input_schema(self) -> &'static Value {
        match self {
            EditingTool::IntroduceCharacter => &INTRODUCE_CHARACTER_SCHEMA,
            EditingTool::ReviseCharacter => &REVISE_CHARACTER_SCHEMA,
            EditingTool::RenameCharacter => &RENAME_CHARACTER_SCHEMA,
            EditingTool::IntroduceScene => &INTRODUCE_SCENE_SCHEMA,
            EditingTool::ReviseScene => &REVISE_SCENE_SCHEMA,
            EditingTool::SetTheme => &SET_THEME_SCHEMA,
            EditingTool::ReviseNarrative => &REVISE_NARRATIVE_SCHEMA,
            EditingTool::ReorderCharacters => &REORDER_CHARACTERS_SCHEMA,
        }
    }

    /// Tools a specialist may use on a target of the given kind.
    pub fn for_target(kind: TargetKind) -> &'static [EditingTool] {
        match kind {
            TargetKind::Character => CHARACTER_TOOLS,
            TargetKind::Scene => SCENE_TOOLS,
            TargetKind::Narrative => NARRATIVE_TOOLS,
        }
    }

    pub fn definition(self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: self.description(),
            input_schema: self.input_schema().clone(),
        }
    }

    /// Parse one invocation as produced by a model.
    pub fn parse_invocation(name: &str, input: Value) -> Result<StoryChange, ToolError> {
        let tool = Self::from_name(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })?;

        serde_json::from_value(json!({ "tool": tool.name(), "input": input })).map_err(|e| {
            ToolError::InvalidInput {
                tool: tool.name().to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Tool definition as shown to a model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Render tool definitions as a JSON list for inclusion in a prompt.
pub fn render_definitions(tools: &[EditingTool]) -> String {
    let definitions: Vec<ToolDefinition> = tools.iter().map(|t| t.definition()).collect();
    serde_json::to_string_pretty(&definitions).unwrap_or_default()
}
