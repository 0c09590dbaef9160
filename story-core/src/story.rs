//! Shared story state.
//!
//! `StoryState` is the single mutable resource of an editing session. Only the
//! lead editor writes to it, through [`StoryState::apply`], which either
//! commits a whole patch or leaves the state untouched. Specialists read
//! [`StoryView`] snapshots, which are cheap `Arc` clones of a committed
//! revision and never observe a half-applied patch.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

use crate::tools::EditingTool;

/// Reasons a story or patch breaks the story invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("a character named '{0}' already exists")]
    DuplicateCharacter(String),

    #[error("a scene at '{0}' already exists")]
    DuplicateScene(String),

    #[error("no character named '{0}'")]
    UnknownCharacter(String),

    #[error("no scene at '{0}'")]
    UnknownScene(String),

    #[error("names must not be blank")]
    BlankName,

    #[error("{field} contains control characters")]
    MalformedText { field: String },

    #[error("reorder must list every character exactly once")]
    ReorderMismatch,
}

/// Errors from story state operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoryError {
    /// A patch would break an invariant; the state is unchanged.
    #[error("invalid patch: {0}")]
    InvalidPatch(#[from] Violation),

    /// Input data already breaks an invariant.
    #[error("invalid story: {0}")]
    InvalidStory(Violation),
}

/// A character in the story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterData {
    /// Unique among characters, ignoring case.
    pub name: String,

    /// Free-form traits such as "background" or "motivation".
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl CharacterData {
    /// A character with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set one attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A place where part of the story happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneData {
    /// Unique among scenes, ignoring case.
    pub location: String,
    /// What happens there.
    #[serde(default)]
    pub summary: String,
}

impl SceneData {
    /// A scene at `location`.
    pub fn new(location: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            summary: summary.into(),
        }
    }
}

/// The story document: characters in introduction order, scenes, theme and
/// the narrative body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryData {
    #[serde(default)]
    pub characters: Vec<CharacterData>,
    #[serde(default)]
    pub scenes: Vec<SceneData>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub narrative: String,
}

impl StoryData {
    /// An empty story.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a character to the introduction order.
    pub fn with_character(mut self, character: CharacterData) -> Self {
        self.characters.push(character);
        self
    }

    /// Append a scene.
    pub fn with_scene(mut self, scene: SceneData) -> Self {
        self.scenes.push(scene);
        self
    }

    /// Set the theme.
    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    /// Set the narrative body.
    pub fn with_narrative(mut self, narrative: impl Into<String>) -> Self {
        self.narrative = narrative.into();
        self
    }

    /// Look up a character by name (case-insensitive).
    pub fn character(&self, name: &str) -> Option<&CharacterData> {
        self.character_position(name).map(|i| &self.characters[i])
    }

    /// Introduction index of a character.
    pub fn character_position(&self, name: &str) -> Option<usize> {
        let key = name_key(name);
        self.characters.iter().position(|c| name_key(&c.name) == key)
    }

    /// Look up a scene by location (case-insensitive).
    pub fn scene(&self, location: &str) -> Option<&SceneData> {
        self.scene_position(location).map(|i| &self.scenes[i])
    }

    /// Index of a scene.
    pub fn scene_position(&self, location: &str) -> Option<usize> {
        let key = name_key(location);
        self.scenes.iter().position(|s| name_key(&s.location) == key)
    }

    /// Character names in introduction order.
    pub fn character_names(&self) -> Vec<&str> {
        self.characters.iter().map(|c| c.name.as_str()).collect()
    }

    /// Whether a sub-task aimed at `target` has something to edit.
    pub fn contains(&self, target: &Target) -> bool {
        self.story_rank(target).is_some()
    }

    /// Position of a target in story order: characters in introduction
    /// order, then scenes, then the narrative as a whole.
    pub fn story_rank(&self, target: &Target) -> Option<(u8, usize)> {
        match target {
            Target::Character(name) => self.character_position(name).map(|i| (0, i)),
            Target::Scene(location) => self.scene_position(location).map(|i| (1, i)),
            Target::Narrative => Some((2, 0)),
        }
    }

    /// Check every invariant of the story.
    pub fn validate(&self) -> Result<(), Violation> {
        let mut seen = HashSet::new();
        for character in &self.characters {
            check_name(&character.name)?;
            if !seen.insert(name_key(&character.name)) {
                return Err(Violation::DuplicateCharacter(character.name.trim().to_string()));
            }
            for (key, value) in &character.attributes {
                check_name(key)?;
                check_text(&format!("attribute '{key}' of {}", character.name), value)?;
            }
        }

        let mut seen = HashSet::new();
        for scene in &self.scenes {
            check_name(&scene.location)?;
            if !seen.insert(name_key(&scene.location)) {
                return Err(Violation::DuplicateScene(scene.location.trim().to_string()));
            }
            check_text(&format!("summary of {}", scene.location), &scene.summary)?;
        }

        if let Some(theme) = &self.theme {
            check_text("theme", theme)?;
        }
        check_text("narrative", &self.narrative)
    }
}

/// Case- and whitespace-insensitive key used for name comparisons.
pub(crate) fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn check_name(name: &str) -> Result<(), Violation> {
    if name.trim().is_empty() {
        return Err(Violation::BlankName);
    }
    if name.chars().any(char::is_control) {
        return Err(Violation::MalformedText {
            field: format!("name '{}'", name.escape_debug()),
        });
    }
    Ok(())
}

fn check_text(field: &str, text: &str) -> Result<(), Violation> {
    let malformed = text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'));
    if malformed {
        return Err(Violation::MalformedText {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// What a sub-task edits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    Character(String),
    Scene(String),
    /// Story-level material: narrative body, theme, and the character and
    /// scene rosters.
    Narrative,
}

impl Target {
    /// Target a character by name.
    pub fn character(name: impl Into<String>) -> Self {
        Target::Character(name.into())
    }

    /// Target a scene by location.
    pub fn scene(location: impl Into<String>) -> Self {
        Target::Scene(location.into())
    }

    /// Which part of the story the target belongs to.
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Character(_) => TargetKind::Character,
            Target::Scene(_) => TargetKind::Scene,
            Target::Narrative => TargetKind::Narrative,
        }
    }

    /// Same target, ignoring name case.
    pub fn matches(&self, other: &Target) -> bool {
        match (self, other) {
            (Target::Character(a), Target::Character(b)) | (Target::Scene(a), Target::Scene(b)) => {
                name_key(a) == name_key(b)
            }
            (Target::Narrative, Target::Narrative) => true,
            _ => false,
        }
    }

    /// Normalized form used to group sub-tasks aimed at the same target.
    pub(crate) fn key(&self) -> (TargetKind, String) {
        match self {
            Target::Character(name) | Target::Scene(name) => (self.kind(), name_key(name)),
            Target::Narrative => (TargetKind::Narrative, String::new()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Character(name) => write!(f, "character '{name}'"),
            Target::Scene(location) => write!(f, "scene '{location}'"),
            Target::Narrative => write!(f, "the narrative"),
        }
    }
}

/// The kind of a [`Target`], without its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Character,
    Scene,
    Narrative,
}

/// One editing action. Serialized as `{"tool": ..., "input": {...}}`, the
/// same shape the specialists are asked to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum StoryChange {
    IntroduceCharacter {
        name: String,
        #[serde(default)]
        attributes: BTreeMap<String, String>,
    },
    ReviseCharacter {
        name: String,
        attributes: BTreeMap<String, String>,
    },
    RenameCharacter {
        name: String,
        new_name: String,
    },
    IntroduceScene {
        location: String,
        #[serde(default)]
        summary: String,
    },
    ReviseScene {
        location: String,
        summary: String,
    },
    SetTheme {
        theme: String,
    },
    ReviseNarrative {
        text: String,
    },
    ReorderCharacters {
        order: Vec<String>,
    },
}

impl StoryChange {
    /// The tool that produces this change.
    pub fn tool(&self) -> EditingTool {
        match self {
            StoryChange::IntroduceCharacter { .. } => EditingTool::IntroduceCharacter,
            StoryChange::ReviseCharacter { .. } => EditingTool::ReviseCharacter,
            StoryChange::RenameCharacter { .. } => EditingTool::RenameCharacter,
            StoryChange::IntroduceScene { .. } => EditingTool::IntroduceScene,
            StoryChange::ReviseScene { .. } => EditingTool::ReviseScene,
            StoryChange::SetTheme { .. } => EditingTool::SetTheme,
            StoryChange::ReviseNarrative { .. } => EditingTool::ReviseNarrative,
            StoryChange::ReorderCharacters { .. } => EditingTool::ReorderCharacters,
        }
    }

    /// The existing part of the story this change modifies. Introductions
    /// extend a roster, so they belong to the narrative.
    pub fn target(&self) -> Target {
        match self {
            StoryChange::ReviseCharacter { name, .. } | StoryChange::RenameCharacter { name, .. } => {
                Target::Character(name.clone())
            }
            StoryChange::ReviseScene { location, .. } => Target::Scene(location.clone()),
            StoryChange::IntroduceCharacter { .. }
            | StoryChange::IntroduceScene { .. }
            | StoryChange::SetTheme { .. }
            | StoryChange::ReviseNarrative { .. }
            | StoryChange::ReorderCharacters { .. } => Target::Narrative,
        }
    }

    /// Apply to `data` in place. Uniqueness and text checks happen once for
    /// the whole patch in [`StoryData::validate`].
    fn apply_to(&self, data: &mut StoryData) -> Result<(), Violation> {
        match self {
            StoryChange::IntroduceCharacter { name, attributes } => {
                let mut character = CharacterData::new(name.trim());
                merge_attributes(&mut character.attributes, attributes);
                data.characters.push(character);
            }
            StoryChange::ReviseCharacter { name, attributes } => {
                let index = data
                    .character_position(name)
                    .ok_or_else(|| Violation::UnknownCharacter(name.clone()))?;
                merge_attributes(&mut data.characters[index].attributes, attributes);
            }
            StoryChange::RenameCharacter { name, new_name } => {
                let index = data
                    .character_position(name)
                    .ok_or_else(|| Violation::UnknownCharacter(name.clone()))?;
                data.characters[index].name = new_name.trim().to_string();
            }
            StoryChange::IntroduceScene { location, summary } => {
                data.scenes.push(SceneData::new(location.trim(), summary.clone()));
            }
            StoryChange::ReviseScene { location, summary } => {
                let index = data
                    .scene_position(location)
                    .ok_or_else(|| Violation::UnknownScene(location.clone()))?;
                data.scenes[index].summary = summary.clone();
            }
            StoryChange::SetTheme { theme } => {
                let theme = theme.trim();
                data.theme = (!theme.is_empty()).then(|| theme.to_string());
            }
            StoryChange::ReviseNarrative { text } => {
                data.narrative = text.clone();
            }
            StoryChange::ReorderCharacters { order } => {
                if order.len() != data.characters.len() {
                    return Err(Violation::ReorderMismatch);
                }
                let mut remaining: Vec<Option<CharacterData>> =
                    data.characters.drain(..).map(Some).collect();
                let mut reordered = Vec::with_capacity(remaining.len());
                for name in order {
                    let key = name_key(name);
                    let slot = remaining
                        .iter_mut()
                        .find(|slot| matches!(slot, Some(c) if name_key(&c.name) == key))
                        .ok_or(Violation::ReorderMismatch)?;
                    reordered.extend(slot.take());
                }
                data.characters = reordered;
            }
        }
        Ok(())
    }
}

/// Each edit replaces prior values; an empty value removes the attribute.
fn merge_attributes(target: &mut BTreeMap<String, String>, updates: &BTreeMap<String, String>) {
    for (key, value) in updates {
        let key = key.trim();
        if value.trim().is_empty() {
            target.remove(key);
        } else {
            target.insert(key.to_string(), value.clone());
        }
    }
}

/// A set of changes proposed by one specialist, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryPatch {
    /// Applied in order.
    pub changes: Vec<StoryChange>,
}

impl StoryPatch {
    /// A patch of `changes`.
    pub fn new(changes: Vec<StoryChange>) -> Self {
        Self { changes }
    }

    /// Append a change.
    pub fn with_change(mut self, change: StoryChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// The lead's mutable story, with a revision counter bumped on every commit.
#[derive(Debug, Clone)]
pub struct StoryState {
    data: Arc<StoryData>,
    revision: u64,
}

impl StoryState {
    /// Start a session from input data, rejecting data that already breaks
    /// an invariant.
    pub fn new(data: StoryData) -> Result<Self, StoryError> {
        data.validate().map_err(StoryError::InvalidStory)?;
        Ok(Self {
            data: Arc::new(data),
            revision: 0,
        })
    }

    /// Number of patches committed so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The current story.
    pub fn data(&self) -> &StoryData {
        &self.data
    }

    /// Hand the final story back to the caller.
    pub fn into_data(self) -> StoryData {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Read-only snapshot of the current revision.
    pub fn view(&self) -> StoryView {
        StoryView {
            data: Arc::clone(&self.data),
            revision: self.revision,
        }
    }

    /// Validate and commit a patch, returning the new revision.
    ///
    /// The patch is applied to a private copy; the state only changes once
    /// every change applied and the result passed validation. Empty patches
    /// commit nothing.
    pub fn apply(&mut self, patch: &StoryPatch) -> Result<u64, StoryError> {
        if patch.is_empty() {
            return Ok(self.revision);
        }

        let mut next = (*self.data).clone();
        for change in &patch.changes {
            change.apply_to(&mut next)?;
        }
        next.validate()?;

        self.data = Arc::new(next);
        self.revision += 1;
        Ok(self.revision)
    }
}

/// Immutable snapshot of one committed revision.
#[derive(Debug, Clone)]
pub struct StoryView {
    data: Arc<StoryData>,
    revision: u64,
}

impl StoryView {
    /// Revision this snapshot was taken at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn data(&self) -> &StoryData {
        &self.data
    }
}

impl Deref for StoryView {
    type Target = StoryData;

    fn deref(&self) -> &StoryData {
        &self.data
    }
}
