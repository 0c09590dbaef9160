//! Lead and specialist AI editors that revise a shared story.
//!
//! This crate provides:
//! - A story model with atomic, validated patches
//! - A closed set of editing tools with JSON input schemas
//! - Specialist editors that propose patches for one target at a time
//! - A lead editor that decomposes requests, dispatches specialists and merges
//!   their work
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use story_core::{ClaudeInference, EditRequest, EditorConfig, LeadEditorAgent, StoryState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inference = Arc::new(ClaudeInference::from_env()?);
//!     let lead = LeadEditorAgent::new(EditorConfig::default(), inference);
//!
//!     let mut state = StoryState::new(story_core::testing::sample_story())?;
//!     let report = lead
//!         .run(&EditRequest::text("Give Mira a secret and darken the ending"), &mut state)
//!         .await?;
//!
//!     println!("revision {} -> {}", report.revision_before, report.revision_after);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod inference;
pub mod lead;
pub mod prompts;
pub mod specialist;
pub mod story;
pub mod testing;
pub mod tools;

// Primary public API
pub use config::EditorConfig;
pub use inference::{ClaudeInference, Inference, InferenceError, Prompt, TokenUsage};
pub use lead::{
    Directive, EditReport, EditRequest, LeadEditorAgent, LeadEditorError, LeadPhase, OutcomeStatus,
    RequestBody, SubtaskFailure, SubtaskOutcome,
};
pub use prompts::Specialty;
pub use specialist::{EditResult, SpecialistEditorAgent, SpecialistError, Subtask};
pub use story::{
    CharacterData, SceneData, StoryChange, StoryData, StoryError, StoryPatch, StoryState, StoryView,
    Target, TargetKind, Violation,
};
pub use testing::{sample_story, ScriptedInference, ScriptedReply};
pub use tools::{EditingTool, ToolError};
