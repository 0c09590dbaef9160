//! Lead editor: decomposes a request, delegates to specialists and merges
//! their patches into the story.
//!
//! A run moves through [`LeadPhase::Decomposed`], [`LeadPhase::Dispatched`]
//! and [`LeadPhase::Merging`] to [`LeadPhase::Done`] or
//! [`LeadPhase::Failed`].
//!
//! Sub-tasks are dispatched in waves. A wave holds the next sub-task of every
//! target whose previous sub-task has already merged, so two tasks on the
//! same target never run concurrently and the later one sees the earlier
//! one's result. Results are held until every sub-task before them in story
//! order has merged, then merged strictly by ordinal. Merging never awaits,
//! so dropping a run future keeps what was merged and discards held results.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EditorConfig;
use crate::inference::{Inference, Prompt, TokenUsage};
use crate::prompts::{feedback_system_prompt, feedback_task_prompt, Specialty};
use crate::specialist::{EditResult, SpecialistEditorAgent, SpecialistError, Subtask};
use crate::story::{name_key, StoryError, StoryState, StoryView, Target, TargetKind, Violation};

/// Words that put the story as a whole in scope of a free-text request.
const NARRATIVE_KEYWORDS: &[&str] = &["story", "narrative", "plot", "theme", "ending", "opening"];

const CHILDRENS_KEYWORDS: &[&str] = &["children", "kids", "picture book", "bedtime"];

const NOVEL_KEYWORDS: &[&str] = &["novel", "chapter"];

/// Errors that end a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LeadEditorError {
    /// No sub-task could be derived from the request.
    #[error("request names nothing in the story to edit")]
    EmptyDecomposition,

    /// Nothing was merged. The report carries every failure.
    #[error("all {} sub-tasks failed", .report.outcomes.len())]
    AllSubtasksFailed { report: Box<EditReport> },
}

/// One instruction aimed at a known target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    /// What to edit.
    pub target: Target,
    /// What to do with it, in the author's words.
    pub instruction: String,
}

impl Directive {
    /// Create a directive for `target`.
    pub fn new(target: Target, instruction: impl Into<String>) -> Self {
        Self {
            target,
            instruction: instruction.into(),
        }
    }
}

/// The content of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestBody {
    /// Free text; targets are found by name.
    Text(String),
    /// Explicit target and instruction pairs.
    Structured(Vec<Directive>),
}

/// A caller's editing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    /// Free text or structured directives.
    pub body: RequestBody,
    /// Overrides keyword-based specialty selection.
    #[serde(default)]
    pub specialty: Option<Specialty>,
}

impl EditRequest {
    /// A free-text request such as "Give Mira a secret".
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: RequestBody::Text(text.into()),
            specialty: None,
        }
    }

    /// A request made of explicit directives.
    pub fn structured(directives: Vec<Directive>) -> Self {
        Self {
            body: RequestBody::Structured(directives),
            specialty: None,
        }
    }

    /// Pin the specialty instead of classifying the request.
    pub fn with_specialty(mut self, specialty: Specialty) -> Self {
        self.specialty = Some(specialty);
        self
    }

    /// The request as a single piece of text.
    pub fn describe(&self) -> String {
        match &self.body {
            RequestBody::Text(text) => text.clone(),
            RequestBody::Structured(directives) => directives
                .iter()
                .map(|d| format!("{}: {}", d.target, d.instruction))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadPhase {
    Decomposed,
    Dispatched,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for LeadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeadPhase::Decomposed => "decomposed",
            LeadPhase::Dispatched => "dispatched",
            LeadPhase::Merging => "merging",
            LeadPhase::Done => "done",
            LeadPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a sub-task left no mark on the story.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubtaskFailure {
    /// The specialist produced no patch.
    #[error(transparent)]
    Specialist(#[from] SpecialistError),

    /// The patch broke a story invariant and was not applied.
    #[error("patch rejected: {0}")]
    InvalidPatch(Violation),
}

impl Serialize for SubtaskFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What became of one sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Merged. `revision` is the story revision after the merge; an empty
    /// patch leaves it where it was.
    Applied { revision: u64, changes: usize },
    Failed(SubtaskFailure),
}

/// A sub-task paired with its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtaskOutcome {
    /// The sub-task as dispatched.
    pub subtask: Subtask,
    /// Whether and where it merged.
    pub status: OutcomeStatus,
}

impl SubtaskOutcome {
    /// Whether the patch was merged.
    pub fn is_applied(&self) -> bool {
        matches!(self.status, OutcomeStatus::Applied { .. })
    }

    /// The failure, if the sub-task failed.
    pub fn failure(&self) -> Option<&SubtaskFailure> {
        match &self.status {
            OutcomeStatus::Failed(failure) => Some(failure),
            OutcomeStatus::Applied { .. } => None,
        }
    }
}

/// Summary of one run, with one outcome per sub-task in decomposition order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditReport {
    /// Unique id of the run, also recorded on its tracing span.
    pub run_id: Uuid,
    /// `Done`, or `Failed` when nothing merged.
    pub phase: LeadPhase,
    /// Specialty every specialist of the run worked in.
    pub specialty: Specialty,
    /// Story revision when the run started.
    pub revision_before: u64,
    /// Story revision when the run ended.
    pub revision_after: u64,
    /// One outcome per sub-task, by ordinal.
    pub outcomes: Vec<SubtaskOutcome>,
    /// The lead's closing feedback, when requested and available.
    pub feedback: Option<String>,
    /// Tokens the inference backend reported while the run was active.
    pub usage: TokenUsage,
    /// When the run ended.
    pub finished_at: DateTime<Utc>,
}

impl EditReport {
    /// Outcomes whose patches merged.
    pub fn applied(&self) -> impl Iterator<Item = &SubtaskOutcome> {
        self.outcomes.iter().filter(|o| o.is_applied())
    }

    /// Outcomes that failed.
    pub fn failed(&self) -> impl Iterator<Item = &SubtaskOutcome> {
        self.outcomes.iter().filter(|o| !o.is_applied())
    }
}

/// The editor that owns a run. It is the only writer of the story.
#[derive(Clone)]
pub struct LeadEditorAgent {
    config: EditorConfig,
    inference: Arc<dyn Inference>,
}

impl LeadEditorAgent {
    /// Create a lead that delegates to specialists sharing `inference`.
    pub fn new(config: EditorConfig, inference: Arc<dyn Inference>) -> Self {
        Self { config, inference }
    }

    /// The configuration passed to every specialist.
    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    /// Apply `request` to `state`.
    ///
    /// Sub-task failures are reported, not raised; the run fails only when
    /// nothing could be decomposed or every sub-task failed, and in both
    /// cases `state` is left as it was.
    #[tracing::instrument(skip_all, fields(run_id = tracing::field::Empty, revision = state.revision()))]
    pub async fn run(
        &self,
        request: &EditRequest,
        state: &mut StoryState,
    ) -> Result<EditReport, LeadEditorError> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let revision_before = state.revision();
        let usage_before = self.inference.usage();

        let subtasks = self.decompose(request, &state.view()).inspect_err(|error| {
            warn!(phase = %LeadPhase::Failed, %error, "nothing to dispatch");
        })?;
        let specialty = self.classify_specialty(request);
        info!(phase = %LeadPhase::Decomposed, subtasks = subtasks.len(), %specialty, "request decomposed");

        let specialist = SpecialistEditorAgent::new(specialty, self.config.clone(), Arc::clone(&self.inference));
        let mut outcomes = Vec::with_capacity(subtasks.len());
        let mut schedule = Schedule::new(subtasks);

        for index in 0.. {
            let wave = schedule.next_wave();
            if wave.is_empty() {
                break;
            }
            let view = state.view();
            info!(phase = %LeadPhase::Dispatched, wave = index, tasks = wave.len(), revision = view.revision(), "dispatching wave");

            let results: Vec<(Subtask, EditResult)> = stream::iter(wave.into_iter().map(|task| {
                let specialist = &specialist;
                let view = &view;
                async move {
                    let result = self.dispatch(specialist, &task, view).await;
                    (task, result)
                }
            }))
            .buffered(self.config.max_concurrent_specialists.max(1))
            .collect()
            .await;

            for (task, result) in results {
                schedule.hold(task, result);
            }
            let ready = schedule.release();
            info!(phase = %LeadPhase::Merging, wave = index, merging = ready.len(), "merging results");
            for (task, result) in ready {
                outcomes.push(merge(state, task, result));
            }
        }

        let applied = outcomes.iter().filter(|o| o.is_applied()).count();
        let failed = outcomes.len() - applied;

        let mut report = EditReport {
            run_id,
            phase: LeadPhase::Done,
            specialty,
            revision_before,
            revision_after: state.revision(),
            outcomes,
            feedback: None,
            usage: self.inference.usage().since(usage_before),
            finished_at: Utc::now(),
        };

        if applied == 0 {
            report.phase = LeadPhase::Failed;
            warn!(phase = %LeadPhase::Failed, failed, "every sub-task failed");
            return Err(LeadEditorError::AllSubtasksFailed {
                report: Box::new(report),
            });
        }

        info!(phase = %LeadPhase::Done, applied, failed, revision = state.revision(), "run finished");

        if self.config.request_feedback {
            report.feedback = self.feedback(request, applied, failed, &state.view()).await;
            report.usage = self.inference.usage().since(usage_before);
        }
        Ok(report)
    }

    /// Split a request into sub-tasks in story order.
    ///
    /// Structured directives keep their targets, including ones the story
    /// does not have; those sort last and fail at the specialist. Free text
    /// yields one sub-task per character or scene it mentions by name, plus
    /// one for the narrative when it talks about the story as a whole.
    pub fn decompose(&self, request: &EditRequest, view: &StoryView) -> Result<Vec<Subtask>, LeadEditorError> {
        let specialty = self.classify_specialty(request);

        let mut directives = match &request.body {
            RequestBody::Structured(directives) => directives.clone(),
            RequestBody::Text(text) => {
                let characters = view
                    .characters
                    .iter()
                    .filter(|c| mentions(text, &c.name))
                    .map(|c| Target::character(c.name.as_str()));
                let scenes = view
                    .scenes
                    .iter()
                    .filter(|s| mentions(text, &s.location))
                    .map(|s| Target::scene(s.location.as_str()));
                let narrative = NARRATIVE_KEYWORDS
                    .iter()
                    .any(|k| mentions(text, k))
                    .then_some(Target::Narrative);

                characters
                    .chain(scenes)
                    .chain(narrative)
                    .map(|target| Directive::new(target, text.as_str()))
                    .collect()
            }
        };

        if directives.is_empty() {
            return Err(LeadEditorError::EmptyDecomposition);
        }

        directives.sort_by_key(|d| view.story_rank(&d.target).unwrap_or((u8::MAX, 0)));

        let subtasks: Vec<Subtask> = directives
            .into_iter()
            .enumerate()
            .map(|(ordinal, d)| Subtask {
                ordinal,
                target: d.target,
                instruction: d.instruction,
                specialty,
            })
            .collect();
        debug!(targets = ?subtasks.iter().map(|t| t.target.to_string()).collect::<Vec<_>>(), "decomposed");
        Ok(subtasks)
    }

    /// The request's own hint, else keywords, else the configured default.
    pub fn classify_specialty(&self, request: &EditRequest) -> Specialty {
        if let Some(specialty) = request.specialty {
            return specialty;
        }

        let lower = request.describe().to_lowercase();
        if CHILDRENS_KEYWORDS.iter().any(|k| lower.contains(k)) {
            Specialty::ChildrensBooks
        } else if NOVEL_KEYWORDS.iter().any(|k| lower.contains(k)) {
            Specialty::Novels
        } else {
            self.config.default_specialty
        }
    }

    /// Run one sub-task, retrying while inference is unavailable for a
    /// reason that may pass.
    async fn dispatch(&self, specialist: &SpecialistEditorAgent, task: &Subtask, view: &StoryView) -> EditResult {
        let mut attempt = 0;
        loop {
            match specialist.run(task, view).await {
                Err(SpecialistError::InferenceUnavailable(error))
                    if error.is_transient() && attempt < self.config.inference_retries =>
                {
                    attempt += 1;
                    warn!(ordinal = task.ordinal, attempt, %error, "inference unavailable, retrying");
                }
                result => return result,
            }
        }
    }

    async fn feedback(&self, request: &EditRequest, applied: usize, failed: usize, view: &StoryView) -> Option<String> {
        let prompt = Prompt::new(
            feedback_system_prompt(&self.config),
            feedback_task_prompt(&request.describe(), applied, failed),
            &self.config,
        );

        match tokio::time::timeout(self.config.inference_timeout, self.inference.infer(&prompt, view)).await {
            Ok(Ok(text)) => Some(text.trim().to_string()),
            Ok(Err(error)) => {
                warn!(%error, "feedback unavailable");
                None
            }
            Err(_) => {
                warn!("feedback timed out");
                None
            }
        }
    }
}

type TargetKey = (TargetKind, String);

/// Decides which sub-tasks may be dispatched and when finished results may
/// merge.
struct Schedule {
    /// Sub-tasks not yet dispatched, per target, in ordinal order.
    queues: Vec<(TargetKey, VecDeque<Subtask>)>,
    /// Targets with a sub-task dispatched but not yet merged.
    in_progress: HashSet<TargetKey>,
    /// Finished results waiting for every earlier ordinal to merge.
    held: BTreeMap<usize, (Subtask, EditResult)>,
    next_ordinal: usize,
}

impl Schedule {
    /// `subtasks` must carry ordinals `0..n`.
    fn new(subtasks: Vec<Subtask>) -> Self {
        let mut queues: Vec<(TargetKey, VecDeque<Subtask>)> = Vec::new();
        for task in subtasks {
            let key = task.target.key();
            match queues.iter_mut().find(|(k, _)| *k == key) {
                Some((_, queue)) => queue.push_back(task),
                None => queues.push((key, VecDeque::from([task]))),
            }
        }

        Self {
            queues,
            in_progress: HashSet::new(),
            held: BTreeMap::new(),
            next_ordinal: 0,
        }
    }

    /// The next sub-task of every target with nothing in progress, by
    /// ordinal. Empty once everything has merged.
    fn next_wave(&mut self) -> Vec<Subtask> {
        let mut wave = Vec::new();
        for (key, queue) in &mut self.queues {
            if self.in_progress.contains(key) {
                continue;
            }
            if let Some(task) = queue.pop_front() {
                self.in_progress.insert(key.clone());
                wave.push(task);
            }
        }
        wave.sort_by_key(|t| t.ordinal);
        wave
    }

    fn hold(&mut self, task: Subtask, result: EditResult) {
        self.held.insert(task.ordinal, (task, result));
    }

    /// Held results whose predecessors have all been released, by ordinal.
    /// The caller merges each before asking for the next wave.
    fn release(&mut self) -> Vec<(Subtask, EditResult)> {
        let mut ready = Vec::new();
        while let Some((task, result)) = self.held.remove(&self.next_ordinal) {
            self.in_progress.remove(&task.target.key());
            self.next_ordinal += 1;
            ready.push((task, result));
        }
        ready
    }
}

fn merge(state: &mut StoryState, subtask: Subtask, result: EditResult) -> SubtaskOutcome {
    let status = match result {
        Ok(patch) => match state.apply(&patch) {
            Ok(revision) => {
                debug!(ordinal = subtask.ordinal, revision, changes = patch.len(), "patch merged");
                OutcomeStatus::Applied {
                    revision,
                    changes: patch.len(),
                }
            }
            Err(StoryError::InvalidPatch(violation) | StoryError::InvalidStory(violation)) => {
                warn!(ordinal = subtask.ordinal, %violation, "patch rejected");
                OutcomeStatus::Failed(SubtaskFailure::InvalidPatch(violation))
            }
        },
        Err(error) => {
            warn!(ordinal = subtask.ordinal, %error, "sub-task failed");
            OutcomeStatus::Failed(SubtaskFailure::Specialist(error))
        }
    };
    SubtaskOutcome { subtask, status }
}

/// Case-insensitive whole-word match of `name` in `text`.
fn mentions(text: &str, name: &str) -> bool {
    let needle = name_key(name);
    if needle.is_empty() {
        return false;
    }
    let haystack = text.to_lowercase();
    haystack.match_indices(needle.as_str()).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
