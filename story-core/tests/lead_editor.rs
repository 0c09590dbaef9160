//! End-to-end runs of the lead editor against scripted inference.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use story_core::{
    sample_story, Directive, EditRequest, EditorConfig, InferenceError, LeadEditorAgent,
    LeadEditorError, LeadPhase, OutcomeStatus, ScriptedInference, ScriptedReply, SpecialistError,
    StoryState, SubtaskFailure, Target, TokenUsage, Violation,
};

const MIRA: &str = "## Target\ncharacter 'Mira'";
const TOBIAS: &str = "## Target\ncharacter 'Tobias'";
const HARBOR: &str = "## Target\nscene 'Harbor'";
const NARRATIVE: &str = "## Target\nthe narrative";
const FEEDBACK: &str = "The author asked";

fn edits(edits: serde_json::Value) -> String {
    json!({ "edits": edits }).to_string()
}

fn revise(name: &str, key: &str, value: &str) -> String {
    edits(json!([{ "tool": "revise_character", "input": { "name": name, "attributes": { key: value } } }]))
}

fn rename(name: &str, new_name: &str) -> String {
    edits(json!([{ "tool": "rename_character", "input": { "name": name, "new_name": new_name } }]))
}

fn narrative(text: &str) -> String {
    edits(json!([{ "tool": "revise_narrative", "input": { "text": text } }]))
}

fn state() -> StoryState {
    StoryState::new(sample_story()).unwrap()
}

fn lead(config: EditorConfig, inference: &Arc<ScriptedInference>) -> LeadEditorAgent {
    LeadEditorAgent::new(config, inference.clone())
}

#[tokio::test]
async fn test_partial_failure_merges_the_rest() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, revise("Mira", "secret", "she lit the false beacon"))
            .reply(TOBIAS, "Sorry, I can't help with that.")
            .reply(NARRATIVE, narrative("The storm took more than boats.")),
    );
    let mut state = state();

    let report = lead(EditorConfig::default(), &inference)
        .run(&EditRequest::text("Darken the ending: Mira suspects Tobias"), &mut state)
        .await
        .unwrap();

    assert_eq!(report.phase, LeadPhase::Done);
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.applied().count(), 2);
    assert_eq!(report.revision_before, 0);
    assert_eq!(report.revision_after, 2);

    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].subtask.target, Target::character("Tobias"));
    assert!(matches!(
        failed[0].failure(),
        Some(SubtaskFailure::Specialist(SpecialistError::MalformedResponse { .. }))
    ));

    let data = state.data();
    assert_eq!(data.character("Mira").unwrap().attribute("secret"), Some("she lit the false beacon"));
    assert_eq!(data.character("Tobias").unwrap().attribute("motivation"), Some("pay off an old debt"));
    assert_eq!(data.narrative, "The storm took more than boats.");
}

#[tokio::test(start_paused = true)]
async fn test_merge_order_ignores_completion_order() {
    async fn run_with_delays(delays: [u64; 3]) -> Vec<OutcomeStatus> {
        let inference = Arc::new(
            ScriptedInference::new()
                .reply_after(MIRA, Duration::from_millis(delays[0]), revise("Mira", "age", "40"))
                .reply_after(TOBIAS, Duration::from_millis(delays[1]), revise("Tobias", "age", "52"))
                .reply_after(NARRATIVE, Duration::from_millis(delays[2]), narrative("Rewritten.")),
        );
        let mut state = state();
        let report = lead(EditorConfig::default(), &inference)
            .run(&EditRequest::text("Mira and Tobias need ages; tighten the story"), &mut state)
            .await
            .unwrap();
        report.outcomes.into_iter().map(|o| o.status).collect()
    }

    let slow_first = run_with_delays([300, 200, 100]).await;
    let slow_last = run_with_delays([100, 200, 300]).await;

    let expected: Vec<OutcomeStatus> = (1..=3)
        .map(|revision| OutcomeStatus::Applied { revision, changes: 1 })
        .collect();
    assert_eq!(slow_first, expected);
    assert_eq!(slow_last, expected);
}

#[tokio::test]
async fn test_all_failures_leave_state_unchanged() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, "not json")
            .fail(NARRATIVE, InferenceError::Unavailable("overloaded".to_string())),
    );
    let mut state = state();
    let before = state.data().clone();

    let err = lead(EditorConfig::default(), &inference)
        .run(&EditRequest::text("Rework Mira and the plot"), &mut state)
        .await
        .unwrap_err();

    match err {
        LeadEditorError::AllSubtasksFailed { report } => {
            assert_eq!(report.phase, LeadPhase::Failed);
            assert_eq!(report.outcomes.len(), 2);
            assert_eq!(report.revision_after, 0);
        }
        other => panic!("expected AllSubtasksFailed, got {other:?}"),
    }
    assert_eq!(state.data(), &before);
    assert_eq!(state.revision(), 0);
}

#[tokio::test]
async fn test_duplicate_introduction_is_rejected() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, revise("Mira", "fear", "open water"))
            .reply(
                NARRATIVE,
                edits(json!([{ "tool": "introduce_character", "input": { "name": "tobias" } }])),
            ),
    );
    let mut state = state();

    let report = lead(EditorConfig::default(), &inference)
        .run(&EditRequest::text("Give Mira a fear, and add a twin to the story"), &mut state)
        .await
        .unwrap();

    let failure = report.failed().next().and_then(|o| o.failure()).cloned();
    assert_eq!(
        failure,
        Some(SubtaskFailure::InvalidPatch(Violation::DuplicateCharacter("tobias".to_string())))
    );
    assert_eq!(state.data().character_names(), vec!["Mira", "Tobias"]);
    assert_eq!(state.revision(), 1);
}

#[tokio::test]
async fn test_same_target_tasks_run_in_sequence() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, revise("Mira", "fear", "storms"))
            .reply(MIRA, revise("Mira", "fear", "silence")),
    );
    let mut state = state();
    let request = EditRequest::structured(vec![
        Directive::new(Target::character("Mira"), "Give her a fear"),
        Directive::new(Target::character("Mira"), "Make the fear stranger"),
    ]);

    let report = lead(EditorConfig::default(), &inference)
        .run(&request, &mut state)
        .await
        .unwrap();

    assert_eq!(report.applied().count(), 2);
    let calls = inference.calls();
    assert_eq!(calls.iter().map(|c| c.revision).collect::<Vec<_>>(), vec![0, 1]);
    assert!(!calls[0].user.contains("- fear: storms"));
    assert!(calls[1].user.contains("- fear: storms"));
    assert_eq!(state.data().character("Mira").unwrap().attribute("fear"), Some("silence"));
}

#[tokio::test]
async fn test_rename_hides_target_from_later_wave() {
    let inference = Arc::new(ScriptedInference::new().reply(
        MIRA,
        edits(json!([{ "tool": "rename_character", "input": { "name": "Mira", "new_name": "Mirabel" } }])),
    ));
    let mut state = state();
    let request = EditRequest::structured(vec![
        Directive::new(Target::character("Mira"), "A longer name"),
        Directive::new(Target::character("Mira"), "A scar"),
    ]);

    let report = lead(EditorConfig::default(), &inference)
        .run(&request, &mut state)
        .await
        .unwrap();

    assert_eq!(
        report.outcomes[1].failure(),
        Some(&SubtaskFailure::Specialist(SpecialistError::TargetNotFound {
            target: Target::character("Mira")
        }))
    );
    assert_eq!(inference.call_count(), 1);
    assert_eq!(state.data().character_names(), vec!["Mirabel", "Tobias"]);
}

#[tokio::test]
async fn test_later_target_merges_after_earlier_target_finishes() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, revise("Mira", "scar", "left hand"))
            .reply(MIRA, rename("Mira", "Sam"))
            .reply(TOBIAS, rename("Tobias", "Sam")),
    );
    let mut state = state();
    let request = EditRequest::structured(vec![
        Directive::new(Target::character("Mira"), "Give her a scar"),
        Directive::new(Target::character("Mira"), "Call her Sam"),
        Directive::new(Target::character("Tobias"), "Call him Sam"),
    ]);

    let report = lead(EditorConfig::default(), &inference)
        .run(&request, &mut state)
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, OutcomeStatus::Applied { revision: 1, changes: 1 });
    assert_eq!(report.outcomes[1].status, OutcomeStatus::Applied { revision: 2, changes: 1 });
    assert_eq!(
        report.outcomes[2].failure(),
        Some(&SubtaskFailure::InvalidPatch(Violation::DuplicateCharacter("Sam".to_string())))
    );
    assert_eq!(state.data().character_names(), vec!["Sam", "Tobias"]);
    assert_eq!(state.data().character("Sam").unwrap().attribute("scar"), Some("left hand"));
    assert_eq!(state.revision(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_reported_as_unavailable() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply_after(MIRA, Duration::from_secs(120), revise("Mira", "age", "40"))
            .reply(TOBIAS, revise("Tobias", "age", "52")),
    );
    let config = EditorConfig::default().with_inference_timeout(Duration::from_secs(10));
    let mut state = state();

    let report = lead(config, &inference)
        .run(&EditRequest::text("Ages for Mira and Tobias"), &mut state)
        .await
        .unwrap();

    assert_eq!(
        report.outcomes[0].failure(),
        Some(&SubtaskFailure::Specialist(SpecialistError::InferenceUnavailable(
            InferenceError::Timeout(Duration::from_secs(10))
        )))
    );
    assert!(report.outcomes[1].is_applied());
}

#[tokio::test]
async fn test_unavailable_inference_is_retried() {
    let unavailable = || InferenceError::Unavailable("overloaded".to_string());
    let inference = Arc::new(
        ScriptedInference::new()
            .fail(MIRA, unavailable())
            .fail(MIRA, unavailable())
            .reply(MIRA, revise("Mira", "age", "40")),
    );
    let mut state = state();

    let report = lead(EditorConfig::default().with_inference_retries(2), &inference)
        .run(&EditRequest::text("Mira's age"), &mut state)
        .await
        .unwrap();

    assert!(report.outcomes[0].is_applied());
    assert_eq!(inference.call_count(), 3);
}

#[tokio::test]
async fn test_retries_run_out() {
    let unavailable = || InferenceError::Unavailable("overloaded".to_string());
    let inference = Arc::new(
        ScriptedInference::new()
            .fail(MIRA, unavailable())
            .fail(MIRA, unavailable())
            .reply(TOBIAS, revise("Tobias", "age", "52")),
    );
    let mut state = state();

    let report = lead(EditorConfig::default().with_inference_retries(1), &inference)
        .run(&EditRequest::text("Ages for Mira and Tobias"), &mut state)
        .await
        .unwrap();

    assert!(!report.outcomes[0].is_applied());
    assert_eq!(inference.call_count(), 3);
}

#[tokio::test]
async fn test_lasting_inference_failures_are_not_retried() {
    let not_configured = || InferenceError::NotConfigured("ANTHROPIC_API_KEY not set".to_string());
    let inference = Arc::new(
        ScriptedInference::new()
            .fail(MIRA, not_configured())
            .fail(MIRA, not_configured())
            .fail(MIRA, not_configured())
            .fail(TOBIAS, InferenceError::Rejected("API error 400: bad request".to_string()))
            .reply(TOBIAS, revise("Tobias", "age", "52")),
    );
    let mut state = state();

    let err = lead(EditorConfig::default().with_inference_retries(2), &inference)
        .run(&EditRequest::text("Ages for Mira and Tobias"), &mut state)
        .await
        .unwrap_err();

    let LeadEditorError::AllSubtasksFailed { report } = err else {
        panic!("expected AllSubtasksFailed");
    };
    assert_eq!(
        report.outcomes[0].failure(),
        Some(&SubtaskFailure::Specialist(SpecialistError::InferenceUnavailable(not_configured())))
    );
    assert!(!report.outcomes[1].is_applied());
    assert_eq!(inference.call_count(), 2);
    assert_eq!(state.revision(), 0);
}

#[tokio::test]
async fn test_malformed_response_is_not_retried() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, "garbage")
            .reply(MIRA, revise("Mira", "age", "40"))
            .reply(HARBOR, edits(json!([{ "tool": "revise_scene", "input": { "location": "Harbor", "summary": "Fog." } }]))),
    );
    let mut state = state();

    let report = lead(EditorConfig::default().with_inference_retries(3), &inference)
        .run(&EditRequest::text("Mira at the harbor"), &mut state)
        .await
        .unwrap();

    assert!(!report.outcomes[0].is_applied());
    assert!(report.outcomes[1].is_applied());
    assert_eq!(inference.call_count(), 2);
    assert_eq!(state.data().scene("harbor").unwrap().summary, "Fog.");
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_within_a_wave() {
    async fn elapsed_with_limit(limit: usize) -> Duration {
        let delay = Duration::from_secs(5);
        let inference = Arc::new(
            ScriptedInference::new()
                .reply_after(MIRA, delay, revise("Mira", "age", "40"))
                .reply_after(TOBIAS, delay, revise("Tobias", "age", "52"))
                .reply_after(NARRATIVE, delay, narrative("Rewritten.")),
        );
        let config = EditorConfig::default().with_max_concurrent_specialists(limit);
        let mut state = state();

        let start = tokio::time::Instant::now();
        lead(config, &inference)
            .run(&EditRequest::text("Mira, Tobias and the plot"), &mut state)
            .await
            .unwrap();
        start.elapsed()
    }

    assert!(elapsed_with_limit(3).await < Duration::from_secs(6));
    assert!(elapsed_with_limit(1).await >= Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_leaves_state_unchanged() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply_after(MIRA, Duration::from_secs(30), revise("Mira", "age", "40"))
            .reply(NARRATIVE, narrative("Rewritten.")),
    );
    let mut state = state();
    let before = state.data().clone();
    let lead = lead(EditorConfig::default(), &inference);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        lead.run(&EditRequest::text("Mira and the story"), &mut state),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(state.data(), &before);
    assert_eq!(state.revision(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_completed_waves() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, revise("Mira", "age", "40"))
            .reply_after(MIRA, Duration::from_secs(30), revise("Mira", "age", "41")),
    );
    let mut state = state();
    let request = EditRequest::structured(vec![
        Directive::new(Target::character("Mira"), "An age"),
        Directive::new(Target::character("Mira"), "One year older"),
    ]);
    let lead = lead(EditorConfig::default(), &inference);

    let result = tokio::time::timeout(Duration::from_secs(5), lead.run(&request, &mut state)).await;

    assert!(result.is_err());
    assert_eq!(state.revision(), 1);
    assert_eq!(state.data().character("Mira").unwrap().attribute("age"), Some("40"));
}

#[tokio::test]
async fn test_empty_decomposition_calls_nothing() {
    let inference = Arc::new(ScriptedInference::new());
    let mut state = state();

    let err = lead(EditorConfig::default(), &inference)
        .run(&EditRequest::text("Make it pop"), &mut state)
        .await
        .unwrap_err();

    assert_eq!(err, LeadEditorError::EmptyDecomposition);
    assert_eq!(inference.call_count(), 0);
}

#[tokio::test]
async fn test_feedback_after_done() {
    let inference = Arc::new(
        ScriptedInference::new()
            .reply(MIRA, revise("Mira", "age", "40"))
            .reply(FEEDBACK, "  Promising, but the stakes are still vague.  "),
    );
    let mut state = state();

    let report = lead(EditorConfig::default().with_feedback(), &inference)
        .run(&EditRequest::text("Mira's age"), &mut state)
        .await
        .unwrap();

    assert_eq!(report.feedback.as_deref(), Some("Promising, but the stakes are still vague."));
    let feedback_call = inference.calls().pop().unwrap();
    assert!(feedback_call.user.contains("1 edit(s) were applied and 0 could not be applied"));
    assert_eq!(feedback_call.revision, 1);
}

#[tokio::test]
async fn test_feedback_failure_is_ignored() {
    let inference = Arc::new(ScriptedInference::new().reply(MIRA, revise("Mira", "age", "40")));
    let mut state = state();

    let report = lead(EditorConfig::default().with_feedback(), &inference)
        .run(&EditRequest::text("Mira's age"), &mut state)
        .await
        .unwrap();

    assert_eq!(report.phase, LeadPhase::Done);
    assert_eq!(report.feedback, None);
    assert_eq!(inference.call_count(), 2);
}

#[tokio::test]
async fn test_report_serializes() {
    let inference = Arc::new(ScriptedInference::new().reply(MIRA, "nope").reply(TOBIAS, revise("Tobias", "age", "52")));
    let mut state = state();

    let report = lead(EditorConfig::default(), &inference)
        .run(&EditRequest::text("Mira and Tobias"), &mut state)
        .await
        .unwrap();

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["phase"], "done");
    assert_eq!(value["outcomes"][1]["status"]["applied"]["revision"], 1);
    assert!(value["outcomes"][0]["status"]["failed"]
        .as_str()
        .unwrap()
        .starts_with("malformed response"));
}

#[tokio::test]
async fn test_report_sums_token_usage() {
    let inference = Arc::new(ScriptedInference::new());
    inference.push(MIRA, ScriptedReply::text(revise("Mira", "age", "40")).with_usage(100, 20));
    inference.push(TOBIAS, ScriptedReply::text("nope").with_usage(50, 10));
    inference.push(FEEDBACK, ScriptedReply::text("Fine.").with_usage(30, 5));
    let mut state = state();

    let report = lead(EditorConfig::default().with_feedback(), &inference)
        .run(&EditRequest::text("Ages for Mira and Tobias"), &mut state)
        .await
        .unwrap();

    assert_eq!(
        report.usage,
        TokenUsage {
            input_tokens: 180,
            output_tokens: 35
        }
    );
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["usage"]["input_tokens"], 180);
    assert_eq!(value["usage"]["output_tokens"], 35);
}
