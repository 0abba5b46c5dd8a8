use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use checkpoint::{FsCheckpointStore, MemoryCheckpointStore};
use llm::{LlmClientFactory, ScriptedClient, ScriptedReply};
use nodes::PipelineOrchestrator;
use pipeline::{
    CheckpointStore, CollaboratorError, ComplexityEstimator, ComplexityProfile, Confidence,
    ErrorKind, LlmClient, LlmError, NoopReviewer, PipelineConfig, PlanforgeError, ProviderKind,
    ResolvedClient, RunStatus, Stage, StructuredOutput,
};
use tempfile::TempDir;

const INTERVIEW: &str = "Households want a shared shopping list that works offline, \
    can be shared with a link, and sends a weekly summary email.";

const DESIGN: &str = "# Overview\n\nA shared shopping list for households with offline support, \
    simple sharing links and a weekly summary email. Lists sync when the device reconnects \
    and conflicting edits keep the most recent change. Accounts are optional and a list \
    can be opened from any browser using its link. The summary email lists items that \
    were bought and items that are still open for the week.\n\n# Architecture\n\n\
    A single web service backed by PostgreSQL as the primary database.\n";

fn conflicting_design() -> String {
    format!("{DESIGN}MongoDB is the primary datastore for shopping lists.\n")
}

fn correction_reply() -> String {
    format!(
        "{DESIGN}\n```json\n[{{\"issue_code\": \"consistency.multiple_databases\", \
         \"action\": \"removed\", \"before\": \"MongoDB is the primary datastore\", \"after\": \"\"}}]\n```\n"
    )
}

/// Always estimates a small project: minimal depth, three phases.
struct SmallProject;

#[async_trait]
impl ComplexityEstimator for SmallProject {
    async fn estimate(&self, _interview: &str) -> Result<ComplexityProfile, CollaboratorError> {
        Ok(ComplexityProfile::from_score(2.0, Confidence::saturating(0.9), "small household app"))
    }
}

fn factory(client: Arc<ScriptedClient>) -> LlmClientFactory {
    LlmClientFactory::new().register(
        ProviderKind::Command,
        move |_: &ResolvedClient, _: Option<String>| Ok(client.clone() as Arc<dyn LlmClient>),
    )
}

fn orchestrator(client: Arc<ScriptedClient>, store: Arc<dyn CheckpointStore>) -> PipelineOrchestrator {
    PipelineOrchestrator::builder(Arc::new(PipelineConfig::default()), store, factory(client))
        .estimator(Arc::new(SmallProject))
        .reviewer(Arc::new(NoopReviewer))
        .build()
        .unwrap()
}

/// Replies for devplan, the three phases and the handoff.
fn downstream(client: ScriptedClient) -> ScriptedClient {
    client
        .push_for(Stage::Devplan, ScriptedReply::text("## Phase 1: Lists\n## Phase 2: Sync\n## Phase 3: Email"))
        .push_for(Stage::PhaseExpansion, ScriptedReply::text("Build the list model."))
        .push_for(Stage::PhaseExpansion, ScriptedReply::text("Add offline sync."))
        .push_for(Stage::PhaseExpansion, ScriptedReply::text("Send weekly summaries."))
        .push_for(Stage::Handoff, ScriptedReply::text("# Handoff\n\nStart with phase 1."))
}

#[tokio::test(start_paused = true)]
async fn conflicting_databases_are_corrected_end_to_end() {
    let client = Arc::new(downstream(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::text(conflicting_design()))
            .push_for(Stage::Correct, ScriptedReply::text(correction_reply())),
    ));
    let store = Arc::new(MemoryCheckpointStore::new());
    let run = orchestrator(client.clone(), store.clone()).run(INTERVIEW).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.executed_stages(),
        vec![
            Stage::Interview,
            Stage::Complexity,
            Stage::Design,
            Stage::Validate,
            Stage::Correct,
            Stage::Devplan,
            Stage::PhaseExpansion,
            Stage::Handoff,
        ]
    );

    let state = store.load_latest(run.run_id).await.unwrap().state;
    let design = state.design.unwrap();
    assert!(!design.contains("MongoDB"));
    let report = state.validation.unwrap();
    assert!(report.is_valid);
    assert!(report.issues.is_empty());
    assert_eq!(state.corrections.len(), 1);
    assert_eq!(state.phases.len(), 3);
    assert!(state.handoff.unwrap().ends_with("## Known Risks\n\nNo known risks were recorded.\n"));
    assert_eq!(state.next_stage, None);

    let templates: Vec<String> = client
        .requests()
        .iter()
        .map(|r| r.template.as_str().to_string())
        .collect();
    assert_eq!(templates[0], "design/minimal");
    assert!(templates.contains(&"correct/minimal".to_string()));
}

#[tokio::test(start_paused = true)]
async fn validation_result_is_typed_for_downstream_consumers() {
    let client = Arc::new(downstream(
        ScriptedClient::new().push_for(Stage::Design, ScriptedReply::text(DESIGN)),
    ));
    let run = orchestrator(client, Arc::new(MemoryCheckpointStore::new()))
        .run(INTERVIEW)
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(!run.executed_stages().contains(&Stage::Correct));
    let validate = run.results.iter().find(|r| r.stage == Stage::Validate).unwrap();
    match &validate.structured_output {
        Some(StructuredOutput::Validation { report, review }) => {
            assert!(report.is_valid);
            assert!(review.is_some());
        }
        other => panic!("unexpected structured output {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unresolved_issues_become_known_risks() {
    // The corrector answers with the design unchanged and no change log.
    let client = Arc::new(downstream(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::text(conflicting_design()))
            .push_for(Stage::Correct, ScriptedReply::text(conflicting_design()))
            .push_for(Stage::Correct, ScriptedReply::text(conflicting_design()))
            .push_for(Stage::Correct, ScriptedReply::text(conflicting_design())),
    ));
    let store = Arc::new(MemoryCheckpointStore::new());
    let run = orchestrator(client, store.clone()).run(INTERVIEW).await;

    assert_eq!(run.status, RunStatus::Completed);
    let corrections = run.results.iter().filter(|r| r.stage == Stage::Correct).count();
    assert_eq!(corrections, 2, "stagnation ends the loop after two unchanged iterations");

    let last_correction = run.results.iter().rfind(|r| r.stage == Stage::Correct).unwrap();
    let error = last_correction.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::ValidationFailure);
    assert_eq!(error.message, "Design has 1 unresolved validation issue(s)");
    assert!(last_correction.is_success());
    assert!(run.last_result().unwrap().error.is_none());

    let handoff = store.load_latest(run.run_id).await.unwrap().state.handoff.unwrap();
    assert!(handoff.contains("- [correction] `consistency.multiple_databases`"));
}

#[tokio::test(start_paused = true)]
async fn valid_design_records_no_validation_failure() {
    let client = Arc::new(downstream(
        ScriptedClient::new().push_for(Stage::Design, ScriptedReply::text(DESIGN)),
    ));
    let run = orchestrator(client, Arc::new(MemoryCheckpointStore::new()))
        .run(INTERVIEW)
        .await;
    assert!(run.results.iter().all(|r| r.error.is_none()));
}

#[tokio::test(start_paused = true)]
async fn cancelled_correction_resumes_with_increasing_iteration_numbers() {
    // Iteration 1 changes nothing; iteration 2 stalls until cancelled.
    let first = Arc::new(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::text(conflicting_design()))
            .push_for(Stage::Correct, ScriptedReply::text(conflicting_design()))
            .push_for(Stage::Correct, ScriptedReply::Stalled(vec!["# Overview".into()])),
    );
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let cancelled = orchestrator(first.clone(), store.clone());
    let token = cancelled.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();
    });
    let run = cancelled.run(INTERVIEW).await;

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(first.calls(Stage::Correct), 2);
    let last = run.last_result().unwrap();
    assert_eq!(last.stage, Stage::Correct);
    match &last.structured_output {
        Some(StructuredOutput::Correction(iteration)) => assert_eq!(iteration.iteration_number, 1),
        other => panic!("unexpected structured output {other:?}"),
    }
    let saved = store.load_latest(run.run_id).await.unwrap().state;
    assert_eq!(saved.next_stage, Some(Stage::Correct));
    assert!(saved.corrections.is_empty());

    let second = Arc::new(downstream(
        ScriptedClient::new().push_for(Stage::Correct, ScriptedReply::text(correction_reply())),
    ));
    let resumed = orchestrator(second, store.clone()).resume(run.run_id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.resumed_from, Some(Stage::Correct));

    let state = store.load_latest(run.run_id).await.unwrap().state;
    let numbers: Vec<u32> = state.corrections.iter().map(|c| c.iteration_number).collect();
    assert_eq!(numbers, vec![1]);
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
    assert!(!state.design.unwrap().contains("MongoDB"));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_counted_on_the_stage() {
    let client = Arc::new(downstream(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::Error(LlmError::Transport("reset".into())))
            .push_for(Stage::Design, ScriptedReply::text(DESIGN)),
    ));
    let run = orchestrator(client, Arc::new(MemoryCheckpointStore::new()))
        .run(INTERVIEW)
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let design = run.results.iter().find(|r| r.stage == Stage::Design).unwrap();
    assert_eq!(design.retry_count, 1);
    assert_eq!(run.total_retries(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_run_resumes_exactly_at_devplan() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let first = Arc::new(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::text(DESIGN))
            .push_for(Stage::Devplan, ScriptedReply::Error(LlmError::InvalidRequest("context too long".into()))),
    );
    let failed = orchestrator(first, store.clone()).run(INTERVIEW).await;
    assert_eq!(failed.status, RunStatus::Failed);
    let last = failed.last_result().unwrap();
    assert_eq!(last.stage, Stage::Devplan);
    assert_eq!(last.error.as_ref().unwrap().kind, ErrorKind::Fatal);

    let second = Arc::new(downstream(ScriptedClient::new()));
    let resumed = orchestrator(second.clone(), store.clone())
        .resume(failed.run_id)
        .await
        .unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.resumed_from, Some(Stage::Devplan));
    assert_eq!(
        resumed.executed_stages(),
        vec![Stage::Devplan, Stage::PhaseExpansion, Stage::Handoff]
    );
    assert_eq!(second.calls(Stage::Design), 0);
    assert_eq!(second.calls(Stage::Complexity), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_keeps_partial_output() {
    let client = Arc::new(
        ScriptedClient::new().push_for(Stage::Design, ScriptedReply::Stalled(vec!["# Overview\nA shared".into()])),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = orchestrator(client.clone(), store.clone());

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();
    });
    let run = orchestrator.run(INTERVIEW).await;

    assert_eq!(run.status, RunStatus::Cancelled);
    let last = run.last_result().unwrap();
    assert_eq!(last.stage, Stage::Design);
    assert_eq!(last.raw_output, "# Overview\nA shared");
    assert_eq!(last.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(client.calls(Stage::Devplan), 0);

    // The cancelled stage is where a resume picks up.
    let state = store.load_latest(run.run_id).await.unwrap().state;
    assert_eq!(state.next_stage, Some(Stage::Design));
    assert!(state.has_completed(Stage::Complexity));
}

#[tokio::test(start_paused = true)]
async fn corrupted_latest_checkpoint_falls_back_to_previous() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = Arc::new(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::text(DESIGN))
            .push_for(Stage::Devplan, ScriptedReply::Error(LlmError::InvalidRequest("nope".into()))),
    );
    let failed = orchestrator(first, store.clone()).run(INTERVIEW).await;
    let entries = store.list(failed.run_id).await.unwrap();
    let latest = entries.last().unwrap().sequence;
    store.corrupt(failed.run_id, latest);

    let resumed = orchestrator(Arc::new(downstream(ScriptedClient::new())), store.clone())
        .resume(failed.run_id)
        .await
        .unwrap();
    // The record before the failed devplan is the validate checkpoint.
    assert_eq!(resumed.resumed_from, Some(Stage::Devplan));
    assert_eq!(resumed.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn resume_fails_when_no_checkpoint_is_readable() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let client = Arc::new(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::Error(LlmError::Authentication("revoked".into()))),
    );
    let failed = orchestrator(client, store.clone()).run(INTERVIEW).await;
    assert_eq!(failed.status, RunStatus::Failed);
    for entry in store.list(failed.run_id).await.unwrap() {
        store.corrupt(failed.run_id, entry.sequence);
    }

    let err = orchestrator(Arc::new(ScriptedClient::new()), store.clone())
        .resume(failed.run_id)
        .await
        .unwrap_err();
    assert!(matches!(err, PlanforgeError::CheckpointCorrupted { .. }));
}

#[tokio::test(start_paused = true)]
async fn failed_phase_keeps_siblings_for_resume() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FsCheckpointStore::open(dir.path()).unwrap());
    let first = Arc::new(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::text(DESIGN))
            .push_for(Stage::Devplan, ScriptedReply::text("## Phase 1\n## Phase 2\n## Phase 3"))
            .push_for(Stage::PhaseExpansion, ScriptedReply::text("one"))
            .push_for(Stage::PhaseExpansion, ScriptedReply::Error(LlmError::InvalidRequest("refused".into())))
            .push_for(Stage::PhaseExpansion, ScriptedReply::text("three")),
    );
    let failed = orchestrator(first, store.clone()).run(INTERVIEW).await;

    assert_eq!(failed.status, RunStatus::Failed);
    let last = failed.last_result().unwrap();
    assert_eq!(last.stage, Stage::PhaseExpansion);
    match &last.structured_output {
        Some(StructuredOutput::Phases(phases)) => assert_eq!(phases.len(), 2),
        other => panic!("unexpected structured output {other:?}"),
    }

    let second = Arc::new(
        ScriptedClient::new()
            .push_for(Stage::PhaseExpansion, ScriptedReply::text("retried"))
            .push_for(Stage::Handoff, ScriptedReply::text("# Handoff")),
    );
    let resumed = orchestrator(second.clone(), store.clone())
        .resume(failed.run_id)
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(second.calls(Stage::PhaseExpansion), 1);
    let state = store.load_latest(failed.run_id).await.unwrap().state;
    assert_eq!(state.phases.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn llm_review_risks_reach_the_handoff() {
    let review = r#"{"confidence": 0.7, "overall_assessment": "sound_with_concerns",
        "hallucinations": [], "risks": ["Email delivery depends on one provider"]}"#;
    let client = Arc::new(downstream(
        ScriptedClient::new()
            .push_for(Stage::Design, ScriptedReply::text(DESIGN))
            .push_for(Stage::Validate, ScriptedReply::text(review)),
    ));
    let store = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = PipelineOrchestrator::builder(
        Arc::new(PipelineConfig::default()),
        store.clone(),
        factory(client),
    )
    .estimator(Arc::new(SmallProject))
    .build()
    .unwrap();

    let run = orchestrator.run(INTERVIEW).await;
    assert_eq!(run.status, RunStatus::Completed);
    let handoff = store.load_latest(run.run_id).await.unwrap().state.handoff.unwrap();
    assert!(handoff.contains("- [sanity review] Email delivery depends on one provider"));
}

#[test]
fn missing_credential_is_reported_at_build_time() {
    let mut config = PipelineConfig::default();
    config.llm.credential = Some("PLANFORGE_TEST_UNSET_KEY".into());
    let result = PipelineOrchestrator::builder(
        Arc::new(config),
        Arc::new(MemoryCheckpointStore::new()),
        factory(Arc::new(ScriptedClient::new())).with_credential_source(|_: &str| None),
    )
    .build();
    assert!(matches!(result, Err(PlanforgeError::Credentials { .. })));
}
