//! Command implementations.
//!
//! Every command prints one JSON document to stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use checkpoint::FsCheckpointStore;
use llm::LlmClientFactory;
use nodes::PipelineOrchestrator;
use pipeline::{
    CheckpointEntry, CheckpointStore, CleanupPolicy, PipelineConfig, PipelineRun, RunId,
    RunSnapshot, RunStatus, Stage, StageError,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Used when neither `--config` nor `PLANFORGE_CONFIG` names a file.
pub const DEFAULT_CONFIG_PATH: &str = ".planforge/config.toml";

/// Exit status of a run interrupted by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Loads and validates the configuration.
///
/// An explicit path must exist; the default path is optional.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.is_file()),
    };
    let config = match &path {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading configuration {}", path.display()))?;
            PipelineConfig::from_toml_str(&source)
                .with_context(|| format!("parsing configuration {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    config.validate().context("validating configuration")?;
    info!(
        path = %path.as_deref().map_or_else(|| "<defaults>".to_string(), |p| p.display().to_string()),
        "Configuration loaded"
    );
    Ok(config)
}

/// Shared state of every command.
pub struct Session {
    config: Arc<PipelineConfig>,
    store: FsCheckpointStore,
}

impl Session {
    /// Opens the checkpoint store named by `config`.
    pub fn open(config: PipelineConfig) -> anyhow::Result<Self> {
        let store = FsCheckpointStore::open(&config.checkpoint.directory).with_context(|| {
            format!(
                "opening checkpoint directory {}",
                config.checkpoint.directory.display()
            )
        })?;
        Ok(Self {
            config: Arc::new(config),
            store,
        })
    }

    fn orchestrator(&self, cancel: CancellationToken) -> anyhow::Result<PipelineOrchestrator> {
        PipelineOrchestrator::builder(
            Arc::clone(&self.config),
            Arc::new(self.store.clone()),
            LlmClientFactory::default(),
        )
        .cancellation_token(cancel)
        .build()
        .context("building the pipeline")
    }
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling the run");
            token.cancel();
        }
    });
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("encoding output")?;
    println!("{text}");
    Ok(())
}

// ---------------------------------------------------------------------------
// run / resume
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: RunId,
    status: RunStatus,
    resumed_from: Option<Stage>,
    last_stage: Option<Stage>,
    last_error: Option<StageError>,
    retry_count: u32,
    checkpoints: PathBuf,
}

fn summarize(run: &PipelineRun, store: &FsCheckpointStore) -> RunSummary {
    let last = run.last_result();
    RunSummary {
        run_id: run.run_id,
        status: run.status,
        resumed_from: run.resumed_from,
        last_stage: last.map(|r| r.stage).or(run.current_stage),
        last_error: last.and_then(|r| r.error.clone()),
        retry_count: run.total_retries(),
        checkpoints: store.root().join(run.run_id.to_string()),
    }
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
        RunStatus::Running | RunStatus::Paused | RunStatus::Failed => ExitCode::FAILURE,
    }
}

/// `planforge run --input FILE`
pub async fn run(session: &Session, input: &Path) -> anyhow::Result<ExitCode> {
    let interview = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading interview {}", input.display()))?;
    if interview.trim().is_empty() {
        bail!("interview file {} is empty", input.display());
    }

    let cancel = CancellationToken::new();
    let orchestrator = session.orchestrator(cancel.clone())?;
    cancel_on_ctrl_c(cancel);

    let run_id = RunId::new_random();
    info!(run_id = %run_id, input = %input.display(), "Starting run");
    let run = orchestrator.run_with_id(run_id, &interview).await;
    print_json(&summarize(&run, &session.store))?;
    Ok(exit_code(run.status))
}

/// `planforge resume RUN_ID`
pub async fn resume(session: &Session, run_id: RunId) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    let orchestrator = session.orchestrator(cancel.clone())?;
    cancel_on_ctrl_c(cancel);

    let run = orchestrator
        .resume(run_id)
        .await
        .with_context(|| format!("resuming run {run_id}"))?;
    print_json(&summarize(&run, &session.store))?;
    Ok(exit_code(run.status))
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct LatestState {
    completed: Vec<Stage>,
    next_stage: Option<Stage>,
    last_error: Option<StageError>,
    known_risks: usize,
    phases: usize,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    run_id: RunId,
    checkpoints: Vec<CheckpointEntry>,
    latest: Option<LatestState>,
    latest_error: Option<String>,
}

fn latest_state(state: &RunSnapshot) -> LatestState {
    LatestState {
        completed: state.completed.clone(),
        next_stage: state.next_stage,
        last_error: state.last_result.as_ref().and_then(|r| r.error.clone()),
        known_risks: state.known_risks.len(),
        phases: state.phases.len(),
    }
}

/// `planforge status RUN_ID`
pub async fn status(session: &Session, run_id: RunId) -> anyhow::Result<ExitCode> {
    let checkpoints = session
        .store
        .list(run_id)
        .await
        .with_context(|| format!("listing checkpoints of run {run_id}"))?;
    let (latest, latest_error) = match session.store.load_latest(run_id).await {
        Ok(record) => (Some(latest_state(&record.state)), None),
        Err(e) => (None, Some(e.to_string())),
    };
    print_json(&StatusReport {
        run_id,
        checkpoints,
        latest,
        latest_error,
    })?;
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// export
// ---------------------------------------------------------------------------

/// Documents held by `state`, as `(file name, contents)`.
fn documents(state: &RunSnapshot) -> Vec<(String, String)> {
    let mut files = Vec::new();
    if let Some(design) = &state.design {
        files.push(("design.md".to_string(), design.clone()));
    }
    if let Some(devplan) = &state.devplan {
        files.push(("devplan.md".to_string(), devplan.clone()));
    }
    for (number, phase) in &state.phases {
        files.push((format!("phase-{number:02}.md"), phase.clone()));
    }
    if let Some(handoff) = &state.handoff {
        files.push(("handoff.md".to_string(), handoff.clone()));
    }
    files
}

/// `planforge export RUN_ID --dir DIR`
pub async fn export(session: &Session, run_id: RunId, dir: &Path) -> anyhow::Result<ExitCode> {
    let record = session
        .store
        .load_latest(run_id)
        .await
        .with_context(|| format!("loading latest checkpoint of run {run_id}"))?;
    let files = documents(&record.state);
    if files.is_empty() {
        bail!("run {run_id} has not produced any documents yet");
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let mut written = Vec::new();
    for (name, contents) in files {
        let path = dir.join(&name);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    info!(run_id = %run_id, files = written.len(), dir = %dir.display(), "Documents exported");
    print_json(&serde_json::json!({ "run_id": run_id, "written": written }))?;
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// cleanup
// ---------------------------------------------------------------------------

/// Picks the cleanup policy: explicit flags first, then `[checkpoint] keep_latest`,
/// otherwise every checkpoint.
pub fn cleanup_policy(
    keep: Option<usize>,
    older_than_hours: Option<u64>,
    config: &PipelineConfig,
) -> CleanupPolicy {
    match (keep, older_than_hours) {
        (Some(n), _) => CleanupPolicy::KeepLatest(n),
        (None, Some(hours)) => CleanupPolicy::OlderThan(Duration::from_secs(hours.saturating_mul(3600))),
        (None, None) => config
            .checkpoint
            .keep_latest
            .map_or(CleanupPolicy::All, CleanupPolicy::KeepLatest),
    }
}

/// `planforge cleanup RUN_ID [--keep N | --older-than-hours H]`
pub async fn cleanup(session: &Session, run_id: RunId, policy: CleanupPolicy) -> anyhow::Result<ExitCode> {
    let removed = session
        .store
        .delete(run_id, policy)
        .await
        .with_context(|| format!("cleaning up run {run_id}"))?;
    print_json(&serde_json::json!({ "run_id": run_id, "removed": removed }))?;
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// check-config
// ---------------------------------------------------------------------------

/// `planforge check-config`
pub fn check_config(config: &PipelineConfig) -> anyhow::Result<ExitCode> {
    let factory = LlmClientFactory::default();
    let clients: Vec<_> = Stage::ALL
        .into_iter()
        .filter(|stage| stage.uses_llm())
        .map(|stage| config.resolve_client(stage))
        .collect();
    let unsupported: Vec<String> = clients
        .iter()
        .filter(|c| !factory.supports(c.provider))
        .map(|c| format!("{} ({})", c.stage, c.provider))
        .collect();
    print_json(&serde_json::json!({
        "valid": unsupported.is_empty(),
        "max_concurrent_requests": config.max_concurrent_requests,
        "max_correction_iterations": config.max_correction_iterations,
        "checkpoint_directory": config.checkpoint.directory,
        "clients": clients,
        "unsupported_providers": unsupported,
    }))?;
    if unsupported.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn explicit_config_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_requests = 2\n[retry]\nmax_attempts = 6").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.max_concurrent_requests, 2);
        assert_eq!(config.retry.max_attempts, 6);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/planforge.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("reading configuration"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_requests = 0").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn cleanup_flags_take_precedence_over_configuration() {
        let mut config = PipelineConfig::default();
        assert_eq!(cleanup_policy(None, None, &config), CleanupPolicy::All);
        config.checkpoint.keep_latest = Some(2);
        assert_eq!(cleanup_policy(None, None, &config), CleanupPolicy::KeepLatest(2));
        assert_eq!(cleanup_policy(Some(5), None, &config), CleanupPolicy::KeepLatest(5));
        assert_eq!(
            cleanup_policy(None, Some(2), &config),
            CleanupPolicy::OlderThan(Duration::from_secs(7200))
        );
    }

    #[test]
    fn documents_are_named_in_phase_order() {
        let mut state = RunSnapshot::new("x");
        state.design = Some("d".into());
        state.phases.insert(10, "j".into());
        state.phases.insert(2, "b".into());
        let names: Vec<String> = documents(&state).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["design.md", "phase-02.md", "phase-10.md"]);
    }

    #[tokio::test]
    async fn status_reports_saved_checkpoints() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.checkpoint.directory = dir.path().to_path_buf();
        let session = Session::open(config).unwrap();
        let run_id = RunId::new_random();
        session
            .store
            .save(run_id, Stage::Interview, &RunSnapshot::new("x"))
            .await
            .unwrap();

        assert!(status(&session, run_id).await.is_ok());
        assert!(status(&session, RunId::new_random()).await.is_err());
    }
}
