//! Pipeline orchestration tests with a scripted phase launcher.
//!
//! The launcher plays the role of the per-phase subprocess: on success it
//! records the phase in the workflow's state file, exactly as a real phase run
//! would, so resume and skip behaviour is exercised end to end.

mod common;

use adw::config::Config;
use adw::phases::{PhaseName, PhaseOutcome};
use adw::pipeline::{PhaseLauncher, Pipeline, PipelineOrchestrator};
use adw::state::{TokenUsage, WorkflowState};
use anyhow::Result;
use async_trait::async_trait;
use common::{issue, FakeTracker};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ─── Scripted Launcher ───────────────────────────────────────────────────────

struct ScriptedLauncher {
    state_root: PathBuf,
    outcomes: HashMap<PhaseName, PhaseOutcome>,
    launched: Mutex<Vec<PhaseName>>,
}

impl ScriptedLauncher {
    fn new(state_root: &Path) -> Self {
        Self {
            state_root: state_root.to_path_buf(),
            outcomes: HashMap::new(),
            launched: Mutex::new(Vec::new()),
        }
    }

    fn with(mut self, phase: PhaseName, outcome: PhaseOutcome) -> Self {
        self.outcomes.insert(phase, outcome);
        self
    }

    fn launched(&self) -> Vec<PhaseName> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseLauncher for ScriptedLauncher {
    async fn launch(&self, phase: PhaseName, issue_number: u64, workflow_id: &str) -> Result<PhaseOutcome> {
        self.launched.lock().unwrap().push(phase);
        let outcome = self
            .outcomes
            .get(&phase)
            .cloned()
            .unwrap_or(PhaseOutcome::Success { skipped: false });

        if outcome.is_success() {
            let mut state = match WorkflowState::load(&self.state_root, workflow_id)? {
                Some(state) => state,
                None => WorkflowState::create_with_id(&self.state_root, workflow_id, issue_number)?,
            };
            state.accumulate_tokens(phase.as_str(), TokenUsage::new(10, 5));
            state.append_phase_completed(phase);
            state.save(phase.as_str())?;
        }
        Ok(outcome)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Setup {
    _temp: TempDir,
    config: Arc<Config>,
    tracker: Arc<FakeTracker>,
}

impl Setup {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.repo_root = temp.path().to_string_lossy().to_string();
        Self {
            _temp: temp,
            config: Arc::new(config),
            tracker: Arc::new(FakeTracker::new().with_issue(issue(42, "Add login", ""))),
        }
    }

    fn launcher(&self) -> ScriptedLauncher {
        ScriptedLauncher::new(&self.config.state_root())
    }

    fn orchestrator(&self, pipeline: Pipeline, launcher: Arc<ScriptedLauncher>) -> PipelineOrchestrator {
        PipelineOrchestrator::new(pipeline, self.config.clone(), launcher, self.tracker.clone())
    }
}

// ─── Orchestration Tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_sdlc_runs_every_phase_in_order() {
    let setup = Setup::new();
    let launcher = Arc::new(setup.launcher());

    let report = setup
        .orchestrator(Pipeline::Sdlc, launcher.clone())
        .run(42, Some("wf-001".into()))
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(launcher.launched(), PhaseName::ALL.to_vec());
    assert_eq!(report.completed_phases, PhaseName::ALL.to_vec());
    assert_eq!(report.token_totals, TokenUsage::new(60, 30));

    let comments = setup.tracker.posted_on(42);
    assert!(comments[0].contains("🚀 Starting SDLC pipeline with workflow id `wf-001`"));
    assert!(comments.last().unwrap().contains("🎉 SDLC pipeline completed"));
}

#[tokio::test]
async fn test_generates_workflow_id_when_missing() {
    let setup = Setup::new();
    let launcher = Arc::new(setup.launcher());

    let report = setup
        .orchestrator(Pipeline::PlanBuild, launcher.clone())
        .run(42, None)
        .await;

    assert_eq!(report.workflow_id.len(), 8);
    assert_eq!(report.completed_phases, vec![PhaseName::Plan, PhaseName::Build]);
    assert!(WorkflowState::load(&setup.config.state_root(), &report.workflow_id)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_document_failure_does_not_stop_pipeline() {
    let setup = Setup::new();
    let launcher = Arc::new(
        setup
            .launcher()
            .with(PhaseName::Document, PhaseOutcome::Fatal("docs agent crashed".into())),
    );

    let report = setup
        .orchestrator(Pipeline::Sdlc, launcher.clone())
        .run(42, Some("wf-002".into()))
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(launcher.launched().last(), Some(&PhaseName::Ship));
    assert!(!report.completed_phases.contains(&PhaseName::Document));
    assert!(report.completed_phases.contains(&PhaseName::Ship));
    assert!(setup
        .tracker
        .posted_on(42)
        .iter()
        .any(|c| c.contains("document phase failed, continuing without it")));
}

#[tokio::test]
async fn test_build_failure_aborts_pipeline() {
    let setup = Setup::new();
    let launcher = Arc::new(
        setup
            .launcher()
            .with(PhaseName::Build, PhaseOutcome::Fatal("phase exited with status 1".into())),
    );

    let report = setup
        .orchestrator(Pipeline::PlanBuildTest, launcher.clone())
        .run(42, Some("wf-003".into()))
        .await;

    assert_eq!(report.exit_code(), 1);
    assert_eq!(launcher.launched(), vec![PhaseName::Plan, PhaseName::Build]);
    assert_eq!(report.completed_phases, vec![PhaseName::Plan]);
    let last = setup.tracker.posted_on(42).pop().unwrap();
    assert!(last.contains("❌ PLAN_BUILD_TEST pipeline aborted: build phase failed"), "{}", last);
}

#[tokio::test]
async fn test_rerun_resumes_after_completed_phases() {
    let setup = Setup::new();
    let root = setup.config.state_root();
    let mut state = WorkflowState::create_with_id(&root, "wf-004", 42).unwrap();
    state.append_phase_completed(PhaseName::Plan);
    state.append_phase_completed(PhaseName::Build);
    state.save("test").unwrap();

    let launcher = Arc::new(setup.launcher());
    let report = setup
        .orchestrator(Pipeline::PlanBuildTestReview, launcher.clone())
        .run(42, Some("wf-004".into()))
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(launcher.launched(), vec![PhaseName::Test, PhaseName::Review]);
    assert_eq!(
        report.completed_phases,
        vec![PhaseName::Plan, PhaseName::Build, PhaseName::Test, PhaseName::Review]
    );
}

#[tokio::test]
async fn test_clarification_pause_stops_without_failure_comment() {
    let setup = Setup::new();
    let launcher = Arc::new(
        setup
            .launcher()
            .with(PhaseName::Plan, PhaseOutcome::AwaitingInput("questions asked".into())),
    );

    let report = setup
        .orchestrator(Pipeline::Sdlc, launcher.clone())
        .run(42, Some("wf-005".into()))
        .await;

    assert_eq!(report.exit_code(), 2);
    assert_eq!(launcher.launched(), vec![PhaseName::Plan]);
    let comments = setup.tracker.posted_on(42);
    assert_eq!(comments.len(), 1);
    assert!(!comments[0].contains("aborted"));
}

#[tokio::test]
async fn test_corrupt_state_aborts_before_launching() {
    let setup = Setup::new();
    let path = WorkflowState::state_file(&setup.config.state_root(), "wf-006");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ not json").unwrap();

    let launcher = Arc::new(setup.launcher());
    let report = setup
        .orchestrator(Pipeline::PlanBuild, launcher.clone())
        .run(42, Some("wf-006".into()))
        .await;

    assert_eq!(report.exit_code(), 1);
    assert!(launcher.launched().is_empty());
    assert!(report.completed_phases.is_empty());
}

#[tokio::test]
async fn test_zero_touch_warns_before_starting() {
    let setup = Setup::new();
    let launcher = Arc::new(setup.launcher());

    let report = setup
        .orchestrator(Pipeline::Zte, launcher)
        .run(42, Some("wf-007".into()))
        .await;

    assert_eq!(report.exit_code(), 0);
    let comments = setup.tracker.posted_on(42);
    assert!(comments[0].contains("Zero Touch Execution"), "{}", comments[0]);
    assert!(comments[0].contains("`main`"));
    assert!(comments[1].contains("🚀 Starting ZTE pipeline"));
    assert!(comments.last().unwrap().contains("🎉 ZTE pipeline completed"));
}
