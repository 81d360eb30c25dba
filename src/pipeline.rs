//! Pipelines: fixed phase sequences run one after another for a workflow.
//!
//! The orchestrator keeps no progress of its own. Before each phase it re-reads
//! the workflow state and skips phases already recorded as completed, so a
//! killed pipeline restarted with the same workflow id picks up where it left
//! off.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::agent;
use crate::config::Config;
use crate::error::AdwError;
use crate::github::{format_issue_message, IssueTracker};
use crate::phases::{PhaseName, PhaseOptions, PhaseOutcome, PhaseRunner};
use crate::state::{make_workflow_id, TokenUsage, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// Full software lifecycle
    Sdlc,
    /// Full lifecycle with automatic merge ("zero touch execution")
    Zte,
    PlanBuild,
    PlanBuildTest,
    PlanBuildTestReview,
    PlanBuildDocument,
    PlanBuildReview,
}

impl Pipeline {
    pub const ALL: [Pipeline; 7] = [
        Pipeline::Sdlc,
        Pipeline::Zte,
        Pipeline::PlanBuild,
        Pipeline::PlanBuildTest,
        Pipeline::PlanBuildTestReview,
        Pipeline::PlanBuildDocument,
        Pipeline::PlanBuildReview,
    ];

    pub fn phases(&self) -> &'static [PhaseName] {
        use PhaseName::*;
        match self {
            Pipeline::Sdlc | Pipeline::Zte => &[Plan, Build, Test, Review, Document, Ship],
            Pipeline::PlanBuild => &[Plan, Build],
            Pipeline::PlanBuildTest => &[Plan, Build, Test],
            Pipeline::PlanBuildTestReview => &[Plan, Build, Test, Review],
            Pipeline::PlanBuildDocument => &[Plan, Build, Document],
            Pipeline::PlanBuildReview => &[Plan, Build, Review],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Sdlc => "sdlc",
            Pipeline::Zte => "zte",
            Pipeline::PlanBuild => "plan_build",
            Pipeline::PlanBuildTest => "plan_build_test",
            Pipeline::PlanBuildTestReview => "plan_build_test_review",
            Pipeline::PlanBuildDocument => "plan_build_document",
            Pipeline::PlanBuildReview => "plan_build_review",
        }
    }

    pub fn is_zero_touch(&self) -> bool {
        matches!(self, Pipeline::Zte)
    }

    fn label(&self) -> String {
        if self.is_zero_touch() {
            "ZTE".to_string()
        } else {
            self.as_str().to_uppercase()
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pipeline {
    type Err = AdwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase().replace('-', "_");
        let key = match key.as_str() {
            "sdlc_zte" => "zte",
            other => other,
        };
        Pipeline::ALL
            .into_iter()
            .find(|p| p.as_str() == key)
            .ok_or_else(|| AdwError::Validation(format!("unknown pipeline '{}'", s)))
    }
}

/// Runs a single phase for the orchestrator
#[async_trait]
pub trait PhaseLauncher: Send + Sync {
    async fn launch(&self, phase: PhaseName, issue_number: u64, workflow_id: &str) -> Result<PhaseOutcome>;
}

/// Runs each phase as its own `adw <phase>` process and maps the exit code
pub struct ProcessPhaseLauncher {
    exe: PathBuf,
    config_path: Option<String>,
    options: PhaseOptions,
}

impl ProcessPhaseLauncher {
    pub fn new(config_path: Option<String>, options: PhaseOptions) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the adw executable")?;
        Ok(Self {
            exe,
            config_path,
            options,
        })
    }

    fn args(&self, phase: PhaseName, issue_number: u64, workflow_id: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.clone());
        }
        args.push(phase.as_str().to_string());
        args.push(issue_number.to_string());
        args.push(workflow_id.to_string());
        let options = &self.options;
        match phase {
            PhaseName::Plan => {
                if options.skip_clarify {
                    args.push("--skip-clarify".to_string());
                }
                if let Some(topics) = &options.load_docs {
                    args.push("--load-docs".to_string());
                    args.push(topics.clone());
                }
                if let Some(scale) = &options.scout {
                    args.push(format!("--scout={}", scale));
                }
            }
            PhaseName::Build if options.parallel_build => args.push("--parallel".to_string()),
            PhaseName::Test if options.skip_e2e => args.push("--skip-e2e".to_string()),
            PhaseName::Review if options.skip_resolution => {
                args.push("--skip-resolution".to_string())
            }
            _ => {}
        }
        args
    }
}

#[async_trait]
impl PhaseLauncher for ProcessPhaseLauncher {
    async fn launch(&self, phase: PhaseName, issue_number: u64, workflow_id: &str) -> Result<PhaseOutcome> {
        let args = self.args(phase, issue_number, workflow_id);
        info!(?args, "Launching phase process");
        let status = Command::new(&self.exe)
            .args(&args)
            .status()
            .await
            .with_context(|| format!("Failed to run {} phase", phase))?;
        Ok(match status.code() {
            Some(code) => PhaseOutcome::from_exit_code(code),
            None => PhaseOutcome::Fatal(format!("{} phase was terminated by a signal", phase)),
        })
    }
}

/// Runs phases inside the current process
pub struct InProcessPhaseLauncher {
    runner: PhaseRunner,
}

impl InProcessPhaseLauncher {
    pub fn new(runner: PhaseRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PhaseLauncher for InProcessPhaseLauncher {
    async fn launch(&self, phase: PhaseName, issue_number: u64, workflow_id: &str) -> Result<PhaseOutcome> {
        Ok(self.runner.run_named(phase, issue_number, Some(workflow_id)).await)
    }
}

/// How a pipeline run ended
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub workflow_id: String,
    pub outcome: PhaseOutcome,
    pub completed_phases: Vec<PhaseName>,
    pub token_totals: TokenUsage,
}

impl PipelineReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

pub struct PipelineOrchestrator {
    pipeline: Pipeline,
    config: Arc<Config>,
    launcher: Arc<dyn PhaseLauncher>,
    tracker: Arc<dyn IssueTracker>,
}

impl PipelineOrchestrator {
    pub fn new(
        pipeline: Pipeline,
        config: Arc<Config>,
        launcher: Arc<dyn PhaseLauncher>,
        tracker: Arc<dyn IssueTracker>,
    ) -> Self {
        Self {
            pipeline,
            config,
            launcher,
            tracker,
        }
    }

    async fn comment(&self, issue_number: u64, workflow_id: &str, message: &str) {
        let body = format_issue_message(self.tracker.bot_identifier(), workflow_id, agent::OPS, message);
        if let Err(e) = self.tracker.comment(issue_number, &body).await {
            warn!("Failed to comment on issue #{}: {:#}", issue_number, e);
        }
    }

    fn load_state(&self, workflow_id: &str) -> Result<Option<WorkflowState>, AdwError> {
        WorkflowState::load(&self.config.state_root(), workflow_id)
    }

    /// Run the pipeline for `issue_number`, generating a workflow id if none is given
    pub async fn run(&self, issue_number: u64, workflow_id: Option<String>) -> PipelineReport {
        let workflow_id = workflow_id.unwrap_or_else(make_workflow_id);
        let label = self.pipeline.label();
        info!(%workflow_id, pipeline = %self.pipeline, "Starting pipeline");

        if self.pipeline.is_zero_touch() {
            self.comment(
                issue_number,
                &workflow_id,
                &format!(
                    "⚠️ Zero Touch Execution: if every phase passes, this workflow merges into `{}` without human review.",
                    self.config.git.target_branch
                ),
            )
            .await;
        }
        self.comment(
            issue_number,
            &workflow_id,
            &format!("🚀 Starting {} pipeline with workflow id `{}`", label, workflow_id),
        )
        .await;

        let outcome = self.run_phases(issue_number, &workflow_id).await;

        let state = self.load_state(&workflow_id).ok().flatten();
        let completed_phases = state
            .as_ref()
            .map(|s| s.completed_phases().to_vec())
            .unwrap_or_default();
        let token_totals = state.as_ref().map(|s| s.token_totals()).unwrap_or_default();

        match &outcome {
            PhaseOutcome::Success { .. } => {
                let mut message = format!("🎉 {} pipeline completed", label);
                if let Some(state) = &state {
                    message.push_str(&format!("\n\n{}", state.token_summary()));
                }
                self.comment(issue_number, &workflow_id, &message).await;
            }
            PhaseOutcome::Fatal(reason) => {
                let mut message = format!("❌ {} pipeline aborted: {}", label, reason);
                if let Some(state) = &state {
                    message.push_str(&format!("\n\n{}", state.token_summary()));
                }
                self.comment(issue_number, &workflow_id, &message).await;
            }
            PhaseOutcome::AwaitingInput(_) => {
                info!(%workflow_id, "Pipeline paused for clarification");
            }
        }

        PipelineReport {
            workflow_id,
            outcome,
            completed_phases,
            token_totals,
        }
    }

    async fn run_phases(&self, issue_number: u64, workflow_id: &str) -> PhaseOutcome {
        for &phase in self.pipeline.phases() {
            match self.load_state(workflow_id) {
                Ok(Some(state)) if state.has_completed(phase) => {
                    info!(%phase, "Already completed, skipping");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Cannot read workflow state: {}", e);
                    return PhaseOutcome::Fatal(e.to_string());
                }
            }

            let outcome = match self.launcher.launch(phase, issue_number, workflow_id).await {
                Ok(outcome) => outcome,
                Err(e) => PhaseOutcome::Fatal(format!("{:#}", e)),
            };

            match outcome {
                PhaseOutcome::Success { .. } => info!(%phase, "Phase succeeded"),
                PhaseOutcome::AwaitingInput(reason) => return PhaseOutcome::AwaitingInput(reason),
                PhaseOutcome::Fatal(reason) if phase.is_non_fatal_to_pipeline() => {
                    warn!(%phase, "Phase failed, continuing: {}", reason);
                    self.comment(
                        issue_number,
                        workflow_id,
                        &format!("⚠️ {} phase failed, continuing without it: {}", phase, reason),
                    )
                    .await;
                }
                PhaseOutcome::Fatal(reason) => {
                    error!(%phase, "Phase failed, stopping pipeline: {}", reason);
                    return PhaseOutcome::Fatal(format!("{} phase failed: {}", phase, reason));
                }
            }
        }
        PhaseOutcome::Success { skipped: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_phases() {
        assert_eq!(Pipeline::Sdlc.phases().len(), 6);
        assert_eq!(Pipeline::Zte.phases(), Pipeline::Sdlc.phases());
        assert_eq!(
            Pipeline::PlanBuildReview.phases(),
            &[PhaseName::Plan, PhaseName::Build, PhaseName::Review]
        );
    }

    #[test]
    fn test_pipeline_from_str() {
        assert_eq!("sdlc".parse::<Pipeline>().unwrap(), Pipeline::Sdlc);
        assert_eq!("sdlc_zte".parse::<Pipeline>().unwrap(), Pipeline::Zte);
        assert_eq!(
            "plan-build-test".parse::<Pipeline>().unwrap(),
            Pipeline::PlanBuildTest
        );
        assert!("deploy".parse::<Pipeline>().is_err());
    }

    #[test]
    fn test_process_launcher_args() {
        let launcher = ProcessPhaseLauncher {
            exe: PathBuf::from("adw"),
            config_path: Some("adw.toml".into()),
            options: PhaseOptions {
                skip_e2e: true,
                ..Default::default()
            },
        };
        assert_eq!(
            launcher.args(PhaseName::Test, 42, "wf-001"),
            vec!["--config", "adw.toml", "test", "42", "wf-001", "--skip-e2e"]
        );
        assert_eq!(
            launcher.args(PhaseName::Build, 42, "wf-001"),
            vec!["--config", "adw.toml", "build", "42", "wf-001"]
        );
    }

    #[test]
    fn test_process_launcher_forwards_plan_and_build_flags() {
        let launcher = ProcessPhaseLauncher {
            exe: PathBuf::from("adw"),
            config_path: None,
            options: PhaseOptions {
                load_docs: Some("rust,tokio".into()),
                scout: Some("quick".into()),
                parallel_build: true,
                ..Default::default()
            },
        };
        assert_eq!(
            launcher.args(PhaseName::Plan, 42, "wf-001"),
            vec!["plan", "42", "wf-001", "--load-docs", "rust,tokio", "--scout=quick"]
        );
        assert_eq!(
            launcher.args(PhaseName::Build, 42, "wf-001"),
            vec!["build", "42", "wf-001", "--parallel"]
        );
    }
}
