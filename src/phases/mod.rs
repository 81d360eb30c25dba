//! Workflow phases and the runner that drives them.
//!
//! Each phase (plan, build, test, review, document, ship) implements [`Phase`].
//! [`PhaseRunner`] wraps every phase in the same lifecycle: load state, lock it,
//! skip if already completed, check preconditions, validate the worktree, run
//! bounded attempts, then commit and record completion.

mod build;
mod document;
mod plan;
mod review;
mod runner;
mod ship;
mod test;

pub use build::BuildPhase;
pub use document::DocumentPhase;
pub use plan::PlanPhase;
pub use review::ReviewPhase;
pub use runner::PhaseRunner;
pub use ship::ShipPhase;
pub use test::TestPhase;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::{self, AgentRequest, AgentResponse, AgentRunner};
use crate::config::Config;
use crate::error::AdwError;
use crate::git::{GitOps, WorktreeManager};
use crate::github::{format_issue_message, CreatePullRequest, IssueTracker, PullRequests};
use crate::state::WorkflowState;
use crate::verify::ChangeVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Plan,
    Build,
    Test,
    Review,
    Document,
    Ship,
}

impl PhaseName {
    pub const ALL: [PhaseName; 6] = [
        PhaseName::Plan,
        PhaseName::Build,
        PhaseName::Test,
        PhaseName::Review,
        PhaseName::Document,
        PhaseName::Ship,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Plan => "plan",
            PhaseName::Build => "build",
            PhaseName::Test => "test",
            PhaseName::Review => "review",
            PhaseName::Document => "document",
            PhaseName::Ship => "ship",
        }
    }

    /// Failure of this phase does not stop a pipeline
    pub fn is_non_fatal_to_pipeline(&self) -> bool {
        matches!(self, PhaseName::Document)
    }

    /// Phase implementation
    pub fn phase(&self) -> Box<dyn Phase> {
        match self {
            PhaseName::Plan => Box::new(PlanPhase),
            PhaseName::Build => Box::new(BuildPhase),
            PhaseName::Test => Box::new(TestPhase),
            PhaseName::Review => Box::new(ReviewPhase),
            PhaseName::Document => Box::new(DocumentPhase),
            PhaseName::Ship => Box::new(ShipPhase),
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = AdwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseName::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| AdwError::Validation(format!("unknown phase '{}'", s)))
    }
}

/// Result of one phase invocation as seen by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// `skipped` is set when the phase had already completed earlier
    Success { skipped: bool },
    Fatal(String),
    /// Plan is paused until a human answers clarification questions
    AwaitingInput(String),
}

impl PhaseOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            PhaseOutcome::Success { .. } => 0,
            PhaseOutcome::Fatal(_) => 1,
            PhaseOutcome::AwaitingInput(_) => 2,
        }
    }

    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => PhaseOutcome::Success { skipped: false },
            2 => PhaseOutcome::AwaitingInput("phase is waiting for human input".to_string()),
            other => PhaseOutcome::Fatal(format!("phase exited with status {}", other)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PhaseOutcome::Success { .. })
    }
}

/// Lifecycle of one phase invocation.
///
/// `NotStarted -> Running -> {Succeeded, Failed, RetryPending}` and
/// `RetryPending -> Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    RetryPending,
}

impl PhaseStatus {
    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, RetryPending)
                | (RetryPending, Running)
        )
    }

    pub fn transition(self, next: PhaseStatus) -> Result<PhaseStatus, AdwError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AdwError::Validation(format!(
                "illegal phase transition {:?} -> {:?}",
                self, next
            )))
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Succeeded | PhaseStatus::Failed)
    }
}

/// Per-invocation flags from the command line
#[derive(Debug, Clone, Default)]
pub struct PhaseOptions {
    pub skip_clarify: bool,
    /// Comma-separated documentation topics loaded before planning
    pub load_docs: Option<String>,
    /// Scout the codebase at this scale before planning
    pub scout: Option<String>,
    /// Build with `/build_in_parallel` instead of `/implement`
    pub parallel_build: bool,
    pub skip_e2e: bool,
    pub skip_resolution: bool,
}

/// One try at a phase's main action
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based
    pub number: u32,
    pub max: u32,
    /// What went wrong last time, for corrective instructions
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Finished; the string is a short report for the issue thread
    Done(String),
    AwaitingInput(String),
}

#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> PhaseName;

    /// Total attempts, including the first
    fn max_attempts(&self, _config: &Config) -> u32 {
        1
    }

    /// Plan creates the worktree, every later phase needs it
    fn requires_worktree(&self) -> bool {
        true
    }

    /// Structural checks; failures are fatal and never retried
    async fn check_preconditions(
        &self,
        _ctx: &PhaseContext,
        _state: &WorkflowState,
    ) -> Result<(), AdwError> {
        Ok(())
    }

    async fn attempt(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
        attempt: &Attempt,
    ) -> Result<AttemptOutcome, AdwError>;

    /// Commit and publish after a successful attempt, before the phase is recorded
    async fn on_success(
        &self,
        _ctx: &PhaseContext,
        _state: &mut WorkflowState,
    ) -> Result<(), AdwError> {
        Ok(())
    }

    /// Re-reported when the phase is skipped as already completed
    fn completed_summary(&self, _state: &WorkflowState) -> String {
        String::new()
    }
}

/// Collaborators shared by every phase
#[derive(Clone)]
pub struct PhaseContext {
    pub config: Arc<Config>,
    pub agent: Arc<dyn AgentRunner>,
    pub tracker: Arc<dyn IssueTracker>,
    pub prs: Arc<dyn PullRequests>,
    pub git: Arc<dyn GitOps>,
    pub verifier: Arc<dyn ChangeVerifier>,
    pub worktrees: WorktreeManager,
    pub options: PhaseOptions,
}

impl PhaseContext {
    /// Post a bot-tagged comment. Failures are logged, never raised.
    pub async fn comment(&self, issue_number: u64, workflow_id: &str, agent: &str, message: &str) {
        let body = format_issue_message(self.tracker.bot_identifier(), workflow_id, agent, message);
        if let Err(e) = self.tracker.comment(issue_number, &body).await {
            warn!("Failed to comment on issue #{}: {:#}", issue_number, e);
        }
    }

    /// Request scoped to this workflow with the configured model
    pub fn request(&self, state: &WorkflowState, agent_name: &str, command: &str, cwd: PathBuf) -> AgentRequest {
        let mut request = AgentRequest::new(agent_name, command, state.workflow_id(), cwd);
        request.model = self.config.agent.model.clone();
        request
    }

    /// Run an agent and persist its token usage before looking at the result
    pub async fn run_agent(
        &self,
        state: &mut WorkflowState,
        request: AgentRequest,
    ) -> Result<AgentResponse, AdwError> {
        let response = self
            .agent
            .run(&request)
            .await
            .map_err(|e| AdwError::agent_failed(&request.agent_name, format!("{:#}", e)))?;

        state.accumulate_tokens(&request.agent_name, response.token_usage);
        state.save(&request.agent_name)?;
        Ok(response)
    }

    /// Worktree recorded in state
    pub fn worktree(&self, state: &WorkflowState) -> Result<PathBuf, AdwError> {
        state.worktree_path().map(PathBuf::from).ok_or_else(|| {
            AdwError::not_found(
                format!("worktree path for workflow {}", state.workflow_id()),
                "Run the plan phase first to create the worktree.",
            )
        })
    }

    /// Commit everything in the worktree. Returns false when nothing changed.
    pub async fn commit(&self, state: &WorkflowState, phase: PhaseName) -> Result<bool, AdwError> {
        let worktree = self.worktree(state)?;
        let committed = self.git.commit(&commit_message(state, phase), &worktree).await?;
        if committed {
            info!(%phase, "Committed phase changes");
        } else {
            info!(%phase, "No changes to commit");
        }
        Ok(committed)
    }

    /// Push the branch, then make sure a pull request exists and is recorded.
    /// Every step is best effort.
    pub async fn publish(&self, state: &mut WorkflowState) {
        let (Some(branch), Ok(worktree)) = (state.branch_name().map(str::to_string), self.worktree(state)) else {
            warn!("No branch or worktree to publish");
            return;
        };
        let issue = state.issue_number;
        let id = state.workflow_id().to_string();

        if let Err(e) = self.git.push(&branch, &worktree).await {
            warn!("Failed to push {}: {:#}", branch, e);
            self.comment(issue, &id, agent::OPS, &format!("⚠️ Failed to push branch {}: {:#}", branch, e))
                .await;
            return;
        }

        let pr = match self.prs.find_for_branch(&branch).await {
            Ok(Some(pr)) => Some(pr),
            Ok(None) => {
                let title = match self.tracker.fetch(issue).await {
                    Ok(i) => i.title,
                    Err(_) => format!("Issue #{}", issue),
                };
                let class = state.issue_class.map(|c| c.as_str()).unwrap_or("change");
                let request = CreatePullRequest {
                    head: branch.clone(),
                    base: self.config.git.target_branch.clone(),
                    title: format!("{}: #{} - {}", class, issue, title),
                    body: format!(
                        "Closes #{}\n\nADW ID: `{}`\nPlan: `{}`",
                        issue,
                        id,
                        state.plan_file.as_deref().unwrap_or("-")
                    ),
                };
                match self.prs.create(&request).await {
                    Ok(pr) => {
                        self.comment(issue, &id, agent::OPS, &format!("✅ Pull request created: {}", pr.url))
                            .await;
                        Some(pr)
                    }
                    Err(e) => {
                        warn!("Failed to create pull request: {:#}", e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Failed to look up pull request for {}: {:#}", branch, e);
                None
            }
        };

        if let Some(pr) = pr {
            if state.pr_url.as_deref() != Some(pr.url.as_str()) {
                state.pr_url = Some(pr.url);
                if let Err(e) = state.save("publish") {
                    warn!("Failed to record pull request URL: {}", e);
                }
            }
        }
    }
}

/// Deterministic commit message for a phase's changes
pub fn commit_message(state: &WorkflowState, phase: PhaseName) -> String {
    let class = state.issue_class.map(|c| c.as_str()).unwrap_or("chore");
    format!(
        "{}: {} for #{}\n\nADW ID: {}",
        class,
        phase,
        state.issue_number,
        state.workflow_id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_name_parse_and_display() {
        assert_eq!("Build".parse::<PhaseName>().unwrap(), PhaseName::Build);
        assert_eq!(PhaseName::Document.to_string(), "document");
        assert!("deploy".parse::<PhaseName>().is_err());
        assert_eq!(
            serde_json::to_string(&PhaseName::Ship).unwrap(),
            "\"ship\""
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(PhaseOutcome::Success { skipped: true }.exit_code(), 0);
        assert_eq!(PhaseOutcome::Fatal("x".into()).exit_code(), 1);
        assert_eq!(PhaseOutcome::AwaitingInput("q".into()).exit_code(), 2);
        assert_eq!(
            PhaseOutcome::from_exit_code(2),
            PhaseOutcome::AwaitingInput("phase is waiting for human input".into())
        );
        assert!(matches!(PhaseOutcome::from_exit_code(101), PhaseOutcome::Fatal(_)));
    }

    #[test]
    fn test_status_transitions() {
        let status = PhaseStatus::NotStarted;
        let status = status.transition(PhaseStatus::Running).unwrap();
        let status = status.transition(PhaseStatus::RetryPending).unwrap();
        let status = status.transition(PhaseStatus::Running).unwrap();
        let status = status.transition(PhaseStatus::Succeeded).unwrap();
        assert!(status.is_terminal());

        assert!(PhaseStatus::Succeeded
            .transition(PhaseStatus::Running)
            .is_err());
        assert!(PhaseStatus::NotStarted
            .transition(PhaseStatus::Succeeded)
            .is_err());
    }

    #[test]
    fn test_only_document_is_non_fatal() {
        let non_fatal: Vec<_> = PhaseName::ALL
            .into_iter()
            .filter(|p| p.is_non_fatal_to_pipeline())
            .collect();
        assert_eq!(non_fatal, vec![PhaseName::Document]);
    }
}
