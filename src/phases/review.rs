use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Attempt, AttemptOutcome, Phase, PhaseContext, PhaseName};
use crate::agent::{self, strip_code_fence};
use crate::config::Config;
use crate::error::AdwError;
use crate::state::WorkflowState;

/// Review the implementation against the plan and patch blockers
pub struct ReviewPhase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub issue_description: String,
    #[serde(default)]
    pub issue_resolution: String,
    #[serde(default)]
    pub issue_severity: String,
}

impl ReviewIssue {
    pub fn is_blocker(&self) -> bool {
        self.issue_severity.eq_ignore_ascii_case("blocker")
    }
}

#[derive(Debug, Deserialize)]
struct ReviewResult {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    review_issues: Vec<ReviewIssue>,
}

#[async_trait]
impl Phase for ReviewPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Review
    }

    fn max_attempts(&self, config: &Config) -> u32 {
        config.phases.max_review_attempts
    }

    async fn check_preconditions(
        &self,
        _ctx: &PhaseContext,
        state: &WorkflowState,
    ) -> Result<(), AdwError> {
        match state.plan_file {
            Some(_) => Ok(()),
            None => Err(AdwError::MissingFields(vec!["plan_file".to_string()])),
        }
    }

    async fn attempt(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
        attempt: &Attempt,
    ) -> Result<AttemptOutcome, AdwError> {
        let worktree = ctx.worktree(state)?;
        let plan_file = state.plan_file.clone().unwrap_or_default();
        let workflow_id = state.workflow_id().to_string();

        // Blockers from the previous attempt
        let blockers: Vec<ReviewIssue> = attempt
            .feedback
            .as_deref()
            .and_then(|f| serde_json::from_str(f).ok())
            .unwrap_or_default();
        for blocker in &blockers {
            info!(issue = %blocker.issue_description, "Patching review blocker");
            let request = ctx
                .request(state, agent::REVIEW_PATCHER, "/patch", worktree.clone())
                .arg(workflow_id.clone())
                .arg(format!(
                    "{}\n\nResolution: {}",
                    blocker.issue_description, blocker.issue_resolution
                ));
            let response = ctx.run_agent(state, request).await?;
            if !response.success {
                warn!("Patch failed: {}", response.output);
            }
        }

        let request = ctx
            .request(state, agent::REVIEWER, "/review", worktree.clone())
            .arg(workflow_id.clone())
            .arg(plan_file);
        let response = ctx.run_agent(state, request).await?;
        if !response.success {
            return Err(AdwError::agent_failed(agent::REVIEWER, response.output));
        }

        let result: ReviewResult = serde_json::from_str(strip_code_fence(&response.output))
            .map_err(|e| AdwError::Unresolved(format!("review output was not valid JSON: {}", e)))?;

        let blockers: Vec<&ReviewIssue> = result.review_issues.iter().filter(|i| i.is_blocker()).collect();
        if !blockers.is_empty() {
            if ctx.options.skip_resolution {
                warn!(count = blockers.len(), "Blockers found, resolution skipped");
            } else {
                let detail = serde_json::to_string(&blockers).unwrap_or_default();
                return Err(AdwError::Unresolved(detail));
            }
        }

        let verdict = if result.success { "passed" } else { "finished" };
        Ok(AttemptOutcome::Done(format!(
            "🔍 Review {}: {} issue(s), {} blocker(s)",
            verdict,
            result.review_issues.len(),
            blockers.len()
        )))
    }

    async fn on_success(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
    ) -> Result<(), AdwError> {
        ctx.commit(state, PhaseName::Review).await?;
        ctx.publish(state).await;
        Ok(())
    }
}
