use async_trait::async_trait;
use tracing::{info, warn};

use super::{Attempt, AttemptOutcome, Phase, PhaseContext, PhaseName};
use crate::agent;
use crate::error::AdwError;
use crate::github::{PrState, PullRequest};
use crate::state::WorkflowState;

/// Merge the workflow's branch into the target branch and tear down the worktree
pub struct ShipPhase;

/// Required state fields that are still empty
pub fn missing_ship_fields(state: &WorkflowState) -> Vec<String> {
    let checks = [
        ("issue_number", state.issue_number == 0),
        ("branch_name", state.branch_name().map_or(true, str::is_empty)),
        ("plan_file", state.plan_file.as_deref().map_or(true, str::is_empty)),
        ("issue_class", state.issue_class.is_none()),
        (
            "worktree_path",
            state.worktree_path().map_or(true, |p| p.as_os_str().is_empty()),
        ),
    ];
    checks
        .into_iter()
        .filter(|(_, missing)| *missing)
        .map(|(field, _)| field.to_string())
        .collect()
}

async fn existing_pr(ctx: &PhaseContext, branch: &str) -> Result<PullRequest, AdwError> {
    let pr = ctx.prs.find_for_branch(branch).await?.ok_or_else(|| {
        AdwError::Validation(format!(
            "no pull request exists for branch {}; ship only merges existing PRs",
            branch
        ))
    })?;
    if pr.state == PrState::Closed {
        return Err(AdwError::Validation(format!(
            "pull request #{} for {} is closed",
            pr.number, branch
        )));
    }
    Ok(pr)
}

#[async_trait]
impl Phase for ShipPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Ship
    }

    async fn check_preconditions(
        &self,
        ctx: &PhaseContext,
        state: &WorkflowState,
    ) -> Result<(), AdwError> {
        let missing = missing_ship_fields(state);
        if !missing.is_empty() {
            return Err(AdwError::MissingFields(missing));
        }
        existing_pr(ctx, state.branch_name().unwrap_or_default()).await?;
        Ok(())
    }

    async fn attempt(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
        _attempt: &Attempt,
    ) -> Result<AttemptOutcome, AdwError> {
        let branch = state.branch_name().unwrap_or_default().to_string();
        let target = ctx.config.git.target_branch.clone();
        let pr = existing_pr(ctx, &branch).await?;

        if pr.state == PrState::Merged {
            warn!(pr = pr.number, "Pull request already merged, skipping merge");
            ctx.comment(
                state.issue_number,
                state.workflow_id(),
                agent::SHIPPER,
                &format!("⚠️ PR #{} is already merged, skipping merge", pr.number),
            )
            .await;
        } else {
            ctx.comment(
                state.issue_number,
                state.workflow_id(),
                agent::SHIPPER,
                &format!("🚢 Merging `{}` into `{}`", branch, target),
            )
            .await;
            ctx.git
                .merge_to_target(&branch, &target, ctx.worktrees.repo_root())
                .await?;
            info!(%branch, %target, "Branch merged");
        }

        if state.pr_url.is_none() {
            state.pr_url = Some(pr.url.clone());
        }
        Ok(AttemptOutcome::Done(format!(
            "🎉 Shipped `{}` to `{}` ({})",
            branch, target, pr.url
        )))
    }

    /// Worktree cleanup never fails the ship
    async fn on_success(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
    ) -> Result<(), AdwError> {
        let issue = state.issue_number;
        let id = state.workflow_id().to_string();
        match ctx.worktrees.destroy(&id).await {
            Ok(report) if report.warnings.is_empty() => {
                info!("Worktree removed");
            }
            Ok(report) => {
                let mut message = String::from("⚠️ Cleanup finished with warnings:\n");
                for warning in &report.warnings {
                    message.push_str(&format!("- {}\n", warning));
                }
                ctx.comment(issue, &id, agent::SHIPPER, &message).await;
            }
            Err(e) => {
                warn!("Worktree cleanup failed: {}", e);
                ctx.comment(issue, &id, agent::SHIPPER, &format!("⚠️ Worktree cleanup failed: {}", e))
                    .await;
            }
        }
        Ok(())
    }
}
