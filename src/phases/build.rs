use async_trait::async_trait;
use tracing::{info, warn};

use super::{Attempt, AttemptOutcome, Phase, PhaseContext, PhaseName};
use crate::agent;
use crate::config::Config;
use crate::error::AdwError;
use crate::state::WorkflowState;

/// Implement the plan and verify the worktree really changed
pub struct BuildPhase;

#[async_trait]
impl Phase for BuildPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Build
    }

    fn max_attempts(&self, config: &Config) -> u32 {
        config.phases.max_build_attempts
    }

    async fn check_preconditions(
        &self,
        _ctx: &PhaseContext,
        state: &WorkflowState,
    ) -> Result<(), AdwError> {
        let mut missing = Vec::new();
        if state.plan_file.is_none() {
            missing.push("plan_file".to_string());
        }
        if state.branch_name().is_none() {
            missing.push("branch_name".to_string());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AdwError::MissingFields(missing))
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
        let branch = state.branch_name().unwrap_or_default().to_string();

        ctx.git.checkout(&branch, &worktree).await?;

        let plan = tokio::fs::read_to_string(worktree.join(&plan_file))
            .await
            .map_err(|_| {
                AdwError::not_found(
                    format!("plan file {}", plan_file),
                    "The plan is missing from the worktree. Re-run the plan phase.",
                )
            })?;
        let baseline = ctx.git.head_commit(&worktree).await?;

        if attempt.number == 1 {
            ctx.comment(
                state.issue_number,
                state.workflow_id(),
                agent::IMPLEMENTOR,
                &format!("✅ Implementing `{}` in {}", plan_file, worktree.display()),
            )
            .await;
        }

        let (builder, command) = build_command(ctx.options.parallel_build);
        let mut request = ctx
            .request(state, builder, command, worktree.clone())
            .arg(plan_file.clone());
        if let Some(feedback) = &attempt.feedback {
            request = request.arg(corrective_instruction(feedback, attempt));
        }
        if let Some(docs) = &state.ai_docs_context {
            request = request.arg(docs.clone());
        }

        let response = ctx.run_agent(state, request).await?;
        if !response.success {
            return Err(AdwError::agent_failed(builder, response.output));
        }

        let report = ctx
            .verifier
            .verify(&worktree, &plan, Some(&baseline))
            .await?;
        if !report.passed() {
            warn!("Implementor reported success but {}", report.describe());
            return Err(AdwError::FalseSuccess(report.describe()));
        }

        info!(files = report.changed_files.len(), "Implementation verified");
        Ok(AttemptOutcome::Done(format!(
            "🔨 Implementation verified, {} file(s) changed",
            report.changed_files.len()
        )))
    }

    async fn on_success(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
    ) -> Result<(), AdwError> {
        ctx.commit(state, PhaseName::Build).await?;
        ctx.publish(state).await;
        Ok(())
    }
}

/// Agent and slash command that carry out the plan
fn build_command(parallel: bool) -> (&'static str, &'static str) {
    if parallel {
        (agent::PARALLEL_BUILDER, "/build_in_parallel")
    } else {
        (agent::IMPLEMENTOR, "/implement")
    }
}

fn corrective_instruction(feedback: &str, attempt: &Attempt) -> String {
    format!(
        "IMPORTANT (attempt {}/{}): the previous attempt reported success, but {}. \
         Use your file editing tools to make the changes the plan describes. \
         Do not report success unless files were actually modified.",
        attempt.number, attempt.max, feedback
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrective_instruction_mentions_feedback() {
        let attempt = Attempt {
            number: 2,
            max: 2,
            feedback: Some("no files changed in the worktree".into()),
        };
        let text = corrective_instruction("no files changed in the worktree", &attempt);
        assert!(text.contains("attempt 2/2"));
        assert!(text.contains("no files changed"));
    }

    #[test]
    fn test_build_command() {
        assert_eq!(build_command(false), (agent::IMPLEMENTOR, "/implement"));
        assert_eq!(build_command(true), (agent::PARALLEL_BUILDER, "/build_in_parallel"));
    }

    #[test]
    fn test_attempts_follow_config() {
        let mut config = Config::default();
        assert_eq!(BuildPhase.max_attempts(&config), 2);
        config.phases.max_build_attempts = 5;
        assert_eq!(BuildPhase.max_attempts(&config), 5);
    }
}
