use async_trait::async_trait;

use super::{Attempt, AttemptOutcome, Phase, PhaseContext, PhaseName};
use crate::agent;
use crate::error::AdwError;
use crate::state::WorkflowState;

/// Generate documentation for the change. Pipelines continue if this fails.
pub struct DocumentPhase;

#[async_trait]
impl Phase for DocumentPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Document
    }

    async fn attempt(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
        _attempt: &Attempt,
    ) -> Result<AttemptOutcome, AdwError> {
        let worktree = ctx.worktree(state)?;
        let request = ctx
            .request(state, agent::DOCUMENTER, "/document", worktree)
            .arg(state.workflow_id())
            .arg(state.plan_file.clone().unwrap_or_default());
        let response = ctx.run_agent(state, request).await?;
        if !response.success {
            return Err(AdwError::agent_failed(agent::DOCUMENTER, response.output));
        }
        Ok(AttemptOutcome::Done("📚 Documentation updated".to_string()))
    }

    async fn on_success(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
    ) -> Result<(), AdwError> {
        // An empty diff is fine; there was simply nothing to document
        if ctx.commit(state, PhaseName::Document).await? {
            ctx.publish(state).await;
        }
        Ok(())
    }
}
