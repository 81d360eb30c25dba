use tracing::{error, info, instrument, warn};

use super::{Attempt, AttemptOutcome, Phase, PhaseContext, PhaseName, PhaseOutcome, PhaseStatus};
use crate::agent;
use crate::error::AdwError;
use crate::state::{StateLock, WorkflowState};

/// Drives one phase through its lifecycle
pub struct PhaseRunner {
    ctx: PhaseContext,
}

enum Finished {
    Ran(String),
    Skipped,
    Paused(String),
}

impl PhaseRunner {
    pub fn new(ctx: PhaseContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    pub async fn run_named(
        &self,
        name: PhaseName,
        issue_number: u64,
        workflow_id: Option<&str>,
    ) -> PhaseOutcome {
        let phase = name.phase();
        self.run(phase.as_ref(), issue_number, workflow_id).await
    }

    /// Run `phase` for a workflow. Every fatal condition is commented on the
    /// issue and reported as `Fatal`.
    #[instrument(skip(self, phase), fields(phase = %phase.name()))]
    pub async fn run(
        &self,
        phase: &dyn Phase,
        issue_number: u64,
        workflow_id: Option<&str>,
    ) -> PhaseOutcome {
        let mut state = match self.acquire_state(phase.name(), issue_number, workflow_id) {
            Ok(state) => state,
            Err(e) => {
                let id = workflow_id.unwrap_or("unknown");
                return self.fail(phase.name(), issue_number, id, None, e).await;
            }
        };
        let workflow_id = state.workflow_id().to_string();

        let _lock = match StateLock::acquire(&self.ctx.config.state_root(), &workflow_id) {
            Ok(lock) => lock,
            Err(e) => {
                return self
                    .fail(phase.name(), issue_number, &workflow_id, None, e)
                    .await
            }
        };

        match self.drive(phase, &mut state).await {
            Ok(Finished::Ran(report)) => {
                info!(workflow_id = %workflow_id, "Phase {} completed", phase.name());
                let mut message = format!("✅ {} phase completed", phase.name());
                if !report.is_empty() {
                    message.push_str(&format!("\n\n{}", report));
                }
                self.ctx
                    .comment(issue_number, &workflow_id, agent::OPS, &message)
                    .await;
                PhaseOutcome::Success { skipped: false }
            }
            Ok(Finished::Skipped) => {
                let summary = phase.completed_summary(&state);
                info!(workflow_id = %workflow_id, "Phase {} already completed, skipping", phase.name());
                let mut message = format!("⏭️ {} phase already completed", phase.name());
                if !summary.is_empty() {
                    message.push_str(&format!(": {}", summary));
                }
                self.ctx
                    .comment(issue_number, &workflow_id, agent::OPS, &message)
                    .await;
                PhaseOutcome::Success { skipped: true }
            }
            Ok(Finished::Paused(reason)) => {
                if let Err(e) = state.save(phase.name().as_str()) {
                    warn!("Failed to save state while pausing: {}", e);
                }
                info!(workflow_id = %workflow_id, "Phase {} paused: {}", phase.name(), reason);
                PhaseOutcome::AwaitingInput(reason)
            }
            Err(e) => {
                self.fail(phase.name(), issue_number, &workflow_id, Some(&state), e)
                    .await
            }
        }
    }

    /// Load the workflow's state; plan may start a new one
    fn acquire_state(
        &self,
        phase: PhaseName,
        issue_number: u64,
        workflow_id: Option<&str>,
    ) -> Result<WorkflowState, AdwError> {
        let root = self.ctx.config.state_root();

        let state = match (workflow_id, phase) {
            (Some(id), _) => match WorkflowState::load(&root, id)? {
                Some(state) => state,
                None if phase == PhaseName::Plan => WorkflowState::create_with_id(&root, id, issue_number)?,
                None => {
                    return Err(AdwError::not_found(
                        format!("workflow state for {}", id),
                        "Run the plan phase first to start this workflow.",
                    ))
                }
            },
            (None, PhaseName::Plan) => WorkflowState::create(&root, issue_number)?,
            (None, _) => {
                return Err(AdwError::not_found(
                    "workflow id",
                    format!("The {} phase needs the workflow id printed by plan.", phase),
                ))
            }
        };

        if state.issue_number != issue_number {
            return Err(AdwError::Validation(format!(
                "workflow {} belongs to issue #{}, not #{}",
                state.workflow_id(),
                state.issue_number,
                issue_number
            )));
        }
        Ok(state)
    }

    async fn drive(
        &self,
        phase: &dyn Phase,
        state: &mut WorkflowState,
    ) -> Result<Finished, AdwError> {
        if state.has_completed(phase.name()) {
            return Ok(Finished::Skipped);
        }

        phase.check_preconditions(&self.ctx, state).await?;

        if phase.requires_worktree() {
            self.ctx
                .worktrees
                .validate(state.workflow_id(), state)
                .await?;
        }

        let report = match self.run_attempts(phase, state).await? {
            AttemptOutcome::Done(report) => report,
            AttemptOutcome::AwaitingInput(reason) => return Ok(Finished::Paused(reason)),
        };

        phase.on_success(&self.ctx, state).await?;

        state.append_phase_completed(phase.name());
        state.save(phase.name().as_str())?;
        Ok(Finished::Ran(report))
    }

    async fn run_attempts(
        &self,
        phase: &dyn Phase,
        state: &mut WorkflowState,
    ) -> Result<AttemptOutcome, AdwError> {
        let max = phase.max_attempts(&self.ctx.config).max(1);
        let mut status = PhaseStatus::NotStarted;
        let mut feedback = None;
        let mut number = 1;

        loop {
            status = status.transition(PhaseStatus::Running)?;
            let attempt = Attempt {
                number,
                max,
                feedback: feedback.take(),
            };

            match phase.attempt(&self.ctx, state, &attempt).await {
                Ok(outcome) => {
                    status.transition(PhaseStatus::Succeeded)?;
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && number < max => {
                    status = status.transition(PhaseStatus::RetryPending)?;
                    warn!("{} attempt {}/{} failed: {}", phase.name(), number, max, e);
                    self.ctx
                        .comment(
                            state.issue_number,
                            state.workflow_id(),
                            agent::OPS,
                            &format!(
                                "⚠️ {} attempt {}/{} failed: {}\nRetrying with corrective feedback.",
                                phase.name(),
                                number,
                                max,
                                e
                            ),
                        )
                        .await;
                    feedback = Some(e.detail());
                    number += 1;
                }
                Err(e) => {
                    status.transition(PhaseStatus::Failed)?;
                    if e.is_retryable() {
                        error!("{} failed after {} attempt(s)", phase.name(), max);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Persist what we have, explain the failure on the issue, report `Fatal`
    async fn fail(
        &self,
        phase: PhaseName,
        issue_number: u64,
        workflow_id: &str,
        state: Option<&WorkflowState>,
        err: AdwError,
    ) -> PhaseOutcome {
        error!(workflow_id, "Phase {} failed: {}", phase, err);

        if let Some(state) = state {
            if let Err(e) = state.save(phase.as_str()) {
                warn!("Failed to save state after failure: {}", e);
            }
        }

        let mut message = format!("❌ {} phase failed: {}", phase, err);
        if let Some(hint) = err.remediation() {
            message.push_str(&format!("\n\n{}", hint));
        }
        self.ctx
            .comment(issue_number, workflow_id, agent::OPS, &message)
            .await;

        PhaseOutcome::Fatal(err.to_string())
    }
}
