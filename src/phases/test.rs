use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Attempt, AttemptOutcome, Phase, PhaseContext, PhaseName};
use crate::agent::{self, strip_code_fence};
use crate::config::Config;
use crate::error::AdwError;
use crate::state::WorkflowState;

/// Run the test suite through the agent, resolving failures between attempts
pub struct TestPhase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn parse_results(output: &str) -> Result<Vec<TestResult>, AdwError> {
    serde_json::from_str(strip_code_fence(output))
        .map_err(|e| AdwError::Unresolved(format!("test output was not a JSON result list: {}", e)))
}

#[async_trait]
impl Phase for TestPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Test
    }

    fn max_attempts(&self, config: &Config) -> u32 {
        config.phases.max_test_attempts
    }

    async fn attempt(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
        attempt: &Attempt,
    ) -> Result<AttemptOutcome, AdwError> {
        let worktree = ctx.worktree(state)?;

        if let Some(failures) = &attempt.feedback {
            info!(attempt = attempt.number, "Resolving failed tests before re-running");
            let request = ctx
                .request(state, agent::TEST_RESOLVER, "/resolve_failed_test", worktree.clone())
                .arg(failures.clone());
            let response = ctx.run_agent(state, request).await?;
            if !response.success {
                warn!("Test resolver failed: {}", response.output);
            }
        }

        let mut request = ctx.request(state, agent::TEST_RUNNER, "/test", worktree.clone());
        if ctx.options.skip_e2e {
            request = request.arg("--skip-e2e");
        }
        let response = ctx.run_agent(state, request).await?;
        if !response.success {
            return Err(AdwError::agent_failed(agent::TEST_RUNNER, response.output));
        }

        let results = parse_results(&response.output)?;
        let failed: Vec<&TestResult> = results.iter().filter(|r| !r.passed).collect();
        if !failed.is_empty() {
            let names: Vec<&str> = failed.iter().map(|r| r.test_name.as_str()).collect();
            warn!(failed = ?names, "Tests failed");
            let detail = serde_json::to_string(&failed).unwrap_or_else(|_| names.join(", "));
            return Err(AdwError::Unresolved(detail));
        }

        Ok(AttemptOutcome::Done(format!("🧪 {} test(s) passed", results.len())))
    }

    async fn on_success(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
    ) -> Result<(), AdwError> {
        ctx.commit(state, PhaseName::Test).await?;
        ctx.publish(state).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results() {
        let results = parse_results(
            "```json\n[{\"test_name\":\"unit\",\"passed\":true},{\"test_name\":\"e2e_login\",\"passed\":false,\"error\":\"timeout\"}]\n```",
        )
        .unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[1].passed);
        assert_eq!(results[1].error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_unparseable_results_are_retryable() {
        let err = parse_results("All good!").unwrap_err();
        assert!(err.is_retryable());
    }
}
