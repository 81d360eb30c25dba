//! LLM agent invocation.
//!
//! Phases call agents through [`AgentRunner`] so tests can substitute a stub.
//! [`ClaudeCliRunner`] is the production implementation.

mod claude;

pub use claude::ClaudeCliRunner;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

use crate::state::TokenUsage;

pub const ISSUE_CLASSIFIER: &str = "issue_classifier";
pub const BRANCH_GENERATOR: &str = "branch_generator";
pub const ISSUE_CLARIFIER: &str = "issue_clarifier";
pub const DOCS_LOADER: &str = "docs_loader";
pub const SCOUT: &str = "codebase_scout";
pub const PLANNER: &str = "sdlc_planner";
pub const SCOUT_PLANNER: &str = "scout_planner";
pub const IMPLEMENTOR: &str = "sdlc_implementor";
pub const PARALLEL_BUILDER: &str = "parallel_builder";
pub const TEST_RUNNER: &str = "test_runner";
pub const TEST_RESOLVER: &str = "test_resolver";
pub const REVIEWER: &str = "reviewer";
pub const REVIEW_PATCHER: &str = "review_patcher";
pub const DOCUMENTER: &str = "documenter";
pub const SHIPPER: &str = "shipper";
/// Identity used for comments that no single agent owns
pub const OPS: &str = "ops";

/// One agent invocation
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Logical agent identity; token usage is accounted under this name
    pub agent_name: String,
    /// Slash command, e.g. `/implement`
    pub command: String,
    pub args: Vec<String>,
    pub workflow_id: String,
    pub working_dir: PathBuf,
    pub model: Option<String>,
}

impl AgentRequest {
    pub fn new(
        agent_name: &str,
        command: &str,
        workflow_id: &str,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            workflow_id: workflow_id.to_string(),
            working_dir: working_dir.into(),
            model: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Full prompt line: the command followed by its arguments
    pub fn prompt(&self) -> String {
        let mut prompt = self.command.clone();
        for arg in &self.args {
            prompt.push(' ');
            prompt.push_str(arg);
        }
        prompt
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentResponse {
    pub success: bool,
    pub output: String,
    /// Always populated, zero when the agent did not report usage
    pub token_usage: TokenUsage,
}

impl AgentResponse {
    pub fn success(output: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self {
            success: true,
            output: output.into(),
            token_usage,
        }
    }

    pub fn failure(output: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self {
            success: false,
            output: output.into(),
            token_usage,
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the agent. `Err` is reserved for failing to start it at all; an agent
    /// that ran and failed is `Ok` with `success == false`.
    async fn run(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Strip a surrounding markdown code fence that models sometimes add
pub fn strip_code_fence(output: &str) -> &str {
    let trimmed = output.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening fence line
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_joins_command_and_args() {
        let request = AgentRequest::new(IMPLEMENTOR, "/implement", "wf-001", "/tmp")
            .arg("specs/42.md");
        assert_eq!(request.prompt(), "/implement specs/42.md");
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("  plain  "), "plain");
        assert_eq!(strip_code_fence("```\nfeature/x\n```\n"), "feature/x");
    }
}
