//! Error taxonomy for workflow phases.
//!
//! Collaborator calls (git, gh, the agent CLI) return `anyhow::Result` and are
//! folded into [`AdwError::Transient`] at the phase boundary. Everything else a
//! phase can fail with has its own variant so the runner can decide between
//! retrying, failing hard, and what to tell the operator on the issue thread.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdwError {
    /// State record or worktree missing when a phase expected it
    #[error("{what} not found")]
    NotFound { what: String, hint: String },

    /// Required workflow state fields are empty
    #[error("workflow state is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    /// Structural precondition failed (e.g. no pull request before ship)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Agent reported success but verification found no real change
    #[error("agent reported success but verification failed: {0}")]
    FalseSuccess(String),

    /// Test or review findings a further attempt may resolve
    #[error("unresolved: {0}")]
    Unresolved(String),

    #[error("agent {agent} failed: {message}")]
    AgentFailed { agent: String, message: String },

    /// Subprocess or network failure from git, gh or the agent CLI
    #[error(transparent)]
    Transient(#[from] anyhow::Error),

    #[error("state file {} is corrupt: {source}", path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),

    /// Another process holds the advisory lock for this workflow
    #[error("workflow {0} is locked by another process")]
    StateBusy(String),

    #[error("{0} is already set and cannot change")]
    Immutable(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdwError {
    pub fn not_found(what: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            hint: hint.into(),
        }
    }

    pub fn agent_failed(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentFailed {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt of the same phase could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FalseSuccess(_) | Self::Unresolved(_))
    }

    /// Message without the variant prefix; used as feedback for the next attempt
    pub fn detail(&self) -> String {
        match self {
            Self::FalseSuccess(msg) | Self::Unresolved(msg) | Self::Validation(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Operator-facing next step, posted alongside the error
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::NotFound { hint, .. } => Some(hint.clone()),
            Self::MissingFields(_) => {
                Some("Run the earlier phases for this workflow first.".to_string())
            }
            Self::CorruptState { path, .. } => Some(format!(
                "Inspect or remove {} and restart the workflow.",
                path.display()
            )),
            Self::StateBusy(_) => {
                Some("Wait for the running phase to finish before starting another.".to_string())
            }
            Self::FalseSuccess(_) => Some(
                "The agent did not change any files. Check the plan and re-run build.".to_string(),
            ),
            _ => None,
        }
    }
}
