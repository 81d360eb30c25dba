//! Trigger daemons: poll GitHub issues for workflow commands and launch them.
//!
//! All three daemons share the detection core in this module. A command is a
//! token such as `adw_plan_build_iso` in the latest issue comment (or the issue
//! body while it has no comments), optionally followed by a workflow id.
//! [`CommentTracker`] remembers the last comment seen per issue so the same
//! comment never launches twice, and comments carrying the bot identifier are
//! recorded but never acted on. When a launch fails the daemon forgets the
//! comment again, so the next cycle retries it.

pub mod chain;
pub mod cron;
pub mod launcher;
pub mod parallel;

pub use chain::ChainTrigger;
pub use cron::CronTrigger;
pub use launcher::{DetachedLauncher, Launched, WorkflowLauncher};
pub use parallel::ParallelTrigger;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent;
use crate::github::{format_issue_message, is_bot_text, Issue, IssueTracker};
use crate::phases::PhaseName;
use crate::pipeline::Pipeline;
use crate::state::make_workflow_id;

lazy_static! {
    static ref COMMAND_PATTERN: Regex =
        Regex::new(r"(?i)\badw_([a-z_]+)\b").expect("Invalid command regex");
    static ref TRAILING_ID_PATTERN: Regex =
        Regex::new(r"^\s+([a-z0-9]{8})\b").expect("Invalid id regex");
    static ref LABELED_ID_PATTERN: Regex =
        Regex::new(r"(?i)\badw_id:\s*`?([a-z0-9_-]+)`?").expect("Invalid adw_id regex");
}

/// Key used when an issue has no comments and the body is inspected instead
const BODY_KEY: &str = "issue-body";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Phase(PhaseName),
    Pipeline(Pipeline),
}

impl Workflow {
    fn from_token(token: &str) -> Option<Self> {
        let name = token.strip_suffix("_iso").unwrap_or(token);
        if let Ok(phase) = name.parse::<PhaseName>() {
            return Some(Workflow::Phase(phase));
        }
        // Pipelines are only addressable by their full names
        match name {
            "sdlc" | "sdlc_zte" | "plan_build" | "plan_build_test" | "plan_build_test_review"
            | "plan_build_document" | "plan_build_review" => name.parse().ok().map(Workflow::Pipeline),
            _ => None,
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workflow::Phase(phase) => write!(f, "adw_{}_iso", phase),
            Workflow::Pipeline(Pipeline::Zte) => f.write_str("adw_sdlc_zte_iso"),
            Workflow::Pipeline(pipeline) => write!(f, "adw_{}_iso", pipeline),
        }
    }
}

/// A workflow invocation found in issue text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowCommand {
    pub workflow: Workflow,
    pub workflow_id: Option<String>,
}

impl WorkflowCommand {
    /// Find the first known workflow token in `text`
    pub fn parse(text: &str) -> Option<Self> {
        for caps in COMMAND_PATTERN.captures_iter(text) {
            let token = caps[1].to_lowercase();
            let Some(workflow) = Workflow::from_token(&token) else {
                continue;
            };
            let end = caps.get(0).map_or(0, |m| m.end());
            let workflow_id = LABELED_ID_PATTERN
                .captures(text)
                .or_else(|| TRAILING_ID_PATTERN.captures(&text[end..]))
                .map(|c| c[1].to_string());
            return Some(Self {
                workflow,
                workflow_id,
            });
        }
        None
    }

    /// Phases after plan operate on an existing workflow
    pub fn requires_id(&self) -> bool {
        matches!(self.workflow, Workflow::Phase(phase) if phase != PhaseName::Plan)
    }
}

/// Last comment seen per issue
#[derive(Debug, Default)]
pub struct CommentTracker {
    last_seen: HashMap<u64, String>,
}

impl CommentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new(&self, issue_number: u64, key: &str) -> bool {
        self.last_seen.get(&issue_number).map(String::as_str) != Some(key)
    }

    pub fn record(&mut self, issue_number: u64, key: impl Into<String>) {
        self.last_seen.insert(issue_number, key.into());
    }

    pub fn forget(&mut self, issue_number: u64) {
        self.last_seen.remove(&issue_number);
    }
}

/// Result of inspecting one issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Nothing new, a bot comment, or no command
    Idle,
    Launch(WorkflowCommand),
    /// A dependent workflow was requested without a workflow id
    MissingId(WorkflowCommand),
}

/// Inspect the latest comment (or body) of `issue` and record it as seen
pub fn detect(issue: &Issue, bot_identifier: &str, seen: &mut CommentTracker) -> Detection {
    let (key, text) = match issue.latest_comment() {
        Some(comment) if !comment.id.is_empty() => (comment.id.clone(), comment.body.as_str()),
        Some(comment) => (format!("comment-{}", issue.comments.len()), comment.body.as_str()),
        None => (BODY_KEY.to_string(), issue.body.as_str()),
    };

    if !seen.is_new(issue.number, &key) {
        return Detection::Idle;
    }
    seen.record(issue.number, key);

    if is_bot_text(bot_identifier, text) {
        debug!(issue = issue.number, "Latest comment is from the bot, skipping");
        return Detection::Idle;
    }

    match WorkflowCommand::parse(text) {
        Some(command) if command.requires_id() && command.workflow_id.is_none() => {
            Detection::MissingId(command)
        }
        Some(command) => Detection::Launch(command),
        None => Detection::Idle,
    }
}

/// Collaborators every daemon needs to act on a detection
#[derive(Clone)]
pub struct TriggerContext {
    pub tracker: Arc<dyn IssueTracker>,
    pub launcher: Arc<dyn WorkflowLauncher>,
}

impl TriggerContext {
    pub fn new(tracker: Arc<dyn IssueTracker>, launcher: Arc<dyn WorkflowLauncher>) -> Self {
        Self { tracker, launcher }
    }

    async fn comment(&self, issue_number: u64, workflow_id: &str, message: &str) {
        let body = format_issue_message(self.tracker.bot_identifier(), workflow_id, agent::OPS, message);
        if let Err(e) = self.tracker.comment(issue_number, &body).await {
            warn!("Failed to comment on issue #{}: {:#}", issue_number, e);
        }
    }

    /// Act on a detection. Returns the launched workflow id and its handle.
    pub async fn dispatch(
        &self,
        issue_number: u64,
        detection: Detection,
    ) -> Result<Option<(String, Launched)>> {
        match detection {
            Detection::Idle => Ok(None),
            Detection::MissingId(command) => {
                warn!(issue = issue_number, workflow = %command.workflow, "Rejected: missing workflow id");
                self.comment(
                    issue_number,
                    "unknown",
                    &format!(
                        "❌ `{}` needs an existing workflow id, e.g. `{} <adw_id>`. Run a plan first.",
                        command.workflow, command.workflow
                    ),
                )
                .await;
                Ok(None)
            }
            Detection::Launch(command) => {
                let workflow_id = command.workflow_id.clone().unwrap_or_else(make_workflow_id);
                let launched = self
                    .launcher
                    .launch(issue_number, &command.workflow, &workflow_id)
                    .await?;
                info!(issue = issue_number, %workflow_id, workflow = %command.workflow, pid = ?launched.pid(), "Workflow launched");
                self.comment(
                    issue_number,
                    &workflow_id,
                    &format!("🤖 Launched `{}` with workflow id `{}`", command.workflow, workflow_id),
                )
                .await;
                Ok(Some((workflow_id, launched)))
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received, no new workflows will be launched");
}
