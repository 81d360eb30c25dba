//! GitHub issue and pull request integration.
//!
//! Phases and triggers talk to GitHub only through the [`IssueTracker`] and
//! [`PullRequests`] traits. [`GhIssueTracker`] implements both over the `gh` CLI.

mod gh_cli;
mod rate_limit;
mod tracker;

pub use gh_cli::{repo_from_remote_url, GhCli};
pub use rate_limit::{RateLimitPolicy, RateLimiter};
pub use tracker::{GhIssueTracker, IssueTracker, PullRequests};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: Option<Account>,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Issue record as returned by `gh issue view/list --json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub author: Option<Account>,
    #[serde(default)]
    pub assignees: Vec<Account>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub comments: Vec<IssueComment>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: String,
}

impl Issue {
    pub fn is_open(&self) -> bool {
        self.state.is_empty() || self.state.eq_ignore_ascii_case("open")
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive assignee match
    pub fn is_assigned_to(&self, login: &str) -> bool {
        self.assignees
            .iter()
            .any(|a| a.login.eq_ignore_ascii_case(login))
    }

    pub fn latest_comment(&self) -> Option<&IssueComment> {
        self.comments.last()
    }

    /// Compact JSON (number, title, body) handed to agents
    pub fn minimal_json(&self) -> String {
        serde_json::json!({
            "number": self.number,
            "title": self.title,
            "body": self.body,
        })
        .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub state: PrState,
}

#[derive(Debug, Clone)]
pub struct CreatePullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Format a comment as `{bot} {workflow_id}_{agent}: {message}`
pub fn format_issue_message(
    bot_identifier: &str,
    workflow_id: &str,
    agent_name: &str,
    message: &str,
) -> String {
    format!("{} {}_{}: {}", bot_identifier, workflow_id, agent_name, message)
}

/// Prefix `body` with the bot identifier unless it already carries it
pub fn tag_comment(bot_identifier: &str, body: &str) -> String {
    if body.starts_with(bot_identifier) {
        body.to_string()
    } else {
        format!("{} {}", bot_identifier, body)
    }
}

/// Whether text was posted by this system
pub fn is_bot_text(bot_identifier: &str, body: &str) -> bool {
    body.contains(bot_identifier)
}
