use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use super::{
    repo_from_remote_url, tag_comment, CreatePullRequest, GhCli, Issue, PrState, PullRequest,
    RateLimitPolicy, RateLimiter,
};
use crate::config::Config;
use crate::git::GitCli;

const ISSUE_VIEW_FIELDS: &str =
    "number,title,body,state,author,assignees,labels,comments,createdAt,updatedAt,url";
const ISSUE_LIST_FIELDS: &str = "number,title,body,state,labels,assignees,createdAt,updatedAt,url";

/// Issue tracker capability used by phases and triggers
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch(&self, number: u64) -> Result<Issue>;

    /// Post a comment. Implementations tag the body with the bot identifier.
    async fn comment(&self, number: u64, body: &str) -> Result<()>;

    async fn list_open(&self) -> Result<Vec<Issue>>;

    async fn current_user(&self) -> Result<String>;

    async fn is_assigned_to_current_user(&self, number: u64) -> Result<bool> {
        let user = self.current_user().await?;
        let issue = self.fetch(number).await?;
        Ok(issue.is_assigned_to(&user))
    }

    /// Label the issue as in progress and assign it to the current user (best effort)
    async fn mark_in_progress(&self, number: u64) -> Result<()>;

    async fn add_label(&self, number: u64, label: &str) -> Result<()>;

    async fn remove_label(&self, number: u64, label: &str) -> Result<()>;

    fn bot_identifier(&self) -> &str;
}

/// Pull request lookup and creation
#[async_trait]
pub trait PullRequests: Send + Sync {
    /// Most recent PR with `branch` as head, in any state
    async fn find_for_branch(&self, branch: &str) -> Result<Option<PullRequest>>;

    async fn create(&self, request: &CreatePullRequest) -> Result<PullRequest>;
}

#[derive(Debug, Deserialize)]
struct GhAssigneesResponse {
    #[serde(default)]
    assignees: Vec<super::Account>,
}

/// [`IssueTracker`] and [`PullRequests`] over the `gh` CLI
pub struct GhIssueTracker {
    gh: GhCli,
    repo: String,
    limiter: RateLimiter,
    bot_identifier: String,
    in_progress_label: String,
    current_user: OnceCell<String>,
}

impl GhIssueTracker {
    pub fn new(gh: GhCli, repo: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            gh,
            repo: repo.into(),
            limiter,
            bot_identifier: "[ADW-AGENTS]".to_string(),
            in_progress_label: "in_progress".to_string(),
            current_user: OnceCell::new(),
        }
    }

    pub fn with_bot_identifier(mut self, bot_identifier: impl Into<String>) -> Self {
        self.bot_identifier = bot_identifier.into();
        self
    }

    pub fn with_in_progress_label(mut self, label: impl Into<String>) -> Self {
        self.in_progress_label = label.into();
        self
    }

    /// Build from config, deriving `owner/name` from the git remote when not configured
    pub async fn from_config(config: &Config) -> Result<Self> {
        if !GhCli::is_installed() {
            return Err(anyhow!(
                "GitHub CLI (gh) is not installed. See https://cli.github.com and run `gh auth login`."
            ));
        }

        let repo = match &config.github.repo {
            Some(repo) => repo.clone(),
            None => Self::detect_repo(&config.repo_root(), &config.git.remote).await?,
        };

        Ok(Self::new(
            GhCli::from_env(&config.github.token_env),
            repo,
            RateLimiter::new(RateLimitPolicy::from_config(&config.github)),
        )
        .with_bot_identifier(config.github.bot_identifier.clone())
        .with_in_progress_label(config.github.in_progress_label.clone()))
    }

    async fn detect_repo(repo_root: &Path, remote: &str) -> Result<String> {
        let url = GitCli::get_remote_url(repo_root, remote)
            .await
            .context("No GitHub repository configured and the git remote could not be read")?;
        repo_from_remote_url(&url)
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    async fn gh(&self, operation: &str, args: &[&str]) -> Result<String> {
        self.limiter.run(operation, || self.gh.run(args)).await
    }
}

#[async_trait]
impl IssueTracker for GhIssueTracker {
    #[instrument(skip(self))]
    async fn fetch(&self, number: u64) -> Result<Issue> {
        let number = number.to_string();
        let output = self
            .gh(
                "issue view",
                &["issue", "view", &number, "-R", &self.repo, "--json", ISSUE_VIEW_FIELDS],
            )
            .await?;
        serde_json::from_str(&output).context("Failed to parse gh issue view output")
    }

    #[instrument(skip(self, body))]
    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        let body = tag_comment(&self.bot_identifier, body);
        self.gh(
            "issue comment",
            &["issue", "comment", &number, "-R", &self.repo, "--body", &body],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_open(&self) -> Result<Vec<Issue>> {
        let output = self
            .gh(
                "issue list",
                &[
                    "issue",
                    "list",
                    "-R",
                    &self.repo,
                    "--state",
                    "open",
                    "--json",
                    ISSUE_LIST_FIELDS,
                    "--limit",
                    "1000",
                ],
            )
            .await?;
        serde_json::from_str(&output).context("Failed to parse gh issue list output")
    }

    async fn current_user(&self) -> Result<String> {
        self.current_user
            .get_or_try_init(|| async {
                self.gh("api user", &["api", "user", "--jq", ".login"]).await
            })
            .await
            .cloned()
    }

    // Only the assignees are needed, so skip the full issue payload
    async fn is_assigned_to_current_user(&self, number: u64) -> Result<bool> {
        let user = self.current_user().await?;
        let number = number.to_string();
        let output = self
            .gh(
                "issue view",
                &["issue", "view", &number, "-R", &self.repo, "--json", "assignees"],
            )
            .await?;
        let response: GhAssigneesResponse =
            serde_json::from_str(&output).context("Failed to parse assignees")?;
        Ok(response
            .assignees
            .iter()
            .any(|a| a.login.eq_ignore_ascii_case(&user)))
    }

    #[instrument(skip(self))]
    async fn mark_in_progress(&self, number: u64) -> Result<()> {
        let number = number.to_string();
        if let Err(e) = self
            .gh(
                "issue edit",
                &["issue", "edit", &number, "-R", &self.repo, "--add-label", &self.in_progress_label],
            )
            .await
        {
            warn!("Could not add '{}' label: {}", self.in_progress_label, e);
        }
        match self
            .gh(
                "issue edit",
                &["issue", "edit", &number, "-R", &self.repo, "--add-assignee", "@me"],
            )
            .await
        {
            Ok(_) => info!("Assigned issue #{} to current user", number),
            Err(e) => warn!("Could not assign issue #{}: {}", number, e),
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_label(&self, number: u64, label: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(
            "issue edit",
            &["issue", "edit", &number, "-R", &self.repo, "--add-label", label],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(
            "issue edit",
            &["issue", "edit", &number, "-R", &self.repo, "--remove-label", label],
        )
        .await?;
        Ok(())
    }

    fn bot_identifier(&self) -> &str {
        &self.bot_identifier
    }
}

#[async_trait]
impl PullRequests for GhIssueTracker {
    #[instrument(skip(self))]
    async fn find_for_branch(&self, branch: &str) -> Result<Option<PullRequest>> {
        let output = self
            .gh(
                "pr list",
                &[
                    "pr", "list", "-R", &self.repo, "--head", branch, "--state", "all", "--json",
                    "number,url,state", "--limit", "1",
                ],
            )
            .await?;
        let prs: Vec<PullRequest> =
            serde_json::from_str(&output).context("Failed to parse gh pr list output")?;
        Ok(prs.into_iter().next())
    }

    #[instrument(skip(self, request), fields(head = %request.head, base = %request.base))]
    async fn create(&self, request: &CreatePullRequest) -> Result<PullRequest> {
        let output = self
            .gh(
                "pr create",
                &[
                    "pr",
                    "create",
                    "-R",
                    &self.repo,
                    "--head",
                    &request.head,
                    "--base",
                    &request.base,
                    "--title",
                    &request.title,
                    "--body",
                    &request.body,
                ],
            )
            .await?;
        parse_created_pr(&output)
    }
}

/// `gh pr create` prints the new PR's URL as its last line
fn parse_created_pr(output: &str) -> Result<PullRequest> {
    let url = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("http"))
        .ok_or_else(|| anyhow!("gh pr create did not print a PR URL: {}", output))?;
    let number = url
        .rsplit('/')
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("Could not read PR number from {}", url))?;
    Ok(PullRequest {
        number,
        url: url.to_string(),
        state: PrState::Open,
    })
}
