//! The git capability phases depend on.
//!
//! Phases only see [`GitOps`]; [`CliGitOps`] backs it with the git CLI and
//! retries the network-bound calls with exponential backoff.

use anyhow::Result;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::git::cli::GitCli;

#[async_trait]
pub trait GitOps: Send + Sync {
    /// Stage everything in `cwd` and commit. Returns false if there was nothing to commit.
    async fn commit(&self, message: &str, cwd: &Path) -> Result<bool>;

    /// Push `branch` to the remote, setting upstream
    async fn push(&self, branch: &str, cwd: &Path) -> Result<()>;

    /// Merge `branch` into `target` in the checkout at `cwd` and push `target`.
    /// The branch checked out in `cwd` beforehand is restored afterwards.
    async fn merge_to_target(&self, branch: &str, target: &str, cwd: &Path) -> Result<()>;

    async fn checkout(&self, branch: &str, cwd: &Path) -> Result<()>;

    /// Files with uncommitted changes, including untracked files
    async fn diff_names(&self, cwd: &Path) -> Result<Vec<String>>;

    async fn current_branch(&self, cwd: &Path) -> Result<String>;

    async fn head_commit(&self, cwd: &Path) -> Result<String>;

    /// Files touched by commits made after `rev`
    async fn files_changed_since(&self, rev: &str, cwd: &Path) -> Result<Vec<String>>;
}

/// [`GitOps`] over the git CLI
pub struct CliGitOps {
    remote: String,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl CliGitOps {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Create with custom retry settings
    pub fn with_retry_config(mut self, max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    fn retry_strategy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }

    /// Network hiccups are worth retrying; rejected pushes and conflicts are not
    fn should_retry(err: &anyhow::Error) -> bool {
        let err_str = err.to_string().to_lowercase();

        if err_str.contains("rejected")
            || err_str.contains("conflict")
            || err_str.contains("permission denied")
            || err_str.contains("authentication failed")
        {
            return false;
        }

        err_str.contains("timed out")
            || err_str.contains("timeout")
            || err_str.contains("connection reset")
            || err_str.contains("could not resolve host")
            || err_str.contains("early eof")
            || err_str.contains("502")
            || err_str.contains("503")
            || err_str.contains("504")
    }

    async fn fetch_with_retry(&self, cwd: &Path) -> Result<()> {
        let op = || async { GitCli::fetch(cwd, &self.remote).await };
        op.retry(self.retry_strategy())
            .when(Self::should_retry)
            .notify(|err, dur| warn!("Retrying git fetch after {:?}: {}", dur, err))
            .await
    }

    async fn push_with_retry(&self, branch: &str, cwd: &Path, set_upstream: bool) -> Result<()> {
        let op = || async { GitCli::push(cwd, &self.remote, branch, set_upstream).await };
        op.retry(self.retry_strategy())
            .when(Self::should_retry)
            .notify(|err, dur| warn!("Retrying git push after {:?}: {}", dur, err))
            .await
    }

    async fn merge_steps(&self, branch: &str, target: &str, cwd: &Path) -> Result<()> {
        self.fetch_with_retry(cwd).await?;
        GitCli::checkout(cwd, target).await?;
        GitCli::pull(cwd, &self.remote, target).await?;

        let message = format!("Merge branch '{}' via ADW ship", branch);
        if let Err(e) = GitCli::merge_no_ff(cwd, branch, &message).await {
            if let Err(abort_err) = GitCli::merge_abort(cwd).await {
                warn!("git merge --abort failed: {}", abort_err);
            }
            return Err(e);
        }

        self.push_with_retry(target, cwd, false).await
    }
}

#[async_trait]
impl GitOps for CliGitOps {
    #[instrument(skip(self, message), fields(cwd = %cwd.display()))]
    async fn commit(&self, message: &str, cwd: &Path) -> Result<bool> {
        GitCli::commit_all(cwd, message).await
    }

    #[instrument(skip(self), fields(cwd = %cwd.display()))]
    async fn push(&self, branch: &str, cwd: &Path) -> Result<()> {
        self.push_with_retry(branch, cwd, true).await
    }

    #[instrument(skip(self), fields(cwd = %cwd.display()))]
    async fn merge_to_target(&self, branch: &str, target: &str, cwd: &Path) -> Result<()> {
        let original = GitCli::current_branch(cwd).await?;

        let result = self.merge_steps(branch, target, cwd).await;

        match GitCli::current_branch(cwd).await {
            Ok(current) if current == original => {}
            _ => {
                if let Err(e) = GitCli::checkout(cwd, &original).await {
                    warn!("Failed to restore branch '{}': {}", original, e);
                }
            }
        }

        if result.is_ok() {
            info!(%branch, %target, "Merged and pushed");
        }
        result
    }

    async fn checkout(&self, branch: &str, cwd: &Path) -> Result<()> {
        GitCli::checkout(cwd, branch).await
    }

    async fn diff_names(&self, cwd: &Path) -> Result<Vec<String>> {
        GitCli::changed_files(cwd).await
    }

    async fn current_branch(&self, cwd: &Path) -> Result<String> {
        GitCli::current_branch(cwd).await
    }

    async fn head_commit(&self, cwd: &Path) -> Result<String> {
        GitCli::head_commit(cwd).await
    }

    async fn files_changed_since(&self, rev: &str, cwd: &Path) -> Result<Vec<String>> {
        GitCli::files_changed_since(cwd, rev).await
    }
}
