//! Git CLI wrapper for worktree, branch and merge operations.
//!
//! Shells out to `git` rather than linking libgit2 so hooks, credentials and
//! worktree metadata behave exactly as they do for a human at the terminal.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Low-level git command wrapper
pub struct GitCli;

impl GitCli {
    /// Execute a git command and return stdout
    async fn run_git(args: &[&str], cwd: &Path) -> Result<String> {
        Ok(Self::run_git_raw(args, cwd).await?.trim().to_string())
    }

    /// Like `run_git` but keeps leading whitespace, which porcelain formats rely on
    async fn run_git_raw(args: &[&str], cwd: &Path) -> Result<String> {
        debug!(?args, ?cwd, "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute git command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    async fn run_git_silent(args: &[&str], cwd: &Path) -> Result<()> {
        Self::run_git(args, cwd).await?;
        Ok(())
    }

    /// Get the current branch name
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn current_branch(path: &Path) -> Result<String> {
        Self::run_git(&["rev-parse", "--abbrev-ref", "HEAD"], path).await
    }

    /// Get the URL of a remote
    #[instrument(skip_all, fields(path = %path.display(), remote))]
    pub async fn get_remote_url(path: &Path, remote: &str) -> Result<String> {
        Self::run_git(&["remote", "get-url", remote], path).await
    }

    /// Fetch from remote
    #[instrument(skip_all, fields(path = %path.display(), remote))]
    pub async fn fetch(path: &Path, remote: &str) -> Result<()> {
        Self::run_git_silent(&["fetch", remote], path).await
    }

    /// Check whether a local branch exists
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub async fn branch_exists(path: &Path, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        match Self::run_git(&["show-ref", "--verify", "--quiet", &refname], path).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Delete a remote branch
    #[instrument(skip_all, fields(path = %path.display(), remote, branch))]
    pub async fn delete_remote_branch(path: &Path, remote: &str, branch: &str) -> Result<()> {
        Self::run_git_silent(&["push", remote, "--delete", branch], path).await
    }

    /// Push a branch to remote
    #[instrument(skip_all, fields(path = %path.display(), remote, branch))]
    pub async fn push(path: &Path, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
        if set_upstream {
            Self::run_git_silent(&["push", "-u", remote, branch], path).await
        } else {
            Self::run_git_silent(&["push", remote, branch], path).await
        }
    }

    /// Check out an existing branch
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub async fn checkout(path: &Path, branch: &str) -> Result<()> {
        Self::run_git_silent(&["checkout", branch], path).await
    }

    /// Fast-forward the current branch from its remote counterpart
    #[instrument(skip_all, fields(path = %path.display(), remote, branch))]
    pub async fn pull(path: &Path, remote: &str, branch: &str) -> Result<()> {
        Self::run_git_silent(&["pull", remote, branch], path).await
    }

    /// Merge `branch` into the current branch with a merge commit
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub async fn merge_no_ff(path: &Path, branch: &str, message: &str) -> Result<()> {
        Self::run_git_silent(&["merge", "--no-ff", "-m", message, branch], path).await
    }

    /// Abort an in-progress merge
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn merge_abort(path: &Path) -> Result<()> {
        Self::run_git_silent(&["merge", "--abort"], path).await
    }

    /// Add a worktree
    #[instrument(skip_all, fields(repo_path = %repo_path.display(), worktree_path = %worktree_path.display(), branch))]
    pub async fn add_worktree(
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        create_branch: bool,
        base: Option<&str>,
    ) -> Result<()> {
        let worktree_str = worktree_path.to_string_lossy();

        if create_branch {
            let base_ref = base.unwrap_or("HEAD");
            Self::run_git_silent(
                &["worktree", "add", "-b", branch, &worktree_str, base_ref],
                repo_path,
            )
            .await
        } else {
            Self::run_git_silent(&["worktree", "add", &worktree_str, branch], repo_path).await
        }
    }

    /// Remove a worktree
    #[instrument(skip_all, fields(repo_path = %repo_path.display(), worktree_path = %worktree_path.display(), force))]
    pub async fn remove_worktree(
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<()> {
        let worktree_str = worktree_path.to_string_lossy();

        if force {
            Self::run_git_silent(&["worktree", "remove", "--force", &worktree_str], repo_path).await
        } else {
            Self::run_git_silent(&["worktree", "remove", &worktree_str], repo_path).await
        }
    }

    /// Prune worktree metadata
    #[instrument(skip_all, fields(repo_path = %repo_path.display()))]
    pub async fn prune_worktrees(repo_path: &Path) -> Result<()> {
        Self::run_git_silent(&["worktree", "prune"], repo_path).await
    }

    /// List all worktrees
    #[instrument(skip_all, fields(repo_path = %repo_path.display()))]
    pub async fn list_worktrees(repo_path: &Path) -> Result<Vec<WorktreeEntry>> {
        let output = Self::run_git(&["worktree", "list", "--porcelain"], repo_path).await?;
        Ok(parse_worktree_list(&output))
    }

    /// Check if path is inside a git worktree
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn is_worktree(path: &Path) -> Result<bool> {
        let result = Self::run_git(&["rev-parse", "--is-inside-work-tree"], path).await;
        match result {
            Ok(output) => Ok(output == "true"),
            Err(_) => Ok(false),
        }
    }

    /// Get the HEAD commit SHA
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn head_commit(path: &Path) -> Result<String> {
        Self::run_git(&["rev-parse", "HEAD"], path).await
    }

    /// Resolve a ref to its commit, failing if it does not exist
    #[instrument(skip_all, fields(path = %path.display(), refname))]
    pub async fn verify_ref(path: &Path, refname: &str) -> Result<String> {
        Self::run_git(&["rev-parse", "--verify", "--quiet", refname], path).await
    }

    /// Paths with staged, unstaged or untracked changes
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn changed_files(path: &Path) -> Result<Vec<String>> {
        let output =
            Self::run_git_raw(&["status", "--porcelain", "--untracked-files=all"], path).await?;
        Ok(parse_porcelain_status(&output))
    }

    /// Paths touched by commits made after `rev`
    #[instrument(skip_all, fields(path = %path.display(), rev))]
    pub async fn files_changed_since(path: &Path, rev: &str) -> Result<Vec<String>> {
        let output = Self::run_git(&["diff", "--name-only", rev, "HEAD"], path).await?;
        Ok(output
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Stage everything and commit. Returns false when there was nothing to commit.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn commit_all(path: &Path, message: &str) -> Result<bool> {
        Self::run_git_silent(&["add", "-A"], path).await?;
        let staged = Self::run_git(&["diff", "--cached", "--name-only"], path).await?;
        if staged.is_empty() {
            debug!("Nothing staged, skipping commit");
            return Ok(false);
        }
        Self::run_git_silent(&["commit", "-m", message], path).await?;
        Ok(true)
    }
}

/// Entry from `git worktree list --porcelain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: String,
    pub branch: Option<String>,
    pub head: Option<String>,
    pub bare: bool,
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: path.to_string(),
                branch: None,
                head: None,
                bare: false,
            });
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(ref mut entry) = current {
                entry.head = Some(head.to_string());
            }
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(ref mut entry) = current {
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                entry.branch = Some(short.to_string());
            }
        } else if line == "bare" {
            if let Some(ref mut entry) = current {
                entry.bare = true;
            }
        }
    }

    if let Some(entry) = current {
        entries.push(entry);
    }

    entries
}

/// Extract file paths from `git status --porcelain` (v1) output
fn parse_porcelain_status(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            // Renames are reported as "old -> new"
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            path.trim_matches('"').to_string()
        })
        .collect()
}
