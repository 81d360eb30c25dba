//! Git worktree manager for isolated workflow runs.
//!
//! Every workflow id gets exactly one worktree at `<trees>/<workflow_id>`,
//! created from the tip of the target branch on the remote. Creation holds a
//! per-path lock so two tasks in one process cannot race on the same id; across
//! processes the state lock serializes phases of one workflow.

use crate::config::Config;
use crate::error::AdwError;
use crate::git::cli::GitCli;
use crate::state::{validate_workflow_id, WorkflowState};
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

// Global locks for worktree creation and removal
lazy_static::lazy_static! {
    static ref WORKTREE_LOCKS: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

async fn get_path_lock(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = WORKTREE_LOCKS.lock().await;
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Scratch directory under a workflow's state dir that destroy clears out
pub const AGENT_SCRATCH_DIR: &str = "agents";

/// What `destroy` managed to do
#[derive(Debug, Default)]
pub struct DestroyReport {
    /// The worktree directory is gone and git no longer lists it
    pub removed: bool,
    /// Non-fatal problems from the best-effort steps
    pub warnings: Vec<String>,
}

/// Manages one git worktree per workflow id
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    trees_dir: PathBuf,
    state_root: PathBuf,
    remote: String,
    target_branch: String,
}

impl WorktreeManager {
    pub fn new(
        repo_root: PathBuf,
        trees_dir: PathBuf,
        state_root: PathBuf,
        remote: impl Into<String>,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            repo_root,
            trees_dir,
            state_root,
            remote: remote.into(),
            target_branch: target_branch.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.repo_root(),
            config.trees_path(),
            config.state_root(),
            config.git.remote.clone(),
            config.git.target_branch.clone(),
        )
    }

    /// Deterministic worktree location for a workflow
    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.trees_dir.join(workflow_id)
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Create the worktree for `workflow_id` on a new branch `branch_name`.
    ///
    /// Fails if anything already occupies the path or git still has it
    /// registered.
    #[instrument(skip(self), fields(workflow_id = %workflow_id, branch = %branch_name))]
    pub async fn create(&self, workflow_id: &str, branch_name: &str) -> Result<PathBuf, AdwError> {
        validate_workflow_id(workflow_id)?;
        let worktree_path = self.path_for(workflow_id);

        let lock = get_path_lock(&worktree_path).await;
        let _guard = lock.lock().await;

        if worktree_path.exists() {
            return Err(AdwError::AlreadyExists(worktree_path));
        }
        if self.is_registered(&worktree_path).await? {
            // Directory gone but git still remembers it
            warn!("Stale worktree registration found, pruning");
            GitCli::prune_worktrees(&self.repo_root).await?;
            if self.is_registered(&worktree_path).await? {
                return Err(AdwError::AlreadyExists(worktree_path));
            }
        }

        fs::create_dir_all(&self.trees_dir)
            .await
            .context("Failed to create worktree parent directory")?;

        if let Err(e) = GitCli::fetch(&self.repo_root, &self.remote).await {
            warn!("Failed to fetch from {}: {}", self.remote, e);
        }

        let base_ref = self.base_ref().await;
        info!(?worktree_path, %base_ref, "Creating worktree");

        if let Err(e) = GitCli::add_worktree(
            &self.repo_root,
            &worktree_path,
            branch_name,
            true,
            Some(&base_ref),
        )
        .await
        {
            if !GitCli::branch_exists(&self.repo_root, branch_name).await? {
                return Err(e.context("Failed to create worktree").into());
            }
            debug!("Branch exists ({}), attaching it instead", e);
            GitCli::add_worktree(&self.repo_root, &worktree_path, branch_name, false, None)
                .await
                .context("Failed to create worktree from existing branch")?;
        }

        info!("Worktree created");
        Ok(worktree_path)
    }

    /// Remote tracking ref of the target branch, or the local branch when the
    /// remote ref is unavailable
    async fn base_ref(&self) -> String {
        let remote_ref = format!("{}/{}", self.remote, self.target_branch);
        let tracking = format!("refs/remotes/{}", remote_ref);
        match GitCli::verify_ref(&self.repo_root, &tracking).await {
            Ok(_) => remote_ref,
            Err(_) => {
                warn!(
                    "{} not found, basing worktree on local {}",
                    remote_ref, self.target_branch
                );
                self.target_branch.clone()
            }
        }
    }

    /// Check that the state's worktree is set, on disk, and still registered with git
    #[instrument(skip(self, state), fields(workflow_id = %workflow_id))]
    pub async fn validate(&self, workflow_id: &str, state: &WorkflowState) -> Result<(), AdwError> {
        let Some(path) = state.worktree_path() else {
            return Err(AdwError::not_found(
                format!("worktree path for workflow {}", workflow_id),
                "Run the plan phase first to create the worktree.",
            ));
        };

        if !path.is_dir() {
            return Err(AdwError::not_found(
                format!("worktree directory {}", path.display()),
                "The worktree was removed. Re-run the plan phase with a new workflow id.",
            ));
        }

        if !self.is_registered(path).await? {
            return Err(AdwError::not_found(
                format!("git worktree registration for {}", path.display()),
                "The directory exists but git does not list it. Run `git worktree prune` and re-plan.",
            ));
        }

        Ok(())
    }

    async fn is_registered(&self, path: &Path) -> Result<bool, AdwError> {
        let wanted = canonical(path);
        let entries = GitCli::list_worktrees(&self.repo_root).await?;
        Ok(entries
            .iter()
            .any(|entry| canonical(Path::new(&entry.path)) == wanted))
    }

    /// Remove the worktree, its registration, the remote branch and scratch output.
    ///
    /// Only failing to remove the worktree directory is an error; every other
    /// step is best effort and reported as a warning.
    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    pub async fn destroy(&self, workflow_id: &str) -> Result<DestroyReport, AdwError> {
        let worktree_path = self.path_for(workflow_id);
        let lock = get_path_lock(&worktree_path).await;
        let _guard = lock.lock().await;

        let mut report = DestroyReport::default();

        // Capture the branch before the registration disappears
        let wanted = canonical(&worktree_path);
        let branch = match GitCli::list_worktrees(&self.repo_root).await {
            Ok(entries) => entries
                .into_iter()
                .find(|e| canonical(Path::new(&e.path)) == wanted)
                .and_then(|e| e.branch),
            Err(e) => {
                report.warnings.push(format!("Could not list worktrees: {}", e));
                None
            }
        };

        if worktree_path.exists() {
            if let Err(e) = GitCli::remove_worktree(&self.repo_root, &worktree_path, true).await {
                warn!("git worktree remove --force failed: {}", e);
                report
                    .warnings
                    .push(format!("git worktree remove failed, deleted directory manually: {}", e));
                fs::remove_dir_all(&worktree_path)
                    .await
                    .with_context(|| format!("Failed to remove {}", worktree_path.display()))?;
            }
            report.removed = true;
        } else {
            report
                .warnings
                .push(format!("Worktree {} did not exist", worktree_path.display()));
        }

        if let Err(e) = GitCli::prune_worktrees(&self.repo_root).await {
            report.warnings.push(format!("Failed to prune worktrees: {}", e));
        }

        if let Some(branch) = branch {
            match GitCli::delete_remote_branch(&self.repo_root, &self.remote, &branch).await {
                Ok(()) => info!(%branch, "Deleted remote branch"),
                Err(e) if e.to_string().contains("remote ref does not exist") => {
                    debug!(%branch, "Remote branch already gone");
                }
                Err(e) => report
                    .warnings
                    .push(format!("Failed to delete remote branch '{}': {}", branch, e)),
            }
        }

        let scratch = self.state_root.join(workflow_id).join(AGENT_SCRATCH_DIR);
        if scratch.exists() {
            if let Err(e) = fs::remove_dir_all(&scratch).await {
                report
                    .warnings
                    .push(format!("Failed to remove {}: {}", scratch.display(), e));
            }
        }

        for warning in &report.warnings {
            warn!("{}", warning);
        }
        info!(removed = report.removed, "Worktree cleanup complete");
        Ok(report)
    }

    /// Workflow ids under the trees directory that git still lists as worktrees
    pub async fn list(&self) -> Result<Vec<String>, AdwError> {
        if !self.trees_dir.exists() {
            return Ok(Vec::new());
        }

        let registered: Vec<PathBuf> = GitCli::list_worktrees(&self.repo_root)
            .await?
            .iter()
            .map(|e| canonical(Path::new(&e.path)))
            .collect();

        let mut entries = fs::read_dir(&self.trees_dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() && registered.contains(&canonical(&path)) {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Canonical form for comparing against `git worktree list`, which reports
/// resolved paths. Falls back to resolving the parent for paths not yet created.
fn canonical(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
