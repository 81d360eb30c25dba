//! Integration tests for GitCli, CliGitOps and WorktreeManager
//!
//! Each test builds a throwaway setup under a temp directory: a bare `origin`
//! repository and a clone of it with one commit on `main`. Nothing touches the
//! repository the tests are run from.
//!
//! Tests are skipped when `git` is not on PATH.
//!
//! ```bash
//! cargo test --test git_integration
//! ```

mod common;

use adw::git::{CliGitOps, GitCli, GitOps, WorktreeManager, AGENT_SCRATCH_DIR};
use adw::state::{WorkflowState, WorkflowStateUpdate};
use common::{git, git_available, GitFixture};
use tempfile::TempDir;

fn manager(fixture: &GitFixture) -> WorktreeManager {
    WorktreeManager::new(
        fixture.repo.clone(),
        fixture.trees(),
        fixture.state_root(),
        "origin",
        "main",
    )
}

// ─── GitCli Tests ────────────────────────────────────────────────────────────

mod git_cli_tests {
    use super::*;

    #[tokio::test]
    async fn test_current_branch_and_head() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();

        assert_eq!(GitCli::current_branch(&fixture.repo).await.unwrap(), "main");
        let head = GitCli::head_commit(&fixture.repo).await.unwrap();
        assert_eq!(head.len(), 40);
    }

    #[tokio::test]
    async fn test_changed_files_includes_untracked() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();

        std::fs::write(fixture.repo.join("README.md"), "# changed\n").unwrap();
        std::fs::create_dir_all(fixture.repo.join("src")).unwrap();
        std::fs::write(fixture.repo.join("src/new.rs"), "fn main() {}\n").unwrap();

        let mut changed = GitCli::changed_files(&fixture.repo).await.unwrap();
        changed.sort();
        assert_eq!(changed, vec!["README.md", "src/new.rs"]);
    }

    #[tokio::test]
    async fn test_commit_all_reports_empty_commit() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();

        assert!(!GitCli::commit_all(&fixture.repo, "nothing").await.unwrap());

        let before = GitCli::head_commit(&fixture.repo).await.unwrap();
        std::fs::write(fixture.repo.join("notes.txt"), "hello\n").unwrap();
        assert!(GitCli::commit_all(&fixture.repo, "add notes").await.unwrap());

        let since = GitCli::files_changed_since(&fixture.repo, &before).await.unwrap();
        assert_eq!(since, vec!["notes.txt"]);
    }

    #[tokio::test]
    async fn test_is_worktree() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();
        let outside = TempDir::new().unwrap();

        assert!(GitCli::is_worktree(&fixture.repo).await.unwrap());
        assert!(!GitCli::is_worktree(outside.path()).await.unwrap_or(false));
    }
}

// ─── WorktreeManager Tests ───────────────────────────────────────────────────

mod worktree_manager_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_validate_destroy_lifecycle() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();
        let manager = manager(&fixture);

        let path = manager.create("wf-001", "feature/wf-001-demo").await.unwrap();
        assert_eq!(path, fixture.trees().join("wf-001"));
        assert!(path.join("README.md").exists());
        assert_eq!(GitCli::current_branch(&path).await.unwrap(), "feature/wf-001-demo");
        assert_eq!(manager.list().await.unwrap(), vec!["wf-001"]);

        let mut state = WorkflowState::create_with_id(&fixture.state_root(), "wf-001", 42).unwrap();
        state
            .update(WorkflowStateUpdate {
                branch_name: Some("feature/wf-001-demo".into()),
                worktree_path: Some(path.clone()),
                ..Default::default()
            })
            .unwrap();
        manager.validate("wf-001", &state).await.unwrap();

        let scratch = fixture.state_root().join("wf-001").join(AGENT_SCRATCH_DIR);
        std::fs::create_dir_all(&scratch).unwrap();

        let report = manager.destroy("wf-001").await.unwrap();
        assert!(report.removed);
        assert!(!path.exists());
        assert!(!scratch.exists());
        assert!(manager.list().await.unwrap().is_empty());
        // State record survives cleanup
        assert!(WorkflowState::load(&fixture.state_root(), "wf-001").unwrap().is_some());

        let err = manager.validate("wf-001", &state).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{}", err);
    }

    #[tokio::test]
    async fn test_second_create_for_same_id_fails() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();
        let manager = manager(&fixture);

        manager.create("wf-002", "feature/wf-002-a").await.unwrap();
        let err = manager.create("wf-002", "feature/wf-002-b").await.unwrap_err();
        assert!(err.to_string().contains("already exists"), "{}", err);
        assert_eq!(manager.list().await.unwrap(), vec!["wf-002"]);
    }

    #[tokio::test]
    async fn test_concurrent_create_for_same_id_yields_one_worktree() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();
        let manager = manager(&fixture);

        let (a, b) = tokio::join!(
            manager.create("wf-003", "feature/wf-003-a"),
            manager.create("wf-003", "feature/wf-003-b"),
        );
        assert!(a.is_ok() ^ b.is_ok(), "exactly one create should win");
        assert_eq!(manager.list().await.unwrap(), vec!["wf-003"]);
    }

    #[tokio::test]
    async fn test_validate_rejects_unregistered_directory() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();
        let manager = manager(&fixture);

        let fake = fixture.trees().join("wf-004");
        std::fs::create_dir_all(&fake).unwrap();
        let mut state = WorkflowState::create_with_id(&fixture.state_root(), "wf-004", 7).unwrap();
        state
            .update(WorkflowStateUpdate {
                worktree_path: Some(fake),
                ..Default::default()
            })
            .unwrap();

        assert!(manager.validate("wf-004", &state).await.is_err());
    }
}

// ─── CliGitOps Tests ─────────────────────────────────────────────────────────

mod git_ops_tests {
    use super::*;

    #[tokio::test]
    async fn test_merge_to_target_pushes_and_restores_branch() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();
        let manager = manager(&fixture);
        let ops = CliGitOps::new("origin");

        let worktree = manager.create("wf-005", "feature/wf-005-merge").await.unwrap();
        std::fs::write(worktree.join("feature.txt"), "shipped\n").unwrap();
        assert!(ops.commit("feature: add file", &worktree).await.unwrap());
        ops.push("feature/wf-005-merge", &worktree).await.unwrap();

        // Main checkout sits on another branch to prove it is restored
        git(&fixture.repo, &["checkout", "-b", "scratch"]);

        ops.merge_to_target("feature/wf-005-merge", "main", &fixture.repo)
            .await
            .unwrap();

        assert_eq!(GitCli::current_branch(&fixture.repo).await.unwrap(), "scratch");
        let merged = git(&fixture.origin, &["show", "main:feature.txt"]);
        assert_eq!(merged, "shipped");
    }

    #[tokio::test]
    async fn test_merge_to_target_restores_branch_on_failure() {
        if !git_available() {
            return;
        }
        let fixture = GitFixture::new();
        let ops = CliGitOps::new("origin");

        git(&fixture.repo, &["checkout", "-b", "scratch"]);
        let result = ops
            .merge_to_target("feature/does-not-exist", "main", &fixture.repo)
            .await;

        assert!(result.is_err());
        assert_eq!(GitCli::current_branch(&fixture.repo).await.unwrap(), "scratch");
    }
}
