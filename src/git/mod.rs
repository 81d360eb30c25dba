//! Git integration: raw CLI calls, the `GitOps` capability and worktree management.

mod cli;
mod ops;
mod worktree;

pub use cli::{GitCli, WorktreeEntry};
pub use ops::{CliGitOps, GitOps};
pub use worktree::{DestroyReport, WorktreeManager, AGENT_SCRATCH_DIR};
