//! adw - AI developer workflows driven from GitHub issues.
//!
//! Each workflow gets a persistent [`state::WorkflowState`] and its own git
//! worktree. Phases (plan, build, test, review, document, ship) run as separate
//! processes and resume from the state record; pipelines chain them and the
//! trigger daemons launch them from issue comments.

pub mod agent;
pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod logging;
pub mod phases;
pub mod pipeline;
pub mod state;
pub mod trigger;
pub mod verify;
