//! Persistent per-workflow state.
//!
//! Each workflow run owns `<state_root>/<workflow_id>/state.json`. Phases run as
//! separate processes, so this file is the only channel between them: every
//! phase loads it fresh, mutates it, and saves it back after each side effect.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AdwError;
use crate::phases::PhaseName;

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

lazy_static! {
    static ref WORKFLOW_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_-]+$").expect("Invalid workflow id regex");
}

/// Workflow ids become directory names, so only `[A-Za-z0-9_-]` is allowed
pub fn validate_workflow_id(workflow_id: &str) -> Result<(), AdwError> {
    if WORKFLOW_ID_PATTERN.is_match(workflow_id) {
        Ok(())
    } else {
        Err(AdwError::Validation(format!(
            "invalid workflow id '{}': use letters, digits, '-' and '_' only",
            workflow_id
        )))
    }
}

/// Generate a fresh workflow id: the first 8 hex characters of a v4 UUID
pub fn make_workflow_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Input/output token counts for one logical agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Issue classification, cached once the classifier has run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueClass {
    Feature,
    Bug,
    Chore,
}

impl IssueClass {
    /// Parse classifier output such as `/feature` or `bug`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_matches('`').trim().trim_start_matches('/') {
            "feature" => Some(Self::Feature),
            "bug" => Some(Self::Bug),
            "chore" => Some(Self::Chore),
            _ => None,
        }
    }

    /// Planning command for this class of issue
    pub fn slash_command(&self) -> &'static str {
        match self {
            Self::Feature => "/feature",
            Self::Bug => "/bug",
            Self::Chore => "/chore",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Chore => "chore",
        }
    }
}

impl fmt::Display for IssueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Questions the planner raised before it could plan, and the human answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub questions: Vec<String>,
    #[serde(default)]
    pub answers: Vec<String>,
    pub asked_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
}

/// Partial update for [`WorkflowState::update`]; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct WorkflowStateUpdate {
    pub branch_name: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub plan_file: Option<String>,
    pub issue_class: Option<IssueClass>,
    pub clarification: Option<Clarification>,
    pub ai_docs_context: Option<String>,
    pub scouting_results: Option<String>,
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    workflow_id: String,
    pub issue_number: u64,
    /// Phases run to completion, in the order they completed
    #[serde(default)]
    completed_phases: Vec<PhaseName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worktree_path: Option<PathBuf>,
    /// Relative to the worktree root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_class: Option<IssueClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_docs_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scouting_results: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    token_usage: BTreeMap<String, TokenUsage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keys written by other tools; carried through untouched
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,

    #[serde(skip)]
    root: PathBuf,
}

impl WorkflowState {
    /// Canonical location of a workflow's state record
    pub fn state_file(root: &Path, workflow_id: &str) -> PathBuf {
        root.join(workflow_id).join(STATE_FILE)
    }

    /// Start a new workflow with a freshly generated id and persist it
    pub fn create(root: &Path, issue_number: u64) -> Result<Self, AdwError> {
        Self::create_with_id(root, &make_workflow_id(), issue_number)
    }

    /// Start a new workflow under a caller-supplied id and persist it
    pub fn create_with_id(
        root: &Path,
        workflow_id: &str,
        issue_number: u64,
    ) -> Result<Self, AdwError> {
        validate_workflow_id(workflow_id)?;
        let path = Self::state_file(root, workflow_id);
        if path.exists() {
            return Err(AdwError::AlreadyExists(path));
        }

        let now = Utc::now();
        let state = Self {
            workflow_id: workflow_id.to_string(),
            issue_number,
            completed_phases: Vec::new(),
            branch_name: None,
            worktree_path: None,
            plan_file: None,
            issue_class: None,
            clarification: None,
            ai_docs_context: None,
            scouting_results: None,
            pr_url: None,
            token_usage: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
            root: root.to_path_buf(),
        };
        state.save("create")?;
        info!(workflow_id, issue_number, "Created workflow state");
        Ok(state)
    }

    /// Load a workflow's record.
    ///
    /// `Ok(None)` means no prior run. A file that exists but does not parse is
    /// `CorruptState`, never `None`.
    pub fn load(root: &Path, workflow_id: &str) -> Result<Option<Self>, AdwError> {
        validate_workflow_id(workflow_id)?;
        let path = Self::state_file(root, workflow_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(workflow_id, "No state record found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut state: WorkflowState =
            serde_json::from_str(&contents).map_err(|source| AdwError::CorruptState {
                path: path.clone(),
                source,
            })?;

        if state.workflow_id != workflow_id {
            return Err(AdwError::Validation(format!(
                "{} records workflow id '{}', expected '{}'",
                path.display(),
                state.workflow_id,
                workflow_id
            )));
        }

        let before = state.completed_phases.len();
        let mut seen = Vec::with_capacity(before);
        state.completed_phases.retain(|phase| {
            if seen.contains(phase) {
                false
            } else {
                seen.push(*phase);
                true
            }
        });
        if state.completed_phases.len() != before {
            warn!(workflow_id, "Dropped duplicate entries from completed_phases");
        }

        state.root = root.to_path_buf();
        Ok(Some(state))
    }

    /// Atomically persist the full record. `caller_tag` only goes to the log.
    pub fn save(&self, caller_tag: &str) -> Result<(), AdwError> {
        let dir = self.workflow_dir();
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize workflow state: {}", e))?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(STATE_FILE))
            .map_err(|e| AdwError::Io(e.error))?;

        debug!(workflow_id = %self.workflow_id, caller = caller_tag, "Saved workflow state");
        Ok(())
    }

    /// Merge the set fields of `update` into this record.
    ///
    /// `branch_name` and `worktree_path` are write-once: re-setting the same
    /// value is accepted, a different one is rejected.
    pub fn update(&mut self, update: WorkflowStateUpdate) -> Result<(), AdwError> {
        if let Some(branch) = update.branch_name {
            match &self.branch_name {
                Some(existing) if *existing != branch => {
                    return Err(AdwError::Immutable("branch_name"))
                }
                _ => self.branch_name = Some(branch),
            }
        }
        if let Some(path) = update.worktree_path {
            match &self.worktree_path {
                Some(existing) if *existing != path => {
                    return Err(AdwError::Immutable("worktree_path"))
                }
                _ => self.worktree_path = Some(path),
            }
        }
        if update.plan_file.is_some() {
            self.plan_file = update.plan_file;
        }
        if update.issue_class.is_some() {
            self.issue_class = update.issue_class;
        }
        if update.clarification.is_some() {
            self.clarification = update.clarification;
        }
        if update.ai_docs_context.is_some() {
            self.ai_docs_context = update.ai_docs_context;
        }
        if update.scouting_results.is_some() {
            self.scouting_results = update.scouting_results;
        }
        if update.pr_url.is_some() {
            self.pr_url = update.pr_url;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a phase as completed. Returns false if it already was.
    pub fn append_phase_completed(&mut self, phase: PhaseName) -> bool {
        if self.completed_phases.contains(&phase) {
            return false;
        }
        self.completed_phases.push(phase);
        self.updated_at = Utc::now();
        true
    }

    pub fn has_completed(&self, phase: PhaseName) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// Add `usage` to the running total for `agent_name`
    pub fn accumulate_tokens(&mut self, agent_name: &str, usage: TokenUsage) {
        *self.token_usage.entry(agent_name.to_string()).or_default() += usage;
        self.updated_at = Utc::now();
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn completed_phases(&self) -> &[PhaseName] {
        &self.completed_phases
    }

    pub fn branch_name(&self) -> Option<&str> {
        self.branch_name.as_deref()
    }

    pub fn worktree_path(&self) -> Option<&Path> {
        self.worktree_path.as_deref()
    }

    pub fn token_usage(&self) -> &BTreeMap<String, TokenUsage> {
        &self.token_usage
    }

    /// Directory holding the state record and per-phase scratch output
    pub fn workflow_dir(&self) -> PathBuf {
        self.root.join(&self.workflow_id)
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    /// Sum of all agents' usage
    pub fn token_totals(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for usage in self.token_usage.values() {
            total += *usage;
        }
        total
    }

    /// Markdown summary of token usage per agent, for final issue comments
    pub fn token_summary(&self) -> String {
        let mut out = String::from("**Token usage**\n\n| Agent | Input | Output |\n|---|---:|---:|\n");
        for (agent, usage) in &self.token_usage {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                agent, usage.input_tokens, usage.output_tokens
            ));
        }
        let total = self.token_totals();
        out.push_str(&format!(
            "| **total** | {} | {} |\n\n{} tokens overall",
            total.input_tokens,
            total.output_tokens,
            total.total()
        ));
        out
    }
}

/// Advisory exclusive lock marking the single active writer of a workflow.
///
/// Released when dropped.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(root: &Path, workflow_id: &str) -> Result<Self, AdwError> {
        validate_workflow_id(workflow_id)?;
        let dir = root.join(workflow_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| AdwError::StateBusy(workflow_id.to_string()))?;

        debug!(lock = %path.display(), "Acquired state lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release state lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_workflow_id_shape() {
        let id = make_workflow_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, make_workflow_id());
    }

    #[test]
    fn test_workflow_id_must_not_escape_state_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("agents");

        for bad in ["../x", "a/b", "", ".", "wf 001", "..\\x"] {
            assert!(
                matches!(WorkflowState::create_with_id(&root, bad, 1), Err(AdwError::Validation(_))),
                "accepted {:?}",
                bad
            );
            assert!(matches!(WorkflowState::load(&root, bad), Err(AdwError::Validation(_))));
            assert!(StateLock::acquire(&root, bad).is_err());
        }
        assert!(!temp.path().join("x").exists());

        assert!(validate_workflow_id("wf-001").is_ok());
        assert!(validate_workflow_id("a1b2_C3D4").is_ok());
        WorkflowState::create_with_id(&root, "wf-001", 1).unwrap();
    }

    #[test]
    fn test_create_persists_immediately() {
        let temp = TempDir::new().unwrap();
        let state = WorkflowState::create(temp.path(), 42).unwrap();

        let path = WorkflowState::state_file(temp.path(), state.workflow_id());
        assert!(path.exists());
        assert!(state.completed_phases().is_empty());
        assert!(state.token_usage().is_empty());
    }

    #[test]
    fn test_create_with_existing_id_fails() {
        let temp = TempDir::new().unwrap();
        WorkflowState::create_with_id(temp.path(), "wf-001", 42).unwrap();
        let err = WorkflowState::create_with_id(temp.path(), "wf-001", 42).unwrap_err();
        assert!(matches!(err, AdwError::AlreadyExists(_)));
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(WorkflowState::load(temp.path(), "nope1234").unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("bad00000");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(STATE_FILE), "{ not json").unwrap();

        let err = WorkflowState::load(temp.path(), "bad00000").unwrap_err();
        assert!(matches!(err, AdwError::CorruptState { .. }));
    }

    #[test]
    fn test_roundtrip_preserves_all_set_fields() {
        let temp = TempDir::new().unwrap();
        let mut state = WorkflowState::create_with_id(temp.path(), "wf-001", 42).unwrap();
        state
            .update(WorkflowStateUpdate {
                branch_name: Some("feature/wf-001-add-login".into()),
                worktree_path: Some(temp.path().join("trees").join("wf-001")),
                plan_file: Some("specs/42.md".into()),
                issue_class: Some(IssueClass::Feature),
                clarification: Some(Clarification {
                    questions: vec!["Which provider?".into()],
                    answers: vec!["GitHub".into()],
                    asked_at: Utc::now(),
                    resolved: true,
                }),
                ai_docs_context: Some("docs".into()),
                scouting_results: Some("src/auth.rs".into()),
                pr_url: Some("https://github.com/o/r/pull/7".into()),
            })
            .unwrap();
        state.append_phase_completed(PhaseName::Plan);
        state.accumulate_tokens("sdlc_planner", TokenUsage::new(100, 20));
        state.set_extra("model_set", Value::String("heavy".into()));
        state.save("test").unwrap();

        let loaded = WorkflowState::load(temp.path(), "wf-001").unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.extra("model_set"), Some(&Value::String("heavy".into())));
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("abc12345");
        fs::create_dir_all(&dir).unwrap();
        let now = Utc::now().to_rfc3339();
        fs::write(
            dir.join(STATE_FILE),
            format!(
                r#"{{"workflow_id":"abc12345","issue_number":7,"created_at":"{now}","updated_at":"{now}","port":9100}}"#
            ),
        )
        .unwrap();

        let state = WorkflowState::load(temp.path(), "abc12345").unwrap().unwrap();
        assert_eq!(state.extra("port"), Some(&Value::from(9100)));
        state.save("test").unwrap();

        let raw = fs::read_to_string(dir.join(STATE_FILE)).unwrap();
        assert!(raw.contains("\"port\": 9100"));
    }

    #[test]
    fn test_update_merges_without_clearing() {
        let temp = TempDir::new().unwrap();
        let mut state = WorkflowState::create(temp.path(), 1).unwrap();
        state
            .update(WorkflowStateUpdate {
                plan_file: Some("specs/1.md".into()),
                ..Default::default()
            })
            .unwrap();
        state
            .update(WorkflowStateUpdate {
                issue_class: Some(IssueClass::Bug),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(state.plan_file.as_deref(), Some("specs/1.md"));
        assert_eq!(state.issue_class, Some(IssueClass::Bug));
    }

    #[test]
    fn test_branch_and_worktree_are_write_once() {
        let temp = TempDir::new().unwrap();
        let mut state = WorkflowState::create(temp.path(), 1).unwrap();
        state
            .update(WorkflowStateUpdate {
                branch_name: Some("bug/a".into()),
                worktree_path: Some(PathBuf::from("/tmp/trees/a")),
                ..Default::default()
            })
            .unwrap();

        // Same value is fine
        state
            .update(WorkflowStateUpdate {
                branch_name: Some("bug/a".into()),
                ..Default::default()
            })
            .unwrap();

        let err = state
            .update(WorkflowStateUpdate {
                branch_name: Some("bug/b".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, AdwError::Immutable("branch_name")));

        let err = state
            .update(WorkflowStateUpdate {
                worktree_path: Some(PathBuf::from("/tmp/trees/b")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, AdwError::Immutable("worktree_path")));
        assert_eq!(state.branch_name(), Some("bug/a"));
    }

    #[test]
    fn test_append_phase_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut state = WorkflowState::create(temp.path(), 1).unwrap();
        assert!(state.append_phase_completed(PhaseName::Plan));
        assert!(state.append_phase_completed(PhaseName::Build));
        assert!(!state.append_phase_completed(PhaseName::Plan));
        assert_eq!(
            state.completed_phases(),
            &[PhaseName::Plan, PhaseName::Build]
        );
    }

    #[test]
    fn test_load_drops_duplicate_phases() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("dup00000");
        fs::create_dir_all(&dir).unwrap();
        let now = Utc::now().to_rfc3339();
        fs::write(
            dir.join(STATE_FILE),
            format!(
                r#"{{"workflow_id":"dup00000","issue_number":3,"completed_phases":["plan","build","plan"],"created_at":"{now}","updated_at":"{now}"}}"#
            ),
        )
        .unwrap();

        let state = WorkflowState::load(temp.path(), "dup00000").unwrap().unwrap();
        assert_eq!(
            state.completed_phases(),
            &[PhaseName::Plan, PhaseName::Build]
        );
    }

    #[test]
    fn test_token_accounting_sums_across_processes() {
        let temp = TempDir::new().unwrap();
        let state = WorkflowState::create_with_id(temp.path(), "tok00001", 9).unwrap();
        drop(state);

        let deltas = [
            ("sdlc_planner", TokenUsage::new(100, 10)),
            ("sdlc_implementor", TokenUsage::new(400, 80)),
            ("sdlc_planner", TokenUsage::new(50, 5)),
            ("sdlc_implementor", TokenUsage::new(1, 1)),
        ];

        // Each delta comes from a fresh load, as separate phase processes would
        for (agent, usage) in deltas {
            let mut state = WorkflowState::load(temp.path(), "tok00001").unwrap().unwrap();
            state.accumulate_tokens(agent, usage);
            state.save("test").unwrap();
        }

        let state = WorkflowState::load(temp.path(), "tok00001").unwrap().unwrap();
        assert_eq!(
            state.token_usage()["sdlc_planner"],
            TokenUsage::new(150, 15)
        );
        assert_eq!(
            state.token_usage()["sdlc_implementor"],
            TokenUsage::new(401, 81)
        );
        assert_eq!(state.token_totals(), TokenUsage::new(551, 96));
        assert!(state.token_summary().contains("647 tokens overall"));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let state = WorkflowState::create(temp.path(), 1).unwrap();
        state.save("again").unwrap();

        let names: Vec<_> = fs::read_dir(state.workflow_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![STATE_FILE.to_string()]);
    }

    #[test]
    fn test_state_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let lock = StateLock::acquire(temp.path(), "lock0001").unwrap();
        let err = StateLock::acquire(temp.path(), "lock0001").unwrap_err();
        assert!(matches!(err, AdwError::StateBusy(_)));

        drop(lock);
        assert!(StateLock::acquire(temp.path(), "lock0001").is_ok());
    }

    #[test]
    fn test_issue_class_parse() {
        assert_eq!(IssueClass::parse("/feature"), Some(IssueClass::Feature));
        assert_eq!(IssueClass::parse(" `/bug` \n"), Some(IssueClass::Bug));
        assert_eq!(IssueClass::parse("chore"), Some(IssueClass::Chore));
        assert_eq!(IssueClass::parse("0"), None);
        assert_eq!(IssueClass::Bug.slash_command(), "/bug");
    }
}
