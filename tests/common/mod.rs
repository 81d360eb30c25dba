//! Shared fixtures for integration tests: a throwaway git origin/clone pair and
//! in-memory GitHub fakes.

#![allow(dead_code)]

use adw::github::{
    CreatePullRequest, Issue, IssueComment, IssueTracker, Label, PrState, PullRequest, PullRequests,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

pub const BOT: &str = "[ADW-AGENTS]";
pub const CURRENT_USER: &str = "adw-bot";

// ─── Git Fixture ─────────────────────────────────────────────────────────────

/// Git-backed tests skip themselves when git is missing
pub fn git_available() -> bool {
    let available = which::which("git").is_ok();
    if !available {
        eprintln!("Skipping test: git not found on PATH");
    }
    available
}

pub fn git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Bare `origin` plus a clone with an initial commit on `main`
pub struct GitFixture {
    _temp: TempDir,
    pub origin: PathBuf,
    pub repo: PathBuf,
}

impl GitFixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let origin = temp.path().join("origin.git");
        let repo = temp.path().join("repo");

        std::fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "--bare"]);
        git(temp.path(), &["clone", origin.to_str().unwrap(), "repo"]);

        git(&repo, &["config", "user.email", "adw@example.com"]);
        git(&repo, &["config", "user.name", "ADW Test"]);
        git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(repo.join("README.md"), "# demo\n").unwrap();
        git(&repo, &["add", "-A"]);
        git(&repo, &["commit", "-m", "initial"]);
        git(&repo, &["push", "-u", "origin", "main"]);

        Self {
            _temp: temp,
            origin,
            repo,
        }
    }

    pub fn state_root(&self) -> PathBuf {
        self.repo.join("agents")
    }

    pub fn trees(&self) -> PathBuf {
        self.repo.join("trees")
    }
}

// ─── Issue Tracker Fake ──────────────────────────────────────────────────────

pub fn issue(number: u64, title: &str, body: &str) -> Issue {
    serde_json::from_value(serde_json::json!({
        "number": number,
        "title": title,
        "body": body,
        "state": "OPEN",
    }))
    .unwrap()
}

pub fn comment(id: &str, author: &str, body: &str, created_at: DateTime<Utc>) -> IssueComment {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "author": {"login": author},
        "body": body,
        "createdAt": created_at,
    }))
    .unwrap()
}

/// In-memory issues. Posted comments are recorded and not added to the issues,
/// so tests control exactly what detection sees.
#[derive(Default)]
pub struct FakeTracker {
    issues: Mutex<HashMap<u64, Issue>>,
    posted: Mutex<Vec<(u64, String)>>,
    failing: Mutex<Vec<u64>>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(self, issue: Issue) -> Self {
        self.put(issue);
        self
    }

    pub fn put(&self, issue: Issue) {
        self.issues.lock().unwrap().insert(issue.number, issue);
    }

    pub fn update(&self, number: u64, f: impl FnOnce(&mut Issue)) {
        let mut issues = self.issues.lock().unwrap();
        f(issues.get_mut(&number).expect("unknown issue"));
    }

    /// Make `fetch` fail for this issue
    pub fn fail_fetch(&self, number: u64) {
        self.failing.lock().unwrap().push(number);
    }

    pub fn labels(&self, number: u64) -> Vec<String> {
        self.issues
            .lock()
            .unwrap()
            .get(&number)
            .map(|i| i.labels.iter().map(|l| l.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn posted(&self) -> Vec<(u64, String)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn posted_on(&self, number: u64) -> Vec<String> {
        self.posted()
            .into_iter()
            .filter(|(n, _)| *n == number)
            .map(|(_, body)| body)
            .collect()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn fetch(&self, number: u64) -> Result<Issue> {
        if self.failing.lock().unwrap().contains(&number) {
            return Err(anyhow!("gh issue view failed: HTTP 502"));
        }
        self.issues
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("issue #{} not found", number))
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        self.posted
            .lock()
            .unwrap()
            .push((number, adw::github::tag_comment(BOT, body)));
        Ok(())
    }

    async fn list_open(&self) -> Result<Vec<Issue>> {
        let mut issues: Vec<Issue> = self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.is_open())
            .cloned()
            .collect();
        issues.sort_by_key(|i| i.number);
        Ok(issues)
    }

    async fn current_user(&self) -> Result<String> {
        Ok(CURRENT_USER.to_string())
    }

    async fn mark_in_progress(&self, _number: u64) -> Result<()> {
        Ok(())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<()> {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(&number)
            .ok_or_else(|| anyhow!("issue #{} not found", number))?;
        if !issue.has_label(label) {
            issue.labels.push(Label {
                name: label.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(&number)
            .ok_or_else(|| anyhow!("issue #{} not found", number))?;
        issue.labels.retain(|l| !l.name.eq_ignore_ascii_case(label));
        Ok(())
    }

    fn bot_identifier(&self) -> &str {
        BOT
    }
}

// ─── Pull Request Fake ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePrs {
    prs: Mutex<HashMap<String, PullRequest>>,
}

impl FakePrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, branch: &str, number: u64, state: PrState) {
        self.prs.lock().unwrap().insert(
            branch.to_string(),
            PullRequest {
                number,
                url: format!("https://github.com/acme/app/pull/{}", number),
                state,
            },
        );
    }

    pub fn get(&self, branch: &str) -> Option<PullRequest> {
        self.prs.lock().unwrap().get(branch).cloned()
    }
}

#[async_trait]
impl PullRequests for FakePrs {
    async fn find_for_branch(&self, branch: &str) -> Result<Option<PullRequest>> {
        Ok(self.get(branch))
    }

    async fn create(&self, request: &CreatePullRequest) -> Result<PullRequest> {
        let number = 100 + self.prs.lock().unwrap().len() as u64;
        self.insert(&request.head, number, PrState::Open);
        self.get(&request.head)
            .ok_or_else(|| anyhow!("pull request vanished"))
    }
}
