//! Independent check that an implementation actually changed the worktree.
//!
//! An agent can report success without ever touching a file. The build phase
//! does not take that at face value: it asks a [`ChangeVerifier`] whether the
//! worktree has a non-empty diff and whether the concrete edits the plan asks
//! for (`Add "text" to path`) are present in the changed files.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::git::GitOps;

lazy_static::lazy_static! {
    static ref MARKER_PATTERN: Regex = Regex::new(
        r#"(?m)\b(?:[Aa]dd|[Aa]ppend)\b[^\n]*?["']([^"'\n]+)["'][^\n]*?\b(?:to|in|at)\s+(?:the\s+)?`?([^`\s]+)"#
    )
    .expect("marker pattern is valid");
}

/// Text the plan says must end up in a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentMarker {
    pub text: String,
    pub file: String,
}

/// Pull `Add "text" to path` style instructions out of a plan.
///
/// Targets that do not look like a path (no `.` or `/`) are ignored, so prose
/// such as "add 'login' support in the app" does not produce a marker.
pub fn extract_markers(plan: &str) -> Vec<ContentMarker> {
    MARKER_PATTERN
        .captures_iter(plan)
        .filter_map(|caps| {
            let text = caps.get(1)?.as_str().to_string();
            let file = caps
                .get(2)?
                .as_str()
                .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | ')' | '`'))
                .to_string();
            (file.contains('.') || file.contains('/')).then_some(ContentMarker { text, file })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub changed_files: Vec<String>,
    pub missing_markers: Vec<ContentMarker>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        !self.changed_files.is_empty() && self.missing_markers.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.changed_files.is_empty() {
            return "no files changed in the worktree".to_string();
        }
        if self.missing_markers.is_empty() {
            return format!("{} file(s) changed", self.changed_files.len());
        }
        let missing: Vec<String> = self
            .missing_markers
            .iter()
            .map(|m| format!("'{}' in {}", m.text, m.file))
            .collect();
        format!("expected content not found: {}", missing.join(", "))
    }
}

#[async_trait]
pub trait ChangeVerifier: Send + Sync {
    /// Inspect `worktree` against `plan`. `baseline` is the commit the
    /// implementation started from, so edits the agent already committed count.
    async fn verify(
        &self,
        worktree: &Path,
        plan: &str,
        baseline: Option<&str>,
    ) -> Result<VerificationReport>;
}

/// [`ChangeVerifier`] over git diffs and file contents
pub struct DiffChangeVerifier {
    git: Arc<dyn GitOps>,
}

impl DiffChangeVerifier {
    pub fn new(git: Arc<dyn GitOps>) -> Self {
        Self { git }
    }
}

#[async_trait]
impl ChangeVerifier for DiffChangeVerifier {
    async fn verify(
        &self,
        worktree: &Path,
        plan: &str,
        baseline: Option<&str>,
    ) -> Result<VerificationReport> {
        let mut changed: BTreeSet<String> =
            self.git.diff_names(worktree).await?.into_iter().collect();
        if let Some(rev) = baseline {
            changed.extend(self.git.files_changed_since(rev, worktree).await?);
        }

        let mut missing_markers = Vec::new();
        for marker in extract_markers(plan) {
            let present = changed.contains(&marker.file)
                && tokio::fs::read_to_string(worktree.join(&marker.file))
                    .await
                    .map(|content| content.contains(&marker.text))
                    .unwrap_or(false);
            if !present {
                missing_markers.push(marker);
            }
        }

        let report = VerificationReport {
            changed_files: changed.into_iter().collect(),
            missing_markers,
        };
        debug!(passed = report.passed(), "{}", report.describe());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_markers() {
        let plan = r#"
## Steps
1. Add "Hello from ADW" to README.md.
2. Append 'fn login() {}' at the end of `src/auth.rs`
3. Add 'login' support in the app
"#;
        let markers = extract_markers(plan);
        assert_eq!(
            markers,
            vec![
                ContentMarker {
                    text: "Hello from ADW".into(),
                    file: "README.md".into()
                },
                ContentMarker {
                    text: "fn login() {}".into(),
                    file: "src/auth.rs".into()
                },
            ]
        );
    }

    #[test]
    fn test_plan_without_markers() {
        assert!(extract_markers("Refactor the parser for clarity.").is_empty());
    }

    #[test]
    fn test_report_requires_changes() {
        let report = VerificationReport::default();
        assert!(!report.passed());
        assert_eq!(report.describe(), "no files changed in the worktree");

        let report = VerificationReport {
            changed_files: vec!["a.txt".into()],
            missing_markers: vec![],
        };
        assert!(report.passed());
    }

    #[test]
    fn test_report_names_missing_markers() {
        let report = VerificationReport {
            changed_files: vec!["a.txt".into()],
            missing_markers: vec![ContentMarker {
                text: "x".into(),
                file: "b.txt".into(),
            }],
        };
        assert!(!report.passed());
        assert!(report.describe().contains("'x' in b.txt"));
    }
}
