//! `claude` CLI agent runner.
//!
//! Runs the CLI headless (`-p ... --output-format json`) and reads the final
//! result object it prints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{AgentRequest, AgentResponse, AgentRunner};
use crate::config::AgentConfig;
use crate::git::AGENT_SCRATCH_DIR;
use crate::state::TokenUsage;

const RAW_OUTPUT_FILE: &str = "raw_output.json";

#[derive(Debug, Default, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl From<CliUsage> for TokenUsage {
    fn from(usage: CliUsage) -> Self {
        TokenUsage::new(
            usage.input_tokens + usage.cache_creation_input_tokens + usage.cache_read_input_tokens,
            usage.output_tokens,
        )
    }
}

pub struct ClaudeCliRunner {
    command: String,
    default_model: Option<String>,
    extra_args: Vec<String>,
    timeout: Duration,
    state_root: PathBuf,
}

impl ClaudeCliRunner {
    pub fn new(config: &AgentConfig, state_root: PathBuf) -> Self {
        Self {
            command: config.command.clone(),
            default_model: config.model.clone(),
            extra_args: config.extra_args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            state_root,
        }
    }

    /// Whether the configured CLI can be found
    pub fn is_installed(&self) -> bool {
        Path::new(&self.command).is_file() || which::which(&self.command).is_ok()
    }

    /// `<state_root>/<workflow_id>/agents/<agent_name>`
    pub fn output_dir(&self, workflow_id: &str, agent_name: &str) -> PathBuf {
        self.state_root
            .join(workflow_id)
            .join(AGENT_SCRATCH_DIR)
            .join(agent_name)
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = request.model.as_ref().or(self.default_model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    async fn save_raw_output(&self, request: &AgentRequest, stdout: &[u8]) {
        let dir = self.output_dir(&request.workflow_id, &request.agent_name);
        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join(RAW_OUTPUT_FILE), stdout).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to save raw agent output to {}: {}", dir.display(), e);
        }
    }
}

/// Interpret the CLI's stdout. Unparseable output is a failed run.
fn parse_cli_output(stdout: &str) -> (bool, String, TokenUsage) {
    // Some CLI versions print a stream of JSON objects; the result is last
    let candidate = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with('{'))
        .unwrap_or_else(|| stdout.trim());

    match serde_json::from_str::<CliResult>(candidate) {
        Ok(parsed) => {
            let usage = parsed.usage.map(TokenUsage::from).unwrap_or_default();
            (!parsed.is_error, parsed.result.unwrap_or_default(), usage)
        }
        Err(e) => (
            false,
            format!("Could not parse agent output ({}): {}", e, stdout.trim()),
            TokenUsage::default(),
        ),
    }
}

#[async_trait]
impl AgentRunner for ClaudeCliRunner {
    async fn run(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let args = self.build_args(request);
        info!(
            agent = %request.agent_name,
            command = %request.command,
            cwd = %request.working_dir.display(),
            "Running agent"
        );

        let child = Command::new(&self.command)
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start agent CLI '{}'", self.command))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("Failed to read agent output")?,
            Err(_) => {
                return Ok(AgentResponse::failure(
                    format!("Agent timed out after {:?}", self.timeout),
                    TokenUsage::default(),
                ))
            }
        };

        self.save_raw_output(request, &output.stdout).await;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (parsed_ok, text, usage) = parse_cli_output(&stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() { text } else { stderr.trim().to_string() };
            warn!(agent = %request.agent_name, status = ?output.status, "Agent exited with failure");
            return Ok(AgentResponse::failure(message, usage));
        }

        debug!(agent = %request.agent_name, tokens = usage.total(), "Agent finished");
        Ok(AgentResponse {
            success: parsed_ok,
            output: text,
            token_usage: usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(temp: &TempDir) -> ClaudeCliRunner {
        ClaudeCliRunner::new(&AgentConfig::default(), temp.path().to_path_buf())
    }

    #[test]
    fn test_parse_success_with_usage() {
        let (ok, text, usage) = parse_cli_output(
            r#"{"type":"result","is_error":false,"result":"done","usage":{"input_tokens":10,"cache_read_input_tokens":5,"output_tokens":7}}"#,
        );
        assert!(ok);
        assert_eq!(text, "done");
        assert_eq!(usage, TokenUsage::new(15, 7));
    }

    #[test]
    fn test_parse_error_result_keeps_usage() {
        let (ok, _, usage) = parse_cli_output(
            r#"{"is_error":true,"result":"tool failure","usage":{"input_tokens":3,"output_tokens":1}}"#,
        );
        assert!(!ok);
        assert_eq!(usage.total(), 4);
    }

    #[test]
    fn test_parse_stream_uses_last_object() {
        let stdout = "{\"type\":\"system\"}\n{\"type\":\"result\",\"result\":\"ok\"}\n";
        let (ok, text, usage) = parse_cli_output(stdout);
        assert!(ok);
        assert_eq!(text, "ok");
        assert!(usage.is_zero());
    }

    #[test]
    fn test_parse_garbage_is_failure() {
        let (ok, text, _) = parse_cli_output("Segmentation fault");
        assert!(!ok);
        assert!(text.contains("Segmentation fault"));
    }

    #[test]
    fn test_model_from_request_overrides_default() {
        let temp = TempDir::new().unwrap();
        let mut config = AgentConfig::default();
        config.model = Some("sonnet".into());
        let runner = ClaudeCliRunner::new(&config, temp.path().to_path_buf());

        let mut request = AgentRequest::new("reviewer", "/review", "wf-001", temp.path());
        assert!(runner.build_args(&request).contains(&"sonnet".to_string()));

        request.model = Some("opus".into());
        let args = runner.build_args(&request);
        assert!(args.contains(&"opus".to_string()));
        assert!(!args.contains(&"sonnet".to_string()));
    }

    #[test]
    fn test_output_dir_is_under_agent_scratch() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            runner(&temp).output_dir("wf-001", "sdlc_planner"),
            temp.path().join("wf-001").join("agents").join("sdlc_planner")
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let mut config = AgentConfig::default();
        config.command = "adw-test-no-such-agent-binary".into();
        let runner = ClaudeCliRunner::new(&config, temp.path().to_path_buf());
        let request = AgentRequest::new("ops", "/noop", "wf-001", temp.path());
        assert!(runner.run(&request).await.is_err());
    }
}
