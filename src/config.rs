use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub git: GitConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub phases: PhasesConfig,
    #[serde(default)]
    pub triggers: TriggersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Main repository checkout. Empty means the current directory.
    #[serde(default)]
    pub repo_root: String,
    /// Per-workflow state records and scratch output, relative to `repo_root`
    pub state_root: String,
    /// Parent directory of all worktrees, relative to `repo_root`
    pub trees: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    pub remote: String,
    pub target_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Explicit `owner/name`; derived from the remote URL when unset
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_bot_identifier")]
    pub bot_identifier: String,
    #[serde(default = "default_in_progress_label")]
    pub in_progress_label: String,
    /// Environment variable holding a token that is handed to `gh` as `GH_TOKEN`
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on a single rate-limit backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_bot_identifier() -> String {
    "[ADW-AGENTS]".to_string()
}

fn default_in_progress_label() -> String {
    "in_progress".to_string()
}

fn default_token_env() -> String {
    "GITHUB_PAT".to_string()
}

fn default_min_delay_ms() -> u64 {
    5_000
}

fn default_initial_delay_ms() -> u64 {
    3_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    10_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            repo: None,
            bot_identifier: default_bot_identifier(),
            in_progress_label: default_in_progress_label(),
            token_env: default_token_env(),
            min_delay_ms: default_min_delay_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Upper bound for a single agent invocation (default: 1800 = 30 min)
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_timeout() -> u64 {
    1800
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            model: None,
            timeout_secs: default_agent_timeout(),
            extra_args: Vec::new(),
        }
    }
}

/// Attempt ceilings for phases that retry. Each value counts total attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesConfig {
    #[serde(default = "default_build_attempts")]
    pub max_build_attempts: u32,
    #[serde(default = "default_test_attempts")]
    pub max_test_attempts: u32,
    #[serde(default = "default_review_attempts")]
    pub max_review_attempts: u32,
    /// Documentation topics loaded for planning beyond this are dropped
    #[serde(default = "default_max_doc_topics")]
    pub max_doc_topics: usize,
}

fn default_max_doc_topics() -> usize {
    3
}

fn default_build_attempts() -> u32 {
    2
}

fn default_test_attempts() -> u32 {
    4
}

fn default_review_attempts() -> u32 {
    3
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            max_build_attempts: default_build_attempts(),
            max_test_attempts: default_test_attempts(),
            max_review_attempts: default_review_attempts(),
            max_doc_topics: default_max_doc_topics(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    #[serde(default = "default_trigger_interval")]
    pub interval_secs: u64,
    /// Issues carrying this label are picked up by the cron trigger
    #[serde(default = "default_cron_label")]
    pub cron_label: String,
    #[serde(default = "default_cron_running_label")]
    pub cron_running_label: String,
    #[serde(default = "default_cron_completed_label")]
    pub cron_completed_label: String,
    #[serde(default = "default_cron_failed_label")]
    pub cron_failed_label: String,
    /// Zero means one slot per CPU core
    #[serde(default)]
    pub max_concurrent: usize,
}

fn default_trigger_interval() -> u64 {
    20
}

fn default_cron_label() -> String {
    "cron-enabled".to_string()
}

fn default_cron_running_label() -> String {
    "cron-running".to_string()
}

fn default_cron_completed_label() -> String {
    "cron-completed".to_string()
}

fn default_cron_failed_label() -> String {
    "cron-failed".to_string()
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_trigger_interval(),
            cron_label: default_cron_label(),
            cron_running_label: default_cron_running_label(),
            cron_completed_label: default_cron_completed_label(),
            cron_failed_label: default_cron_failed_label(),
            max_concurrent: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write phase logs to `<state_root>/<id>/<phase>/execution.log`
    #[serde(default = "default_log_to_file")]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_to_file() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: default_log_to_file(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, config files and `ADW__*` environment variables
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        // Project config next to the repository
        let project_config = Self::project_config_path();
        if project_config.exists() {
            builder = builder.add_source(config::File::from(project_config));
        }

        // User config in ~/.config/adw/
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("adw").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ADW")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Save config to .adw/config.toml
    pub fn save(&self) -> Result<()> {
        let config_path = Self::project_config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create .adw directory")?;
        }

        let toml_str =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;

        Ok(())
    }

    fn project_config_path() -> PathBuf {
        PathBuf::from(".adw").join("config.toml")
    }

    /// Absolute path of the main repository checkout
    pub fn repo_root(&self) -> PathBuf {
        let cwd = std::env::current_dir().unwrap_or_default();
        if self.paths.repo_root.is_empty() {
            return cwd;
        }
        let path = PathBuf::from(&self.paths.repo_root);
        if path.is_absolute() {
            path
        } else {
            cwd.join(path)
        }
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root().join(path)
        }
    }

    /// Root directory holding one subdirectory per workflow id
    pub fn state_root(&self) -> PathBuf {
        self.resolve(&self.paths.state_root)
    }

    /// Parent directory for worktrees
    pub fn trees_path(&self) -> PathBuf {
        self.resolve(&self.paths.trees)
    }

    /// Directory for logs of a single phase run
    pub fn phase_log_dir(&self, workflow_id: &str, phase: &str) -> PathBuf {
        self.state_root().join(workflow_id).join(phase)
    }

    /// Trigger concurrency ceiling, falling back to the CPU count
    pub fn effective_max_concurrent(&self) -> usize {
        if self.triggers.max_concurrent > 0 {
            return self.triggers.max_concurrent;
        }
        System::new_all().cpus().len().max(1)
    }

    pub fn trigger_interval(&self) -> Duration {
        Duration::from_secs(self.triggers.interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                repo_root: String::new(),
                state_root: "agents".to_string(),
                trees: "trees".to_string(),
            },
            git: GitConfig {
                remote: "origin".to_string(),
                target_branch: "main".to_string(),
            },
            github: GithubConfig::default(),
            agent: AgentConfig::default(),
            phases: PhasesConfig::default(),
            triggers: TriggersConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
