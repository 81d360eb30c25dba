//! Logging initialization for adw.
//!
//! Phase runs: logs to stderr and `<state_root>/<workflow_id>/<phase>/execution.log`
//! Everything else: logs to stderr

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

const EXECUTION_LOG: &str = "execution.log";

/// Result of logging initialization
pub struct LoggingHandle {
    /// Flushes buffered file output when dropped; keep it alive until exit
    pub _guard: Option<WorkerGuard>,

    /// Set when the run also logs to a file
    pub log_file_path: Option<PathBuf>,
}

/// Where a phase run writes its log file, if file logging is on
pub fn execution_log_path(config: &Config, workflow_id: &str, phase: &str) -> Option<PathBuf> {
    config
        .logging
        .to_file
        .then(|| config.phase_log_dir(workflow_id, phase).join(EXECUTION_LOG))
}

fn filter(config: &Config, debug_override: bool) -> EnvFilter {
    let log_level = if debug_override {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or(log_level))
}

/// Initialize logging.
///
/// `phase_run` is `(workflow_id, phase)` for a single phase invocation, which
/// adds the per-phase execution log.
pub fn init_logging(
    config: &Config,
    phase_run: Option<(&str, &str)>,
    debug_override: bool,
) -> Result<LoggingHandle> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let log_file_path = phase_run.and_then(|(id, phase)| execution_log_path(config, id, phase));

    if let Some(path) = &log_file_path {
        let log_dir = path
            .parent()
            .context("Execution log path has no parent directory")?;
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        // Append so resumed phases keep earlier attempts
        let file_appender = tracing_appender::rolling::never(log_dir, EXECUTION_LOG);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter(config, debug_override))
            .with(stderr_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false) // No ANSI codes in log files
                    .with_writer(non_blocking),
            )
            .init();

        Ok(LoggingHandle {
            _guard: Some(guard),
            log_file_path,
        })
    } else {
        tracing_subscriber::registry()
            .with(filter(config, debug_override))
            .with(stderr_layer)
            .init();

        Ok(LoggingHandle {
            _guard: None,
            log_file_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.repo_root = temp_dir.path().to_string_lossy().to_string();
        config
    }

    #[test]
    fn test_execution_log_path() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let path = execution_log_path(&config, "a1b2c3d4", "build").unwrap();
        assert!(path.starts_with(temp_dir.path()));
        assert!(path.ends_with("agents/a1b2c3d4/build/execution.log"));
    }

    #[test]
    fn test_file_logging_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.logging.to_file = false;

        assert!(execution_log_path(&config, "a1b2c3d4", "build").is_none());
    }
}
