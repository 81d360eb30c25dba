use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::Workflow;

/// A started workflow. Awaiting [`Launched::exited`] reaps the child.
pub struct Launched {
    pid: Option<u32>,
    exit: Pin<Box<dyn Future<Output = bool> + Send>>,
}

impl Launched {
    /// `exit` resolves to whether the workflow succeeded
    pub fn new(pid: Option<u32>, exit: impl Future<Output = bool> + Send + 'static) -> Self {
        Self {
            pid,
            exit: Box::pin(exit),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves when the workflow process exits, with its success
    pub async fn exited(self) -> bool {
        self.exit.await
    }
}

impl fmt::Debug for Launched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launched").field("pid", &self.pid).finish()
    }
}

#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    async fn launch(&self, issue_number: u64, workflow: &Workflow, workflow_id: &str) -> Result<Launched>;
}

/// Starts `adw` subcommands as background processes in their own process group
pub struct DetachedLauncher {
    exe: PathBuf,
    config_path: Option<String>,
}

impl DetachedLauncher {
    pub fn new(config_path: Option<String>) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the adw executable")?;
        Ok(Self { exe, config_path })
    }

    pub fn args(&self, issue_number: u64, workflow: &Workflow, workflow_id: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.clone());
        }
        match workflow {
            Workflow::Phase(phase) => args.push(phase.as_str().to_string()),
            Workflow::Pipeline(pipeline) => {
                args.push("run".to_string());
                args.push(pipeline.as_str().to_string());
            }
        }
        args.push(issue_number.to_string());
        args.push(workflow_id.to_string());
        args
    }
}

#[async_trait]
impl WorkflowLauncher for DetachedLauncher {
    #[instrument(skip(self, workflow), fields(workflow = %workflow))]
    async fn launch(&self, issue_number: u64, workflow: &Workflow, workflow_id: &str) -> Result<Launched> {
        let args = self.args(issue_number, workflow, workflow_id);
        debug!(?args, "Spawning detached workflow");

        let mut command = Command::new(&self.exe);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Keep children alive when the daemon's terminal sends SIGINT to its group
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {} for issue #{}", workflow, issue_number))?;
        let pid = child.id();
        Ok(Launched::new(pid, async move {
            match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    warn!(?pid, "Failed to reap workflow process: {}", e);
                    false
                }
            }
        }))
    }
}
