use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::{detect, CommentTracker, Detection, TriggerContext};
use crate::config::Config;
use crate::github::IssueTracker;

/// Labels an issue moves through while the cron trigger handles it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronLabels {
    pub enabled: String,
    pub running: String,
    pub completed: String,
    pub failed: String,
}

impl CronLabels {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.triggers.cron_label.clone(),
            running: config.triggers.cron_running_label.clone(),
            completed: config.triggers.cron_completed_label.clone(),
            failed: config.triggers.cron_failed_label.clone(),
        }
    }
}

/// Swap `from` for `to`. Label failures are logged, never fatal.
async fn relabel(tracker: &dyn IssueTracker, number: u64, from: &str, to: &str) {
    if let Err(e) = tracker.remove_label(number, from).await {
        warn!("Could not remove '{}' from issue #{}: {:#}", from, number, e);
    }
    if let Err(e) = tracker.add_label(number, to).await {
        warn!("Could not add '{}' to issue #{}: {:#}", to, number, e);
    }
}

/// Polls open issues assigned to the current user that carry the cron label
pub struct CronTrigger {
    ctx: TriggerContext,
    labels: CronLabels,
    interval: Duration,
    seen: CommentTracker,
}

impl CronTrigger {
    pub fn new(ctx: TriggerContext, config: &Config) -> Self {
        Self {
            ctx,
            labels: CronLabels::from_config(config),
            interval: config.trigger_interval(),
            seen: CommentTracker::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One polling cycle. Returns how many workflows were launched.
    #[instrument(skip(self))]
    pub async fn run_once(&mut self) -> Result<usize> {
        let user = self
            .ctx
            .tracker
            .current_user()
            .await
            .context("Failed to resolve the current GitHub user")?;
        let issues = self
            .ctx
            .tracker
            .list_open()
            .await
            .context("Failed to list open issues")?;

        let candidates: Vec<u64> = issues
            .iter()
            .filter(|i| i.is_assigned_to(&user) && i.has_label(&self.labels.enabled))
            .map(|i| i.number)
            .collect();
        debug!("{} of {} open issues are eligible", candidates.len(), issues.len());

        let mut launched = 0;
        for number in candidates {
            // Comments are only included in the single-issue view
            let issue = match self.ctx.tracker.fetch(number).await {
                Ok(issue) => issue,
                Err(e) => {
                    warn!("Skipping issue #{} this cycle: {:#}", number, e);
                    continue;
                }
            };
            let detection = detect(&issue, self.ctx.tracker.bot_identifier(), &mut self.seen);
            if self.handle(number, detection).await {
                launched += 1;
            }
        }
        Ok(launched)
    }

    /// Dispatch one detection and move the issue's labels along. Returns whether
    /// a workflow was launched.
    async fn handle(&mut self, number: u64, detection: Detection) -> bool {
        let tracker = self.ctx.tracker.as_ref();
        match detection {
            Detection::Idle => return false,
            Detection::MissingId(_) => {
                if let Err(e) = self.ctx.dispatch(number, detection).await {
                    warn!("Failed to reject command on issue #{}: {:#}", number, e);
                }
                relabel(tracker, number, &self.labels.enabled, &self.labels.failed).await;
                return false;
            }
            Detection::Launch(_) => {
                relabel(tracker, number, &self.labels.enabled, &self.labels.running).await;
            }
        }

        match self.ctx.dispatch(number, detection).await {
            Ok(Some((workflow_id, child))) => {
                let tracker = self.ctx.tracker.clone();
                let labels = self.labels.clone();
                tokio::spawn(async move {
                    let succeeded = child.exited().await;
                    let outcome = if succeeded { &labels.completed } else { &labels.failed };
                    info!(issue = number, %workflow_id, succeeded, "Workflow exited");
                    relabel(tracker.as_ref(), number, &labels.running, outcome).await;
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                // Leave the command pending so the next cycle tries again
                error!("Failed to launch workflow for issue #{}: {:#}", number, e);
                self.seen.forget(number);
                relabel(tracker, number, &self.labels.running, &self.labels.enabled).await;
                false
            }
        }
    }

    /// Poll until `shutdown` resolves. Running workflows are left alone.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "Cron trigger started, label '{}', poll interval: {:?}",
            self.labels.enabled, self.interval
        );
        let mut interval = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Error polling issues: {:#}", e);
                    }
                }
                () = &mut shutdown => {
                    info!("Cron trigger shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}
