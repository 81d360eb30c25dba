use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{detect, CommentTracker, Detection, TriggerContext};

/// Watches a set of issues at once with a bounded number of running workflows
pub struct ParallelTrigger {
    ctx: TriggerContext,
    issues: Vec<u64>,
    interval: Duration,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<u64, String>>>,
    seen: Arc<Mutex<CommentTracker>>,
}

impl ParallelTrigger {
    pub fn new(ctx: TriggerContext, issues: Vec<u64>, interval: Duration, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            ctx,
            issues,
            interval,
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            active: Arc::new(Mutex::new(HashMap::new())),
            seen: Arc::new(Mutex::new(CommentTracker::new())),
        }
    }

    /// Issue number to workflow id for workflows still running
    pub fn active(&self) -> Arc<Mutex<HashMap<u64, String>>> {
        self.active.clone()
    }

    /// Check every issue once, up to `max_concurrent` at a time.
    /// Returns how many workflows were launched.
    pub async fn run_once(&self) -> Result<usize> {
        let mut tasks = JoinSet::new();

        for &number in &self.issues {
            if self.active.lock().await.contains_key(&number) {
                debug!(issue = number, "Workflow already running, skipping");
                continue;
            }
            let ctx = self.ctx.clone();
            let permits = self.permits.clone();
            let active = self.active.clone();
            let seen = self.seen.clone();
            let max_concurrent = self.max_concurrent;

            tasks.spawn(check_issue(ctx, number, permits, active, seen, max_concurrent));
        }

        let mut launched = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(true)) => launched += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!("Issue check failed, skipping until next cycle: {:#}", e),
                Err(e) => error!("Issue check task panicked: {}", e),
            }
        }
        Ok(launched)
    }

    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "Parallel trigger started for {} issues, max {} concurrent",
            self.issues.len(),
            self.max_concurrent
        );
        let mut interval = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(launched) if launched > 0 => info!("Launched {} workflow(s)", launched),
                        Ok(_) => {}
                        Err(e) => error!("Error polling issues: {:#}", e),
                    }
                }
                () = &mut shutdown => {
                    let running = self.active.lock().await.len();
                    info!("Parallel trigger shutting down, {} workflow(s) still running", running);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Detect and launch for one issue. Returns whether a workflow was launched.
async fn check_issue(
    ctx: TriggerContext,
    number: u64,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<u64, String>>>,
    seen: Arc<Mutex<CommentTracker>>,
    max_concurrent: usize,
) -> Result<bool> {
    let _permit = permits.acquire_owned().await?;
    let issue = ctx.tracker.fetch(number).await?;
    if !issue.is_open() {
        return Ok(false);
    }

    let detection = {
        let mut seen = seen.lock().await;
        detect(&issue, ctx.tracker.bot_identifier(), &mut seen)
    };
    if let Detection::Launch(command) = &detection {
        // Reserve the slot before launching so concurrent checks see it
        let mut running = active.lock().await;
        if running.len() >= max_concurrent {
            drop(running);
            // Let the next cycle see this comment again
            seen.lock().await.forget(number);
            info!(issue = number, "At capacity, deferring launch");
            return Ok(false);
        }
        running.insert(number, command.workflow_id.clone().unwrap_or_default());
    }

    let (workflow_id, child) = match ctx.dispatch(number, detection).await {
        Ok(Some(launched)) => launched,
        Ok(None) => return Ok(false),
        Err(e) => {
            active.lock().await.remove(&number);
            seen.lock().await.forget(number);
            return Err(e);
        }
    };
    active.lock().await.insert(number, workflow_id.clone());

    tokio::spawn(async move {
        let succeeded = child.exited().await;
        active.lock().await.remove(&number);
        info!(issue = number, %workflow_id, succeeded, "Workflow exited");
    });
    Ok(true)
}
