use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::{detect, CommentTracker, TriggerContext};

/// What a chain cycle looked at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// The first open issue in the chain
    Watching(u64),
    /// An issue could not be fetched, so the head of the chain is unknown
    Unknown(u64),
    /// Every issue in the chain is closed
    Finished,
}

/// Works through an ordered backlog, one open issue at a time
pub struct ChainTrigger {
    ctx: TriggerContext,
    issues: Vec<u64>,
    interval: Duration,
    seen: CommentTracker,
}

impl ChainTrigger {
    pub fn new(ctx: TriggerContext, issues: Vec<u64>, interval: Duration) -> Self {
        Self {
            ctx,
            issues,
            interval,
            seen: CommentTracker::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&mut self) -> Result<ChainStatus> {
        for &number in &self.issues {
            let issue = match self.ctx.tracker.fetch(number).await {
                Ok(issue) => issue,
                Err(e) => {
                    // Later issues must wait until this one is known to be closed
                    warn!("Cannot fetch issue #{}, retrying next cycle: {:#}", number, e);
                    return Ok(ChainStatus::Unknown(number));
                }
            };
            if !issue.is_open() {
                continue;
            }

            let detection = detect(&issue, self.ctx.tracker.bot_identifier(), &mut self.seen);
            match self.ctx.dispatch(number, detection).await {
                Ok(Some((_, child))) => {
                    tokio::spawn(child.exited());
                }
                Ok(None) => {}
                Err(e) => {
                    // The command stays pending until a launch succeeds
                    self.seen.forget(number);
                    return Err(e);
                }
            }
            return Ok(ChainStatus::Watching(number));
        }
        Ok(ChainStatus::Finished)
    }

    /// Poll until every issue is closed or `shutdown` resolves
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Chain trigger started for issues {:?}", self.issues);
        let mut interval = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(ChainStatus::Finished) => {
                            info!("All issues in the chain are closed");
                            break;
                        }
                        Ok(status) => info!(?status, "Chain cycle complete"),
                        Err(e) => error!("Error polling chain: {:#}", e),
                    }
                }
                () = &mut shutdown => {
                    info!("Chain trigger shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}
