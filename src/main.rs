use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use adw::agent::ClaudeCliRunner;
use adw::config::Config;
use adw::error::AdwError;
use adw::git::{CliGitOps, GitOps, WorktreeManager};
use adw::github::GhIssueTracker;
use adw::logging;
use adw::phases::{PhaseContext, PhaseName, PhaseOptions, PhaseOutcome, PhaseRunner};
use adw::pipeline::{Pipeline, PipelineOrchestrator, ProcessPhaseLauncher};
use adw::state::{make_workflow_id, validate_workflow_id, WorkflowState};
use adw::trigger::{self, ChainTrigger, CronTrigger, DetachedLauncher, ParallelTrigger, TriggerContext};
use adw::verify::DiffChangeVerifier;

#[derive(Parser)]
#[command(name = "adw")]
#[command(about = "AI developer workflows in isolated git worktrees")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the issue, create the worktree and write a plan
    Plan {
        issue: u64,
        /// Workflow id to create or resume (generated when omitted)
        adw_id: Option<String>,
        #[arg(long)]
        skip_clarify: bool,
        #[command(flatten)]
        context: PlanContextArgs,
    },

    /// Implement the plan
    Build {
        issue: u64,
        adw_id: String,
        /// Delegate the build to parallel agents
        #[arg(long)]
        parallel: bool,
    },

    /// Run and fix tests
    Test {
        issue: u64,
        adw_id: String,
        #[arg(long)]
        skip_e2e: bool,
    },

    /// Review the implementation against the plan
    Review {
        issue: u64,
        adw_id: String,
        #[arg(long)]
        skip_resolution: bool,
    },

    /// Document the change
    Document { issue: u64, adw_id: String },

    /// Merge the branch and remove the worktree
    Ship { issue: u64, adw_id: String },

    /// Run a pipeline (sdlc, zte, plan_build, plan_build_test, ...)
    Run {
        pipeline: String,
        #[command(flatten)]
        args: PipelineArgs,
    },

    /// Run plan, build, test, review, document and ship
    Sdlc(PipelineArgs),

    /// Run the full lifecycle and merge without human review
    Zte(PipelineArgs),

    /// Watch issues for workflow commands
    Trigger {
        #[command(subcommand)]
        command: TriggerCommand,
    },

    /// Inspect workflow state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Manage workflow worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommand,
    },
}

/// Extra context gathered before planning
#[derive(Args)]
struct PlanContextArgs {
    /// Documentation topics to load for the planner, comma separated
    #[arg(long, value_name = "TOPICS")]
    load_docs: Option<String>,
    /// Scout the codebase first (quick, medium, very_thorough)
    #[arg(long, value_name = "SCALE", num_args = 0..=1, default_missing_value = "medium")]
    scout: Option<String>,
}

#[derive(Args)]
struct PipelineArgs {
    issue: u64,
    adw_id: Option<String>,
    #[arg(long)]
    skip_clarify: bool,
    #[command(flatten)]
    context: PlanContextArgs,
    /// Delegate the build to parallel agents
    #[arg(long)]
    parallel: bool,
    #[arg(long)]
    skip_e2e: bool,
    #[arg(long)]
    skip_resolution: bool,
}

impl PipelineArgs {
    fn options(&self) -> PhaseOptions {
        PhaseOptions {
            skip_clarify: self.skip_clarify,
            load_docs: self.context.load_docs.clone(),
            scout: self.context.scout.clone(),
            parallel_build: self.parallel,
            skip_e2e: self.skip_e2e,
            skip_resolution: self.skip_resolution,
        }
    }
}

#[derive(Subcommand)]
enum TriggerCommand {
    /// Poll assigned issues carrying the cron label
    Cron {
        /// Run a single polling cycle and exit
        #[arg(long)]
        once: bool,
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Work through issues in order, one open issue at a time
    Chain {
        #[arg(required = true)]
        issues: Vec<u64>,
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Watch several issues at once
    Parallel {
        #[arg(required = true)]
        issues: Vec<u64>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum StateCommand {
    /// Print the state record of a workflow
    Show { adw_id: String },
}

#[derive(Subcommand)]
enum WorktreeCommand {
    /// List workflow worktrees
    List,
    /// Remove a workflow's worktree and branch
    Destroy { adw_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let code = run(cli).await?;
    // Exit codes carry phase outcomes: 1 failure, 2 awaiting input
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Arc::new(Config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Plan {
            issue,
            adw_id,
            skip_clarify,
            context,
        } => {
            let options = PhaseOptions {
                skip_clarify,
                load_docs: context.load_docs,
                scout: context.scout,
                ..Default::default()
            };
            // The id is needed up front for the log location
            let adw_id = adw_id.unwrap_or_else(make_workflow_id);
            cmd_phase(&config, cli.debug, PhaseName::Plan, issue, adw_id, options).await
        }
        Commands::Build {
            issue,
            adw_id,
            parallel,
        } => {
            let options = PhaseOptions {
                parallel_build: parallel,
                ..Default::default()
            };
            cmd_phase(&config, cli.debug, PhaseName::Build, issue, adw_id, options).await
        }
        Commands::Test {
            issue,
            adw_id,
            skip_e2e,
        } => {
            let options = PhaseOptions {
                skip_e2e,
                ..Default::default()
            };
            cmd_phase(&config, cli.debug, PhaseName::Test, issue, adw_id, options).await
        }
        Commands::Review {
            issue,
            adw_id,
            skip_resolution,
        } => {
            let options = PhaseOptions {
                skip_resolution,
                ..Default::default()
            };
            cmd_phase(&config, cli.debug, PhaseName::Review, issue, adw_id, options).await
        }
        Commands::Document { issue, adw_id } => {
            cmd_phase(&config, cli.debug, PhaseName::Document, issue, adw_id, PhaseOptions::default()).await
        }
        Commands::Ship { issue, adw_id } => {
            cmd_phase(&config, cli.debug, PhaseName::Ship, issue, adw_id, PhaseOptions::default()).await
        }
        Commands::Run { pipeline, args } => {
            let pipeline: Pipeline = pipeline.parse()?;
            cmd_pipeline(&config, cli.config, cli.debug, pipeline, args).await
        }
        Commands::Sdlc(args) => cmd_pipeline(&config, cli.config, cli.debug, Pipeline::Sdlc, args).await,
        Commands::Zte(args) => cmd_pipeline(&config, cli.config, cli.debug, Pipeline::Zte, args).await,
        Commands::Trigger { command } => {
            let _logging = logging::init_logging(&config, None, cli.debug)?;
            cmd_trigger(&config, cli.config, command).await?;
            Ok(0)
        }
        Commands::State { command } => {
            let _logging = logging::init_logging(&config, None, cli.debug)?;
            match command {
                StateCommand::Show { adw_id } => cmd_state_show(&config, &adw_id)?,
            }
            Ok(0)
        }
        Commands::Worktree { command } => {
            let _logging = logging::init_logging(&config, None, cli.debug)?;
            cmd_worktree(&config, command).await?;
            Ok(0)
        }
    }
}

async fn phase_context(config: &Arc<Config>, options: PhaseOptions) -> Result<PhaseContext> {
    let agent = ClaudeCliRunner::new(&config.agent, config.state_root());
    if !agent.is_installed() {
        bail!(
            "Agent CLI '{}' not found. Install it or set agent.command in .adw/config.toml",
            config.agent.command
        );
    }
    let tracker = Arc::new(GhIssueTracker::from_config(config).await?);
    let git: Arc<dyn GitOps> = Arc::new(CliGitOps::new(config.git.remote.clone()));

    Ok(PhaseContext {
        config: config.clone(),
        agent: Arc::new(agent),
        tracker: tracker.clone(),
        prs: tracker,
        verifier: Arc::new(DiffChangeVerifier::new(git.clone())),
        git,
        worktrees: WorktreeManager::from_config(config),
        options,
    })
}

async fn cmd_phase(
    config: &Arc<Config>,
    debug: bool,
    phase: PhaseName,
    issue: u64,
    adw_id: String,
    options: PhaseOptions,
) -> Result<i32> {
    validate_workflow_id(&adw_id)?;
    let logging_handle = logging::init_logging(config, Some((&adw_id, phase.as_str())), debug)?;

    let runner = PhaseRunner::new(phase_context(config, options).await?);
    let outcome = runner.run_named(phase, issue, Some(&adw_id)).await;

    match &outcome {
        PhaseOutcome::Success { skipped: true } => {
            eprintln!("{} already completed for workflow {}", phase, adw_id);
        }
        PhaseOutcome::Success { .. } => eprintln!("{} completed for workflow {}", phase, adw_id),
        PhaseOutcome::AwaitingInput(reason) => {
            eprintln!("{} paused for workflow {}: {}", phase, adw_id, reason);
        }
        PhaseOutcome::Fatal(reason) => eprintln!("{} failed for workflow {}: {}", phase, adw_id, reason),
    }
    if let Some(log_path) = &logging_handle.log_file_path {
        eprintln!("Log: {}", log_path.display());
    }
    Ok(outcome.exit_code())
}

async fn cmd_pipeline(
    config: &Arc<Config>,
    config_path: Option<String>,
    debug: bool,
    pipeline: Pipeline,
    args: PipelineArgs,
) -> Result<i32> {
    let adw_id = args.adw_id.clone().unwrap_or_else(make_workflow_id);
    validate_workflow_id(&adw_id)?;
    let _logging = logging::init_logging(config, Some((&adw_id, pipeline.as_str())), debug)?;

    let tracker = Arc::new(GhIssueTracker::from_config(config).await?);
    let launcher = Arc::new(ProcessPhaseLauncher::new(config_path, args.options())?);
    let orchestrator = PipelineOrchestrator::new(pipeline, config.clone(), launcher, tracker);

    let report = orchestrator.run(args.issue, Some(adw_id)).await;
    eprintln!(
        "{} pipeline for workflow {}: {:?}",
        pipeline, report.workflow_id, report.outcome
    );
    eprintln!(
        "Completed phases: {}",
        report
            .completed_phases
            .iter()
            .map(PhaseName::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(report.exit_code())
}

async fn cmd_trigger(config: &Config, config_path: Option<String>, command: TriggerCommand) -> Result<()> {
    let tracker = Arc::new(GhIssueTracker::from_config(config).await?);
    let launcher = Arc::new(DetachedLauncher::new(config_path)?);
    let ctx = TriggerContext::new(tracker, launcher);
    let interval = |secs: Option<u64>| secs.map_or_else(|| config.trigger_interval(), |s| Duration::from_secs(s.max(1)));

    match command {
        TriggerCommand::Cron {
            once,
            interval: secs,
        } => {
            let mut cron = CronTrigger::new(ctx, config).with_interval(interval(secs));
            if once {
                let launched = cron.run_once().await?;
                println!("Launched {} workflow(s)", launched);
            } else {
                cron.run(trigger::shutdown_signal()).await?;
            }
        }
        TriggerCommand::Chain {
            issues,
            interval: secs,
        } => {
            ChainTrigger::new(ctx, issues, interval(secs))
                .run(trigger::shutdown_signal())
                .await?;
        }
        TriggerCommand::Parallel {
            issues,
            max_concurrent,
            interval: secs,
        } => {
            let max_concurrent = max_concurrent.unwrap_or_else(|| config.effective_max_concurrent());
            ParallelTrigger::new(ctx, issues, interval(secs), max_concurrent)
                .run(trigger::shutdown_signal())
                .await?;
        }
    }
    Ok(())
}

fn cmd_state_show(config: &Config, adw_id: &str) -> Result<()> {
    let Some(state) = WorkflowState::load(&config.state_root(), adw_id)? else {
        return Err(AdwError::not_found(
            format!("workflow state for {}", adw_id),
            "Run `adw plan <issue>` to start a workflow",
        )
        .into());
    };
    println!("{}", serde_json::to_string_pretty(&state)?);
    println!();
    println!("{}", state.token_summary());
    Ok(())
}

async fn cmd_worktree(config: &Config, command: WorktreeCommand) -> Result<()> {
    let worktrees = WorktreeManager::from_config(config);
    match command {
        WorktreeCommand::List => {
            let ids = worktrees.list().await?;
            if ids.is_empty() {
                println!("No workflow worktrees");
                return Ok(());
            }
            println!("Worktrees ({})", ids.len());
            println!("{}", "─".repeat(60));
            for id in ids {
                println!("{}  {}", id, worktrees.path_for(&id).display());
            }
        }
        WorktreeCommand::Destroy { adw_id } => {
            let report = worktrees.destroy(&adw_id).await?;
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            if report.removed {
                println!("Removed worktree for {}", adw_id);
            } else {
                println!("Worktree for {} was not fully removed", adw_id);
            }
        }
    }
    Ok(())
}
