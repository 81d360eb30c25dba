use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Component, Path};
use tracing::{info, warn};

use super::{Attempt, AttemptOutcome, Phase, PhaseContext, PhaseName};
use crate::agent::{self, strip_code_fence, AgentRequest};
use crate::error::AdwError;
use crate::github::{is_bot_text, Issue};
use crate::state::{Clarification, IssueClass, WorkflowState, WorkflowStateUpdate};

/// Classify the issue, create the worktree, and write a plan into it
pub struct PlanPhase;

#[derive(Debug, Deserialize)]
struct ClarifyResult {
    #[serde(default, alias = "has_ambiguities")]
    needs_clarification: bool,
    #[serde(default)]
    questions: Vec<ClarifyQuestion>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClarifyQuestion {
    Text(String),
    Detailed { question: String },
}

impl ClarifyQuestion {
    fn into_text(self) -> String {
        match self {
            ClarifyQuestion::Text(text) => text,
            ClarifyQuestion::Detailed { question } => question,
        }
    }
}

enum ClarifyStep {
    Proceed,
    Wait(String),
}

#[async_trait]
impl Phase for PlanPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Plan
    }

    fn requires_worktree(&self) -> bool {
        false
    }

    async fn attempt(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
        _attempt: &Attempt,
    ) -> Result<AttemptOutcome, AdwError> {
        let issue_number = state.issue_number;
        let workflow_id = state.workflow_id().to_string();

        let issue = ctx.tracker.fetch(issue_number).await?;
        if let Err(e) = ctx.tracker.mark_in_progress(issue_number).await {
            warn!("Could not mark issue #{} in progress: {:#}", issue_number, e);
        }
        ctx.comment(issue_number, &workflow_id, agent::OPS, "✅ Starting isolated planning phase")
            .await;

        let issue_class = match state.issue_class {
            Some(class) => class,
            None => classify(ctx, state, &issue).await?,
        };

        let branch = match state.branch_name() {
            Some(branch) => branch.to_string(),
            None => generate_branch(ctx, state, &issue, issue_class).await?,
        };

        let worktree = match state.worktree_path() {
            Some(path) if path.is_dir() => path.to_path_buf(),
            _ => {
                let path = ctx.worktrees.create(&workflow_id, &branch).await?;
                state.update(WorkflowStateUpdate {
                    worktree_path: Some(path.clone()),
                    ..Default::default()
                })?;
                state.save("plan:worktree")?;
                ctx.comment(
                    issue_number,
                    &workflow_id,
                    agent::OPS,
                    &format!("🏠 Worktree ready at {} on branch `{}`", path.display(), branch),
                )
                .await;
                path
            }
        };

        if let Some(topics) = &ctx.options.load_docs {
            if state.ai_docs_context.is_none() {
                load_docs(ctx, state, topics, &worktree).await?;
            }
        }
        if let Some(scale) = &ctx.options.scout {
            if state.scouting_results.is_none() {
                scout(ctx, state, &issue, scale, &worktree).await?;
            }
        }

        if !ctx.options.skip_clarify {
            if let ClarifyStep::Wait(reason) = clarify(ctx, state, &issue, &worktree).await? {
                return Ok(AttemptOutcome::AwaitingInput(reason));
            }
        }

        let request = planner_request(ctx, state, &issue, issue_class, &worktree);
        let planner = request.agent_name.clone();
        let response = ctx.run_agent(state, request).await?;
        if !response.success {
            return Err(AdwError::agent_failed(&planner, response.output));
        }

        let plan_file = locate_plan(&worktree, &response.output, &workflow_id)?;
        info!(%plan_file, "Plan created");
        state.update(WorkflowStateUpdate {
            plan_file: Some(plan_file.clone()),
            ..Default::default()
        })?;
        state.save("plan:plan_file")?;

        Ok(AttemptOutcome::Done(format!("📋 Plan: `{}`", plan_file)))
    }

    async fn on_success(
        &self,
        ctx: &PhaseContext,
        state: &mut WorkflowState,
    ) -> Result<(), AdwError> {
        ctx.commit(state, PhaseName::Plan).await?;
        ctx.publish(state).await;
        Ok(())
    }

    fn completed_summary(&self, state: &WorkflowState) -> String {
        match &state.plan_file {
            Some(plan) => format!("plan is `{}`", plan),
            None => String::new(),
        }
    }
}

/// Scouted workflows plan from a free-form description plus the scout report;
/// others use the issue-class command. Loaded documentation goes last.
fn planner_request(
    ctx: &PhaseContext,
    state: &WorkflowState,
    issue: &Issue,
    class: IssueClass,
    worktree: &Path,
) -> AgentRequest {
    let clarifications = clarification_context(state);
    let mut request = match &state.scouting_results {
        Some(scouting) => {
            let mut description = format!("{}\n\n{}", issue.title, issue.body);
            if let Some(context) = clarifications {
                description.push_str("\n\n");
                description.push_str(&context);
            }
            ctx.request(state, agent::SCOUT_PLANNER, "/plan_w_scouters", worktree.to_path_buf())
                .arg(description)
                .arg(scouting.clone())
        }
        None => {
            let mut request = ctx
                .request(state, agent::PLANNER, class.slash_command(), worktree.to_path_buf())
                .arg(issue.number.to_string())
                .arg(state.workflow_id())
                .arg(issue.minimal_json());
            if let Some(context) = clarifications {
                request = request.arg(context);
            }
            request
        }
    };
    if let Some(docs) = &state.ai_docs_context {
        request = request.arg(docs.clone());
    }
    request
}

/// Load documentation topics for the planner. Topics that fail are skipped.
async fn load_docs(
    ctx: &PhaseContext,
    state: &mut WorkflowState,
    topics: &str,
    worktree: &Path,
) -> Result<(), AdwError> {
    let issue_number = state.issue_number;
    let workflow_id = state.workflow_id().to_string();

    let mut topics: Vec<&str> = topics
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    let limit = ctx.config.phases.max_doc_topics.max(1);
    if topics.len() > limit {
        info!("Limiting documentation topics for planning: {} -> {}", topics.len(), limit);
        topics.truncate(limit);
    }
    if topics.is_empty() {
        return Ok(());
    }

    ctx.comment(
        issue_number,
        &workflow_id,
        agent::OPS,
        &format!("📚 Loading documentation: {}", topics.join(", ")),
    )
    .await;

    let mut sections = Vec::new();
    let mut failed = Vec::new();
    for topic in &topics {
        let request = ctx
            .request(state, agent::DOCS_LOADER, "/load_ai_docs", worktree.to_path_buf())
            .arg(*topic);
        match ctx.run_agent(state, request).await {
            Ok(response) if response.success && !response.output.trim().is_empty() => {
                sections.push(format!("# Documentation: {}\n\n{}", topic, response.output.trim()));
            }
            Ok(response) => {
                warn!("Failed to load documentation topic '{}': {}", topic, response.output);
                failed.push(*topic);
            }
            Err(e) => {
                warn!("Failed to load documentation topic '{}': {}", topic, e);
                failed.push(*topic);
            }
        }
    }

    if sections.is_empty() {
        ctx.comment(
            issue_number,
            &workflow_id,
            agent::OPS,
            &format!("⚠️ No documentation could be loaded ({}), planning without it", failed.join(", ")),
        )
        .await;
        return Ok(());
    }

    let mut message = format!("✅ Documentation loaded ({}/{} topics)", sections.len(), topics.len());
    if !failed.is_empty() {
        message.push_str(&format!("\n⚠️ Failed to load: {}", failed.join(", ")));
    }
    state.update(WorkflowStateUpdate {
        ai_docs_context: Some(sections.join("\n\n---\n\n")),
        ..Default::default()
    })?;
    state.save("plan:docs")?;
    ctx.comment(issue_number, &workflow_id, agent::OPS, &message).await;
    Ok(())
}

/// Explore the codebase before planning. A failed scout only costs the extra context.
async fn scout(
    ctx: &PhaseContext,
    state: &mut WorkflowState,
    issue: &Issue,
    scale: &str,
    worktree: &Path,
) -> Result<(), AdwError> {
    let issue_number = state.issue_number;
    let workflow_id = state.workflow_id().to_string();
    ctx.comment(
        issue_number,
        &workflow_id,
        agent::OPS,
        &format!("🔍 Scouting codebase for context (scale: {})", scale),
    )
    .await;

    let query = if issue.body.trim().is_empty() {
        issue.title.clone()
    } else {
        issue.body.clone()
    };
    let request = ctx
        .request(state, agent::SCOUT, "/scout", worktree.to_path_buf())
        .arg(query)
        .arg(scale);
    let failure = match ctx.run_agent(state, request).await {
        Ok(response) if response.success => {
            info!("Codebase scouting completed");
            state.update(WorkflowStateUpdate {
                scouting_results: Some(response.output),
                ..Default::default()
            })?;
            state.save("plan:scout")?;
            ctx.comment(issue_number, &workflow_id, agent::OPS, "✅ Codebase scouting completed")
                .await;
            return Ok(());
        }
        Ok(response) => response.output,
        Err(e) => e.to_string(),
    };

    warn!("Scouting failed, planning without it: {}", failure);
    let excerpt: String = failure.chars().take(200).collect();
    ctx.comment(
        issue_number,
        &workflow_id,
        agent::OPS,
        &format!("⚠️ Scouting failed (continuing): {}", excerpt),
    )
    .await;
    Ok(())
}

async fn classify(
    ctx: &PhaseContext,
    state: &mut WorkflowState,
    issue: &Issue,
) -> Result<IssueClass, AdwError> {
    let request = ctx
        .request(state, agent::ISSUE_CLASSIFIER, "/classify_issue", ctx.worktrees.repo_root().to_path_buf())
        .arg(issue.minimal_json());
    let response = ctx.run_agent(state, request).await?;
    if !response.success {
        return Err(AdwError::agent_failed(agent::ISSUE_CLASSIFIER, response.output));
    }

    let class = IssueClass::parse(strip_code_fence(&response.output)).ok_or_else(|| {
        AdwError::Validation(format!(
            "could not classify issue #{} (classifier said '{}')",
            issue.number,
            response.output.trim()
        ))
    })?;
    info!(%class, "Issue classified");
    state.update(WorkflowStateUpdate {
        issue_class: Some(class),
        ..Default::default()
    })?;
    state.save("plan:classify")?;
    Ok(class)
}

async fn generate_branch(
    ctx: &PhaseContext,
    state: &mut WorkflowState,
    issue: &Issue,
    class: IssueClass,
) -> Result<String, AdwError> {
    let request = ctx
        .request(state, agent::BRANCH_GENERATOR, "/generate_branch_name", ctx.worktrees.repo_root().to_path_buf())
        .arg(class.as_str())
        .arg(state.workflow_id())
        .arg(issue.minimal_json());
    let response = ctx.run_agent(state, request).await?;
    if !response.success {
        return Err(AdwError::agent_failed(agent::BRANCH_GENERATOR, response.output));
    }

    let branch = normalize_branch_name(&response.output, class, state.workflow_id(), issue.number);
    info!(%branch, "Branch name chosen");
    state.update(WorkflowStateUpdate {
        branch_name: Some(branch.clone()),
        ..Default::default()
    })?;
    state.save("plan:branch")?;
    Ok(branch)
}

/// Take the generator's answer if it is a usable ref name, else build one
fn normalize_branch_name(raw: &str, class: IssueClass, workflow_id: &str, issue_number: u64) -> String {
    let candidate = strip_code_fence(raw)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("")
        .trim_matches('`');

    let valid = !candidate.is_empty()
        && !candidate.starts_with(['-', '/', '.'])
        && !candidate.ends_with(['/', '.'])
        && !candidate.contains("..")
        && !candidate.ends_with(".lock")
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'));

    if valid {
        candidate.to_string()
    } else {
        warn!("Generated branch name '{}' is unusable, using a default", candidate);
        format!("{}/{}-issue-{}", class, workflow_id, issue_number)
    }
}

/// Ask clarifying questions once; on later runs look for human answers
async fn clarify(
    ctx: &PhaseContext,
    state: &mut WorkflowState,
    issue: &Issue,
    worktree: &Path,
) -> Result<ClarifyStep, AdwError> {
    let issue_number = state.issue_number;
    let workflow_id = state.workflow_id().to_string();

    if let Some(existing) = state.clarification.clone() {
        if existing.resolved {
            return Ok(ClarifyStep::Proceed);
        }
        let bot = ctx.tracker.bot_identifier();
        let answers: Vec<String> = issue
            .comments
            .iter()
            .filter(|c| !is_bot_text(bot, &c.body))
            .filter(|c| c.created_at.map(|at| at > existing.asked_at).unwrap_or(false))
            .map(|c| c.body.trim().to_string())
            .collect();
        if answers.is_empty() {
            return Ok(ClarifyStep::Wait(
                "clarification questions are still unanswered".to_string(),
            ));
        }
        info!(count = answers.len(), "Clarification answered");
        state.update(WorkflowStateUpdate {
            clarification: Some(Clarification {
                answers,
                resolved: true,
                ..existing
            }),
            ..Default::default()
        })?;
        state.save("plan:clarified")?;
        return Ok(ClarifyStep::Proceed);
    }

    let request = ctx
        .request(state, agent::ISSUE_CLARIFIER, "/clarify", worktree.to_path_buf())
        .arg(issue.minimal_json());
    let response = ctx.run_agent(state, request).await?;
    if !response.success {
        warn!("Clarification check failed, continuing without it: {}", response.output);
        return Ok(ClarifyStep::Proceed);
    }

    let result: ClarifyResult = match serde_json::from_str(strip_code_fence(&response.output)) {
        Ok(result) => result,
        Err(e) => {
            warn!("Unparseable clarification output, continuing: {}", e);
            return Ok(ClarifyStep::Proceed);
        }
    };

    let questions: Vec<String> = result
        .questions
        .into_iter()
        .map(ClarifyQuestion::into_text)
        .filter(|q| !q.trim().is_empty())
        .collect();
    if !result.needs_clarification || questions.is_empty() {
        return Ok(ClarifyStep::Proceed);
    }

    let mut message = String::from("❓ Planning is paused until these questions are answered:\n\n");
    for (i, question) in questions.iter().enumerate() {
        message.push_str(&format!("{}. {}\n", i + 1, question));
    }
    message.push_str(&format!(
        "\nReply on this issue, then re-run plan with workflow id `{}`.",
        workflow_id
    ));

    state.update(WorkflowStateUpdate {
        clarification: Some(Clarification {
            questions,
            answers: Vec::new(),
            asked_at: Utc::now(),
            resolved: false,
        }),
        ..Default::default()
    })?;
    state.save("plan:clarify")?;
    ctx.comment(issue_number, &workflow_id, agent::ISSUE_CLARIFIER, &message)
        .await;

    Ok(ClarifyStep::Wait("waiting for answers to clarification questions".to_string()))
}

fn clarification_context(state: &WorkflowState) -> Option<String> {
    let clarification = state.clarification.as_ref().filter(|c| c.resolved)?;
    let mut context = String::from("Clarifications:");
    for question in &clarification.questions {
        context.push_str(&format!("\nQ: {}", question));
    }
    for answer in &clarification.answers {
        context.push_str(&format!("\nA: {}", answer));
    }
    Some(context)
}

/// `relative` names a location under `root`, with no `..` or absolute parts,
/// and does not leave `root` through a symlink
fn stays_inside(root: &Path, relative: &Path) -> bool {
    let lexical = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !lexical {
        return false;
    }
    match (root.join(relative).canonicalize(), root.canonicalize()) {
        (Ok(resolved), Ok(root)) => resolved.starts_with(root),
        // Nothing on disk yet, so nothing to escape through
        _ => true,
    }
}

/// The planner reports where it wrote the plan; fall back to `specs/*<id>*.md`
fn locate_plan(worktree: &Path, output: &str, workflow_id: &str) -> Result<String, AdwError> {
    let reported = strip_code_fence(output)
        .lines()
        .map(|l| l.trim().trim_matches('`'))
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("");

    if !reported.is_empty() {
        let path = Path::new(reported);
        let relative = path.strip_prefix(worktree).unwrap_or(path);
        if !stays_inside(worktree, relative) {
            warn!("Ignoring plan path outside the worktree: {}", reported);
        } else if worktree.join(relative).is_file() {
            return Ok(relative.to_string_lossy().to_string());
        }
    }

    let pattern = worktree.join("specs").join(format!("*{}*.md", workflow_id));
    let found = glob::glob(&pattern.to_string_lossy())
        .ok()
        .and_then(|mut paths| paths.find_map(Result::ok));
    if let Some(path) = found {
        if let Ok(relative) = path.strip_prefix(worktree) {
            return Ok(relative.to_string_lossy().to_string());
        }
    }

    Err(AdwError::Validation(format!(
        "planner did not produce a plan file (reported '{}')",
        reported
    )))
}
