//! Prompt composer (spec §4.3).
//!
//! Builds the `(system_prompt, task_prompt)` pair the loop hands to a
//! harness. Pure over its inputs: identical [`ComposerInput`] values
//! always produce byte-identical prompts. Layer 1 (the runloop template)
//! mirrors the teacher's embed-at-compile-time preset technique — a
//! project can override it, but a working default always ships in the
//! binary.

use std::path::{Path, PathBuf};

use crate::task::{Task, TaskStatus};

/// Built-in runloop instructions, used when no project override is found.
const RUNLOOP_FALLBACK: &str = include_str!("../templates/runloop_fallback.md");

/// Lookup list for a project-installed runloop template override, in
/// priority order.
const RUNLOOP_TEMPLATE_LOOKUP: &[&str] = &[".cub/runloop.md", ".cub/templates/runloop.md"];

/// Lookup list for the project's agent-instruction file.
const AGENT_INSTRUCTIONS_LOOKUP: &[&str] = &["AGENTS.md", "CLAUDE.md", ".cub/AGENTS.md"];

/// Extracted context from a plan's `prompt-context.md`, if the task
/// belongs to one.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub problem_statement: String,
    pub requirements: String,
    pub technical_approach: String,
    pub constraints: String,
}

/// Summary of a sibling task under the same parent epic.
#[derive(Debug, Clone)]
pub struct SiblingSummary {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

/// Dynamically generated summary of a task's parent epic.
#[derive(Debug, Clone)]
pub struct EpicContext {
    pub title: String,
    pub description: String,
    pub siblings: Vec<SiblingSummary>,
}

impl EpicContext {
    fn render(&self) -> String {
        let mut closed = 0usize;
        let mut open = 0usize;
        let mut in_progress = 0usize;
        let mut lines = Vec::new();
        for s in &self.siblings {
            match s.status {
                TaskStatus::Closed => closed += 1,
                TaskStatus::Open => open += 1,
                TaskStatus::InProgress => in_progress += 1,
            }
            lines.push(format!("- {} [{}] {}", s.id, s.status, s.title));
        }
        format!(
            "## Epic context\n\n{title}\n\n{description}\n\n\
             Sibling tasks: {closed} closed, {open} open, {in_progress} in progress.\n\n{siblings}",
            title = self.title,
            description = self.description,
            siblings = lines.join("\n"),
        )
    }
}

/// A previous attempt on this task, as surfaced to the composer.
#[derive(Debug, Clone)]
pub struct RetrySummary {
    pub attempt_index: u32,
    pub error_category: Option<String>,
    pub error_summary: Option<String>,
}

/// Everything the composer needs to build one prompt pair.
#[derive(Debug, Clone)]
pub struct ComposerInput<'a> {
    pub project_dir: PathBuf,
    pub task: &'a Task,
    pub plan: Option<PlanContext>,
    pub epic: Option<EpicContext>,
    pub retries: Vec<RetrySummary>,
}

/// Locate the first existing file in `candidates`, relative to `root`.
fn first_existing(root: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().map(|c| root.join(c)).find(|p| p.is_file())
}

fn runloop_template(project_dir: &Path) -> String {
    match first_existing(project_dir, RUNLOOP_TEMPLATE_LOOKUP) {
        Some(path) => std::fs::read_to_string(&path).unwrap_or_else(|_| RUNLOOP_FALLBACK.to_string()),
        None => RUNLOOP_FALLBACK.to_string(),
    }
}

fn project_context(project_dir: &Path) -> Option<String> {
    let path = first_existing(project_dir, AGENT_INSTRUCTIONS_LOOKUP)?;
    std::fs::read_to_string(&path).ok()
}

fn plan_context_section(plan: &PlanContext) -> String {
    format!(
        "## Plan context\n\n\
         Problem statement:\n{problem}\n\n\
         Requirements:\n{requirements}\n\n\
         Technical approach:\n{approach}\n\n\
         Constraints:\n{constraints}",
        problem = plan.problem_statement,
        requirements = plan.requirements,
        approach = plan.technical_approach,
        constraints = plan.constraints,
    )
}

fn task_context_section(task: &Task) -> String {
    format!(
        "## Task context\n\n\
         id: {id}\n\
         title: {title}\n\n\
         {description}\n\n\
         When the task is fully done, call the task backend's close \
         operation with id `{id}` and a one-line reason.",
        id = task.id,
        title = task.title,
        description = task.description,
    )
}

fn retry_context_section(retries: &[RetrySummary]) -> Option<String> {
    if retries.is_empty() {
        return None;
    }
    let mut lines = Vec::new();
    for r in retries {
        lines.push(format!(
            "- attempt {idx}: {cat} -- {summary}",
            idx = r.attempt_index,
            cat = r.error_category.as_deref().unwrap_or("unknown"),
            summary = r.error_summary.as_deref().unwrap_or("no summary recorded"),
        ));
    }
    Some(format!(
        "## Retry context\n\nThis task has been attempted before:\n\n{}",
        lines.join("\n")
    ))
}

/// Compose the `(system_prompt, task_prompt)` pair for one attempt.
pub fn compose(input: &ComposerInput<'_>) -> (String, String) {
    let mut layers = vec![runloop_template(&input.project_dir)];

    if let Some(project) = project_context(&input.project_dir) {
        layers.push(format!("## Project context\n\n{project}"));
    }
    if let Some(plan) = &input.plan {
        layers.push(plan_context_section(plan));
    }
    if let Some(epic) = &input.epic {
        layers.push(epic.render());
    }
    layers.push(task_context_section(input.task));
    if let Some(retry) = retry_context_section(&input.retries) {
        layers.push(retry);
    }

    let system_prompt = layers.join("\n\n---\n\n");

    let mut task_prompt = format!("Work on task {}: {}", input.task.id, input.task.title);
    if !input.task.description.is_empty() {
        let first_line = input.task.description.lines().next().unwrap_or_default();
        if !first_line.is_empty() {
            task_prompt.push_str(&format!("\n\n{first_line}"));
        }
    }

    (system_prompt, task_prompt)
}
