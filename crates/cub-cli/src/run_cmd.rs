//! `cub run`: build the clean-state gate and run config from CLI flags,
//! then either list ready tasks (`--ready`) or drive the loop.

use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use cub_core::budget::BudgetLimits;
use cub_core::gate::{CleanStateGate, CommandCheck, CurrentBranchCheck, GateCheck, NestingCheck, VcsCleanCheck};
use cub_core::runloop::{self, RunConfig, RunDeps};
use cub_core::task::TaskFilters;

use crate::context::Context as CubContext;

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Harness to drive the task with (defaults to the project config, then the only registered harness).
    #[arg(long)]
    pub harness: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    /// Complete at most one task, then exit.
    #[arg(long)]
    pub once: bool,
    /// Run a single, specific task id.
    #[arg(long)]
    pub task: Option<String>,
    #[arg(long)]
    pub parent: Option<String>,
    #[arg(long)]
    pub label: Option<String>,
    /// List ready tasks and exit, without invoking the harness.
    #[arg(long)]
    pub ready: bool,
    #[arg(long)]
    pub budget: Option<f64>,
    #[arg(long)]
    pub budget_tokens: Option<u64>,
    #[arg(long)]
    pub max_iterations: Option<u64>,
    #[arg(long)]
    pub max_tasks: Option<u64>,
    #[arg(long)]
    pub per_task_timeout: Option<u64>,
    /// Stream harness output to stdout as it runs.
    #[arg(long)]
    pub stream: bool,
    #[arg(long)]
    pub require_clean: bool,
    #[arg(long)]
    pub run_tests: bool,
    #[arg(long)]
    pub run_typecheck: bool,
    #[arg(long)]
    pub run_lint: bool,
    /// Permit running on a branch named `main`/`master`.
    #[arg(long)]
    pub main_ok: bool,
}

pub async fn run(ctx: CubContext, args: RunArgs) -> Result<i32> {
    if args.ready {
        let filters = TaskFilters { parent: args.parent.clone(), label: args.label.clone(), task_id: args.task.clone() };
        let ready = ctx.task_backend.ready(&filters).await.context("listing ready tasks")?;
        if ready.is_empty() {
            println!("no ready tasks");
        }
        for task in ready {
            println!("{}\t{}\t{}", task.id, task.priority, task.title);
        }
        return Ok(0);
    }

    let gate = build_gate(&ctx, &args);
    let harness = ctx.resolve_harness(args.harness.as_deref())?;

    let config = RunConfig {
        model: args.model.or_else(|| ctx.config.file.harness.model.clone()),
        once: args.once,
        task_filter: args.task,
        parent_filter: args.parent,
        label_filter: args.label,
        budget: BudgetLimits {
            max_cost_usd: args.budget.or(ctx.config.file.budget.max_cost_usd),
            max_tokens: args.budget_tokens.or(ctx.config.file.budget.max_tokens),
            max_tasks: args.max_tasks.or(ctx.config.file.budget.max_tasks),
            max_iterations: args.max_iterations.or(ctx.config.file.budget.max_iterations),
            warn_at: ctx.config.file.budget.warn_at,
        },
        per_task_timeout: args.per_task_timeout.map(Duration::from_secs),
        max_iterations: args.max_iterations,
        stream: args.stream,
    };

    let deps = RunDeps {
        config: ctx.config,
        task_backend: ctx.task_backend,
        harness,
        ledger: ctx.ledger,
        gate,
    };

    let run_id = Uuid::new_v4().to_string();
    let (artifact, exit_code) = runloop::run(run_id, config, deps).await?;
    tracing::info!(
        run_id = %artifact.run_id,
        phase = %artifact.phase,
        tasks_completed = artifact.tasks_completed,
        "run finished"
    );
    Ok(exit_code)
}

fn build_gate(ctx: &CubContext, args: &RunArgs) -> CleanStateGate {
    let gate_cfg = &ctx.config.file.gate;
    let timeout = Duration::from_secs(gate_cfg.command_timeout_secs.unwrap_or(300));
    let mut checks: Vec<Box<dyn GateCheck>> = Vec::new();

    checks.push(Box::new(NestingCheck));
    checks.push(Box::new(CurrentBranchCheck { main_ok: args.main_ok }));

    let require_clean = args.require_clean || gate_cfg.require_clean.unwrap_or(false);
    if require_clean {
        checks.push(Box::new(VcsCleanCheck { tracked_only: true }));
    }

    if args.run_tests {
        if let Some(command) = gate_cfg.test_command.clone() {
            checks.push(Box::new(CommandCheck { label: "test".to_string(), command, timeout }));
        }
    }
    if args.run_typecheck {
        if let Some(command) = gate_cfg.typecheck_command.clone() {
            checks.push(Box::new(CommandCheck { label: "typecheck".to_string(), command, timeout }));
        }
    }
    if args.run_lint {
        if let Some(command) = gate_cfg.lint_command.clone() {
            checks.push(Box::new(CommandCheck { label: "lint".to_string(), command, timeout }));
        }
    }

    CleanStateGate::new(checks)
}
