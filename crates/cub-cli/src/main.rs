mod context;
mod hook_cmd;
mod init_cmd;
mod ledger_cmds;
mod reconcile_cmd;
mod run_cmd;
mod task_cmds;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use context::Context;
use ledger_cmds::LedgerCommands;
use run_cmd::RunArgs;
use task_cmds::TaskCommands;

#[derive(Parser)]
#[command(name = "cub", about = "Autonomous coding orchestrator")]
struct Cli {
    /// Project root (defaults to CUB_PROJECT_DIR, then the nearest .cub/.git ancestor).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the task loop (or list ready tasks with --ready).
    Run(RunArgs),
    /// Task backend operations.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Ledger read/maintenance operations.
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Read a hook envelope from stdin and record its forensic event.
    Hook { event_name: String },
    /// Fold a direct session's forensics log into the ledger.
    Reconcile {
        session_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Write the project's `.cub/config.toml`.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print a shell completion script.
    Completions { shell: clap_complete::Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    let result = dispatch(cli).await;
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => {
            let ctx = Context::resolve(cli.project_dir)?;
            run_cmd::run(ctx, args).await
        }
        Commands::Task { command } => {
            let ctx = Context::resolve(cli.project_dir)?;
            task_cmds::run(ctx, command).await?;
            Ok(0)
        }
        Commands::Ledger { command } => {
            let ctx = Context::resolve(cli.project_dir)?;
            ledger_cmds::run(ctx.config.ledger_root(), command)?;
            Ok(0)
        }
        Commands::Hook { event_name } => {
            let ctx = Context::resolve(cli.project_dir)?;
            hook_cmd::run(ctx.config.ledger_root(), &event_name)?;
            Ok(0)
        }
        Commands::Reconcile { session_id, force } => {
            let ctx = Context::resolve(cli.project_dir)?;
            reconcile_cmd::run(ctx.config.ledger_root(), ctx.task_backend, &session_id, force).await?;
            Ok(0)
        }
        Commands::Init { force } => {
            let project_dir = cub_core::config::CubConfig::resolve_project_dir(cli.project_dir.as_deref())?;
            init_cmd::run(&project_dir, force)?;
            Ok(0)
        }
        Commands::Completions { .. } => unreachable!("handled before dispatch"),
    }
}
