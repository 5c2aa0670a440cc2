//! `cub ledger ...`: read-only lookups via [`cub_core::ledger::LedgerReader`],
//! plus `verify [--fix]` for index maintenance.

use anyhow::{Context, Result};
use clap::Subcommand;

use cub_core::ledger::{index, LedgerEntry, LedgerReader, LedgerWriter};

#[derive(Subcommand, Debug)]
pub enum LedgerCommands {
    Get { task_id: String },
    Stats,
    Search { query: String },
    ByEpic { epic_id: String },
    ByRun { run_id: String },
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Check the ledger index against the on-disk entries.
    Verify {
        /// Rebuild the index instead of only reporting its state.
        #[arg(long)]
        fix: bool,
    },
}

pub fn run(ledger_root: std::path::PathBuf, command: LedgerCommands) -> Result<()> {
    match command {
        LedgerCommands::Verify { fix } => {
            let valid = index::index_is_valid(&ledger_root);
            if valid {
                println!("index ok");
                return Ok(());
            }
            println!("index invalid or missing");
            if fix {
                LedgerWriter::new(&ledger_root).rebuild_index().context("rebuilding ledger index")?;
                println!("index rebuilt");
            } else {
                println!("re-run with --fix to rebuild");
            }
            Ok(())
        }
        other => {
            let reader = LedgerReader::open(&ledger_root).context("opening ledger")?;
            match other {
                LedgerCommands::Get { task_id } => print_opt(reader.get(&task_id).context("fetching ledger entry")?),
                LedgerCommands::Stats => {
                    let stats = reader.stats().context("computing ledger stats")?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                LedgerCommands::Search { query } => print_entries(reader.search(&query).context("searching ledger")?),
                LedgerCommands::ByEpic { epic_id } => print_entries(reader.by_epic(&epic_id).context("listing ledger entries by epic")?),
                LedgerCommands::ByRun { run_id } => print_entries(reader.by_run(&run_id).context("listing ledger entries by run")?),
                LedgerCommands::Recent { limit } => print_entries(reader.recent(limit).context("listing recent ledger entries")?),
                LedgerCommands::Verify { .. } => unreachable!("handled above"),
            }
            Ok(())
        }
    }
}

fn print_opt(entry: Option<LedgerEntry>) {
    match entry {
        Some(entry) => println!("{}", serde_json::to_string_pretty(&entry).unwrap()),
        None => println!("not found"),
    }
}

fn print_entries(entries: Vec<LedgerEntry>) {
    for entry in entries {
        println!("{}\t{}", entry.id, entry.workflow_stage.map(|s| s.to_string()).unwrap_or_default());
    }
}
