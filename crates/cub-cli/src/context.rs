//! Shared setup for every command: resolve project configuration, then
//! build the task backend, ledger writer, and harness registry every
//! subcommand needs. Mirrors the teacher's `GatorConfig::resolve` +
//! `pool::create_pool` pairing used at the top of every `main.rs` match
//! arm, generalized from "one DB connection" to "the small set of file
//! stores a Cub command touches."

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use cub_core::config::CubConfig;
use cub_core::harness::{ClaudeHarness, Harness, HarnessRegistry};
use cub_core::ledger::LedgerWriter;
use cub_core::task::file_store::FileTaskBackend;
use cub_core::task::TaskBackend;

pub struct Context {
    pub config: CubConfig,
    pub task_backend: Arc<dyn TaskBackend>,
    pub ledger: Arc<LedgerWriter>,
    pub harnesses: HarnessRegistry,
}

impl Context {
    pub fn resolve(project_dir: Option<PathBuf>) -> Result<Self> {
        let config = CubConfig::resolve(project_dir.as_deref())?;
        let task_backend: Arc<dyn TaskBackend> =
            Arc::new(FileTaskBackend::new(config.tasks_path()));
        let ledger = Arc::new(LedgerWriter::new(config.ledger_root()));

        let mut harnesses = HarnessRegistry::new();
        harnesses.register(ClaudeHarness::new());

        Ok(Self { config, task_backend, ledger, harnesses })
    }

    /// Resolve the harness to drive a run with: explicit `--harness` flag,
    /// else the project config's default, else whichever single harness
    /// is registered.
    pub fn resolve_harness(&self, explicit: Option<&str>) -> Result<Arc<dyn Harness>> {
        let name = explicit
            .map(str::to_string)
            .or_else(|| self.config.file.harness.default.clone());

        let harness = match name {
            Some(name) => self
                .harnesses
                .get(&name)
                .ok_or_else(|| anyhow::anyhow!("no such harness: {name}"))?,
            None => {
                let names = self.harnesses.list();
                let only = names
                    .first()
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("no harness registered"))?;
                self.harnesses.get(only).expect("name just came from list()")
            }
        };
        Ok(clone_harness(harness))
    }
}

/// `HarnessRegistry::get` hands back a `&dyn Harness`; callers need an
/// owned, cheaply-cloneable handle to carry into `RunDeps`. `ClaudeHarness`
/// is `Clone`, so reconstruct a fresh boxed instance by name rather than
/// threading lifetimes through the CLI's command dispatch.
fn clone_harness(harness: &dyn Harness) -> Arc<dyn Harness> {
    match harness.name() {
        "claude" => Arc::new(ClaudeHarness::new()),
        other => panic!("no constructor registered for harness {other:?}"),
    }
}
