//! `cub reconcile <session-id>`: fold a direct session's forensics log
//! into the ledger when the loop never ran (spec §4.10).

use anyhow::{Context, Result};

use cub_core::forensics::Reconciler;
use cub_core::ledger::TaskSnapshot;
use cub_core::task::TaskBackend;

pub async fn run(ledger_root: std::path::PathBuf, task_backend: std::sync::Arc<dyn TaskBackend>, session_id: &str, force: bool) -> Result<()> {
    let reconciler = Reconciler::new(ledger_root);

    // `Reconciler::reconcile`'s lookup closure is synchronous; the task
    // backend isn't, so bridge with `futures::executor::block_on` rather
    // than threading a runtime handle through.
    let outcome = reconciler
        .reconcile(session_id, force, |task_id| {
            futures::executor::block_on(task_backend.get(task_id)).ok().map(task_snapshot)
        })
        .context("reconciling session")?;

    println!("{outcome:?}");
    Ok(())
}

fn task_snapshot(task: cub_core::task::Task) -> TaskSnapshot {
    TaskSnapshot {
        title: task.title,
        description: task.description,
        task_type: task.task_type,
        priority: task.priority,
        labels: task.labels,
        created_at: task.created_at,
        captured_at: chrono::Utc::now(),
    }
}
