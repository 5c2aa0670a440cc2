//! Run-loop scenarios that exercise the public `runloop::run` entry point
//! directly (the in-module tests in `runloop::mod` cover the rest via the
//! same `ScriptedHarness`-style doubles; this file covers the explicit
//! `--task` selection path end to end).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use cub_core::config::CubConfig;
use cub_core::gate::CleanStateGate;
use cub_core::harness::{Harness, InvokeRequest, InvokeResult};
use cub_core::ledger::LedgerWriter;
use cub_core::runloop::{self, RunConfig, RunDeps};
use cub_core::task::file_store::FileTaskBackend;
use cub_core::task::{NewTask, TaskBackend, TaskStatus, TaskType};

struct OneShotHarness {
    calls: AtomicUsize,
    backend: Arc<dyn TaskBackend>,
}

#[async_trait]
impl Harness for OneShotHarness {
    fn name(&self) -> &str {
        "oneshot"
    }
    async fn is_available(&self) -> bool {
        true
    }
    fn default_model(&self) -> &str {
        "test-model"
    }
    async fn invoke(&self, request: InvokeRequest) -> anyhow::Result<InvokeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let task_id = request.task_prompt.split_whitespace().nth(3).unwrap_or_default().trim_end_matches(':');
        let _ = self.backend.close(task_id, "done").await;
        Ok(InvokeResult {
            success: true,
            exit_code: Some(0),
            tokens_in: Some(1),
            tokens_out: Some(1),
            cache_read: None,
            cache_write: None,
            cost_usd: Some(0.0),
            duration_s: 0.01,
            captured_output: std::path::PathBuf::from("/dev/null"),
            error_category: None,
            error_summary: None,
        })
    }
}

async fn deps_for(tmp: &TempDir, backend: Arc<dyn TaskBackend>, harness: Arc<dyn Harness>) -> RunDeps {
    let config = CubConfig::resolve(Some(tmp.path())).unwrap();
    let ledger = Arc::new(LedgerWriter::new(config.ledger_root()));
    RunDeps { config, task_backend: backend, harness, ledger, gate: CleanStateGate::new(vec![]) }
}

#[tokio::test]
async fn explicit_task_not_found_fails_with_exit_code_one() {
    let tmp = TempDir::new().unwrap();
    let config = CubConfig::resolve(Some(tmp.path())).unwrap();
    let backend: Arc<dyn TaskBackend> = Arc::new(FileTaskBackend::new(config.tasks_path()));
    let harness: Arc<dyn Harness> = Arc::new(OneShotHarness { calls: AtomicUsize::new(0), backend: backend.clone() });
    let deps = deps_for(&tmp, backend, harness).await;

    let run_config = RunConfig { task_filter: Some("proj-a-missing".to_string()), ..Default::default() };
    let (artifact, exit_code) = runloop::run("run-1".to_string(), run_config, deps).await.unwrap();

    assert_eq!(exit_code, 1);
    assert_eq!(artifact.phase, "failed");
    assert_eq!(artifact.reason.as_deref(), Some("task_not_found"));
}

#[tokio::test]
async fn explicit_task_already_closed_completes_without_invoking_harness() {
    let tmp = TempDir::new().unwrap();
    let config = CubConfig::resolve(Some(tmp.path())).unwrap();
    let backend: Arc<dyn TaskBackend> = Arc::new(FileTaskBackend::new(config.tasks_path()));
    backend
        .create(NewTask {
            id: "proj-a-1".to_string(),
            title: "Already done".to_string(),
            description: String::new(),
            task_type: TaskType::Task,
            priority: 2,
            parent: None,
            depends_on: BTreeSet::new(),
            labels: BTreeSet::new(),
        })
        .await
        .unwrap();
    backend.claim("proj-a-1", "s1").await.unwrap();
    backend.close("proj-a-1", "done earlier").await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    struct CountingHarness {
        calls: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl Harness for CountingHarness {
        fn name(&self) -> &str {
            "counting"
        }
        async fn is_available(&self) -> bool {
            true
        }
        fn default_model(&self) -> &str {
            "test-model"
        }
        async fn invoke(&self, _request: InvokeRequest) -> anyhow::Result<InvokeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            unreachable!("an already-closed explicit task must never reach the harness");
        }
    }
    let harness: Arc<dyn Harness> = Arc::new(CountingHarness { calls: calls.clone() });
    let deps = deps_for(&tmp, backend.clone(), harness).await;

    let run_config = RunConfig { task_filter: Some("proj-a-1".to_string()), ..Default::default() };
    let (artifact, exit_code) = runloop::run("run-1".to_string(), run_config, deps).await.unwrap();

    assert_eq!(exit_code, 0);
    assert_eq!(artifact.reason.as_deref(), Some("task_closed"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let task = backend.get("proj-a-1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Closed);
}
