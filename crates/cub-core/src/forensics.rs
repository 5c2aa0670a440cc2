//! Hook forensics pipeline (spec §3.6, §4.10).
//!
//! No teacher precedent: the teacher has no notion of an assistant
//! lifecycle hook or a direct (non-loop) session, so this is built fresh
//! from the spec, following the file-store's atomic-append and
//! skip-malformed-lines idioms already established by
//! [`crate::task::file_store`] and [`crate::ledger`].

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Deserialize;

use crate::config::RUN_ACTIVE_ENV;
use crate::ledger::{Attempt, EntrySource, ForensicEvent, LedgerWriter, Lineage, Outcome, StateHistoryEntry, TaskSnapshot, TokenUsage};

/// Raw event envelope an external assistant's hook delivers on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct HookEnvelope {
    pub hook_event_name: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

const TRACKED_WRITE_PREFIXES: &[&str] = &["plans/", "specs/", "captures/"];

/// Classify a raw hook envelope into the closed forensic event set, or
/// `None` if the event carries nothing worth recording.
pub fn classify(envelope: &HookEnvelope) -> Option<ForensicEvent> {
    match envelope.hook_event_name.as_str() {
        "SessionStart" => Some(ForensicEvent::SessionStart {
            timestamp: envelope.timestamp,
            model: envelope.model.clone(),
            agent_type: envelope.agent_type.clone(),
        }),
        "SessionEnd" => Some(ForensicEvent::SessionEnd { timestamp: envelope.timestamp, reason: envelope.reason.clone() }),
        "PreToolUse" | "PostToolUse" => classify_tool_use(envelope),
        _ => None,
    }
}

fn classify_tool_use(envelope: &HookEnvelope) -> Option<ForensicEvent> {
    let tool = envelope.tool_name.as_deref()?;
    match tool {
        "Write" | "Edit" => {
            let path = envelope.tool_input.as_ref()?.get("file_path")?.as_str()?;
            let is_tracked = TRACKED_WRITE_PREFIXES.iter().any(|p| path.starts_with(p)) || !path.contains("/.cub/");
            if !is_tracked {
                return None;
            }
            Some(ForensicEvent::FileWrite { file_path: path.to_string(), tool: tool.to_string(), timestamp: envelope.timestamp })
        }
        "Bash" => {
            let command = envelope.tool_input.as_ref()?.get("command")?.as_str()?;
            classify_bash_command(command, envelope.timestamp)
        }
        _ => None,
    }
}

fn classify_bash_command(command: &str, timestamp: DateTime<Utc>) -> Option<ForensicEvent> {
    let trimmed = command.trim();
    if let Some(rest) = trimmed.strip_prefix("cub task claim") {
        let task_id = rest.split_whitespace().next()?.to_string();
        return Some(ForensicEvent::TaskClaim { task_id, timestamp });
    }
    if let Some(rest) = trimmed.strip_prefix("cub task close") {
        let mut parts = rest.split_whitespace();
        let task_id = parts.next()?.to_string();
        let reason = parts.collect::<Vec<_>>().join(" ");
        return Some(ForensicEvent::TaskClose { task_id, reason: if reason.is_empty() { None } else { Some(reason) }, timestamp });
    }
    if trimmed.starts_with("git commit") {
        return Some(ForensicEvent::GitCommit { hash: String::new(), message: String::new(), timestamp });
    }
    None
}

/// Appends normalised events to `{ledger_root}/forensics/{session_id}.jsonl`.
pub struct ForensicsWriter {
    ledger_root: PathBuf,
}

impl ForensicsWriter {
    pub fn new(ledger_root: impl Into<PathBuf>) -> Self {
        Self { ledger_root: ledger_root.into() }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.ledger_root.join("forensics").join(format!("{session_id}.jsonl"))
    }

    /// Append one event. No-op (per spec §4.10) when a parent loop
    /// session is active, signalled by `CUB_RUN_ACTIVE`.
    pub fn append(&self, session_id: &str, event: &ForensicEvent) -> Result<()> {
        if std::env::var(RUN_ACTIVE_ENV).is_ok() {
            return Ok(());
        }
        let path = self.path(session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening forensics file {}", path.display()))?;
        file.lock_exclusive().context("locking forensics file")?;
        let line = serde_json::to_string(event).context("serializing forensic event")?;
        let result = (|| {
            let mut file = &file;
            writeln!(file, "{line}")?;
            file.flush()
        })();
        let _ = FileExt::unlock(&file);
        result.with_context(|| format!("appending to {}", path.display()))
    }

    /// Handle a raw hook invocation end-to-end: classify, append if
    /// relevant, always succeed (hooks never block on classification
    /// misses per spec §4.10).
    pub fn handle_hook(&self, envelope: &HookEnvelope) -> Result<()> {
        if std::env::var(RUN_ACTIVE_ENV).is_ok() {
            return Ok(());
        }
        if let Some(event) = classify(envelope) {
            self.append(&envelope.session_id, &event)?;
        }
        Ok(())
    }
}

/// Outcome of one reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created { task_id: String },
    Skipped { reason: &'static str },
}

pub struct Reconciler {
    ledger_root: PathBuf,
    writer: LedgerWriter,
}

impl Reconciler {
    pub fn new(ledger_root: impl Into<PathBuf>) -> Self {
        let ledger_root = ledger_root.into();
        Self { writer: LedgerWriter::new(&ledger_root), ledger_root }
    }

    fn forensics_path(&self, session_id: &str) -> PathBuf {
        self.ledger_root.join("forensics").join(format!("{session_id}.jsonl"))
    }

    /// Read a forensics file, skipping malformed lines with a warning
    /// rather than aborting (spec §4.10 step 1).
    fn read_events(&self, session_id: &str) -> Result<Vec<ForensicEvent>> {
        let path = self.forensics_path(session_id);
        let file = File::open(&path).with_context(|| format!("opening forensics file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("reading forensics line {lineno}"))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ForensicEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(session_id, lineno, error = %e, "skipping malformed forensics line"),
            }
        }
        Ok(events)
    }

    /// Reconcile one session's forensics file into a ledger entry.
    pub fn reconcile(&self, session_id: &str, force: bool, task_snapshot_for: impl Fn(&str) -> Option<TaskSnapshot>) -> Result<ReconcileOutcome> {
        let events = self.read_events(session_id)?;

        let mut claims: Vec<(String, DateTime<Utc>)> = Vec::new();
        for event in &events {
            if let ForensicEvent::TaskClaim { task_id, timestamp } = event {
                claims.push((task_id.clone(), *timestamp));
            }
        }
        let Some((task_id, _)) = claims.last().cloned() else {
            return Ok(ReconcileOutcome::Skipped { reason: "no_task_association" });
        };

        let existing = self.writer.root().join("by-task").join(&task_id).join("entry.json");
        if existing.exists() && !force {
            return Ok(ReconcileOutcome::Skipped { reason: "entry_exists" });
        }

        let Some(snapshot) = task_snapshot_for(&task_id) else {
            return Ok(ReconcileOutcome::Skipped { reason: "task_not_found" });
        };

        let entry = self.writer.create_task_entry(&task_id, snapshot, Lineage::default(), EntrySource::DirectSession)?;

        if claims.len() > 1 {
            self.record_abandoned_claims(&task_id, &claims[..claims.len() - 1])?;
        }

        let started_at = events.iter().find_map(|e| match e {
            ForensicEvent::SessionStart { timestamp, .. } => Some(*timestamp),
            _ => None,
        }).unwrap_or_else(|| events.first().map(ForensicEvent::timestamp).unwrap_or_else(Utc::now));
        let completed_at = events.iter().rev().find_map(|e| match e {
            ForensicEvent::SessionEnd { timestamp, .. } => Some(*timestamp),
            _ => None,
        });

        let mut files_changed: BTreeSet<String> = BTreeSet::new();
        let mut commit_refs = Vec::new();
        let mut closed = false;
        for event in &events {
            match event {
                ForensicEvent::FileWrite { file_path, .. } => {
                    files_changed.insert(file_path.clone());
                }
                ForensicEvent::GitCommit { hash, .. } => {
                    if !hash.is_empty() {
                        commit_refs.push(hash.clone());
                    }
                }
                ForensicEvent::TaskClose { task_id: closed_id, .. } if closed_id == &task_id => {
                    closed = true;
                }
                _ => {}
            }
        }

        let duration_s = completed_at.map(|end| (end - started_at).num_milliseconds().max(0) as f64 / 1000.0).unwrap_or(0.0);

        self.writer.append_attempt(&task_id, Attempt {
            attempt_number: entry.next_attempt_number().max(1),
            run_id: session_id.to_string(),
            started_at,
            completed_at,
            harness: "direct_session".to_string(),
            model: "unknown".to_string(),
            success: closed,
            error_category: None,
            error_summary: None,
            tokens: TokenUsage::default(),
            cost_usd: None,
            duration_s,
        })?;

        self.writer.finalize_task_entry(&task_id, Outcome {
            success: closed,
            partial: !closed,
            completed_at: completed_at.unwrap_or(started_at),
            total_cost_usd: 0.0,
            total_attempts: 1,
            total_duration_s: duration_s,
            final_model: "unknown".to_string(),
            escalation_path: vec![],
            files_changed: files_changed.into_iter().collect(),
            commit_refs,
            approach: String::new(),
            key_decisions: vec![],
            lessons_learned: vec![],
        })?;

        if closed {
            self.writer.update_workflow_stage(&task_id, crate::ledger::WorkflowStage::DevComplete, "reconciler", "direct session closed the task", false)?;
        }

        Ok(ReconcileOutcome::Created { task_id })
    }

    fn record_abandoned_claims(&self, final_task_id: &str, abandoned: &[(String, DateTime<Utc>)]) -> Result<()> {
        for (abandoned_id, at) in abandoned {
            let entry_path = self.writer.root().join("by-task").join(final_task_id).join("entry.json");
            if !entry_path.exists() {
                continue;
            }
            let contents = fs::read_to_string(&entry_path)?;
            let mut entry: crate::ledger::LedgerEntry = serde_json::from_str(&contents)?;
            entry.state_history.push(StateHistoryEntry {
                stage: "claim_abandoned".to_string(),
                at: *at,
                by: "reconciler".to_string(),
                reason: format!("earlier claim recorded for {abandoned_id}"),
            });
            let tmp_path = entry_path.with_extension("json.tmp");
            fs::write(&tmp_path, serde_json::to_string_pretty(&entry)?)?;
            fs::rename(&tmp_path, &entry_path)?;
        }
        Ok(())
    }
}

fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<ForensicsWriter>();
    check::<Reconciler>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn snapshot() -> TaskSnapshot {
        let now = Utc::now();
        TaskSnapshot { title: "Add widget".to_string(), description: String::new(), task_type: TaskType::Task, priority: 2, labels: Default::default(), created_at: now, captured_at: now }
    }

    #[test]
    fn classify_write_under_plans_is_file_write() {
        let envelope = HookEnvelope {
            hook_event_name: "PostToolUse".to_string(),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            tool_name: Some("Write".to_string()),
            tool_input: Some(json!({"file_path": "plans/x.md"})),
            cwd: None,
            model: None,
            agent_type: None,
            reason: None,
        };
        assert!(matches!(classify(&envelope), Some(ForensicEvent::FileWrite { .. })));
    }

    #[test]
    fn classify_bash_claim_extracts_task_id() {
        let envelope = HookEnvelope {
            hook_event_name: "PostToolUse".to_string(),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            tool_name: Some("Bash".to_string()),
            tool_input: Some(json!({"command": "cub task claim proj-a-3"})),
            cwd: None,
            model: None,
            agent_type: None,
            reason: None,
        };
        match classify(&envelope) {
            Some(ForensicEvent::TaskClaim { task_id, .. }) => assert_eq!(task_id, "proj-a-3"),
            other => panic!("expected TaskClaim, got {other:?}"),
        }
    }

    #[test]
    fn classify_unrecognised_event_is_none() {
        let envelope = HookEnvelope {
            hook_event_name: "Notification".to_string(),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            tool_name: None,
            tool_input: None,
            cwd: None,
            model: None,
            agent_type: None,
            reason: None,
        };
        assert!(classify(&envelope).is_none());
    }

    #[test]
    fn writer_skips_append_when_run_active() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let writer = ForensicsWriter::new(tmp.path());
        unsafe { std::env::set_var(RUN_ACTIVE_ENV, "1") };
        writer.append("s1", &ForensicEvent::SessionStart { timestamp: Utc::now(), model: None, agent_type: None }).unwrap();
        unsafe { std::env::remove_var(RUN_ACTIVE_ENV) };
        assert!(!tmp.path().join("forensics/s1.jsonl").exists());
    }

    #[test]
    fn reconcile_skips_without_claim() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let writer = ForensicsWriter::new(tmp.path());
        writer.append("s1", &ForensicEvent::SessionStart { timestamp: Utc::now(), model: None, agent_type: None }).unwrap();

        let reconciler = Reconciler::new(tmp.path());
        let outcome = reconciler.reconcile("s1", false, |_| Some(snapshot())).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped { reason: "no_task_association" });
    }

    #[test]
    fn reconcile_scenario_f_happy_path() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let writer = ForensicsWriter::new(tmp.path());
        let now = Utc::now();
        writer.append("s1", &ForensicEvent::SessionStart { timestamp: now, model: None, agent_type: None }).unwrap();
        writer.append("s1", &ForensicEvent::FileWrite { file_path: "plans/x.md".to_string(), tool: "Write".to_string(), timestamp: now }).unwrap();
        writer.append("s1", &ForensicEvent::TaskClaim { task_id: "proj-a-3".to_string(), timestamp: now }).unwrap();
        writer.append("s1", &ForensicEvent::FileWrite { file_path: "src/y.rs".to_string(), tool: "Write".to_string(), timestamp: now }).unwrap();
        writer.append("s1", &ForensicEvent::GitCommit { hash: "abc123".to_string(), message: String::new(), timestamp: now }).unwrap();
        writer.append("s1", &ForensicEvent::TaskClose { task_id: "proj-a-3".to_string(), reason: None, timestamp: now }).unwrap();
        writer.append("s1", &ForensicEvent::SessionEnd { timestamp: now, reason: None }).unwrap();

        let reconciler = Reconciler::new(tmp.path());
        let outcome = reconciler.reconcile("s1", false, |_| Some(snapshot())).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created { task_id: "proj-a-3".to_string() });

        let reader = crate::ledger::LedgerReader::open(tmp.path()).unwrap();
        let entry = reader.get("proj-a-3").unwrap().unwrap();
        assert_eq!(entry.attempts.len(), 1);
        assert_eq!(entry.attempts[0].harness, "direct_session");
        assert!(entry.outcome.as_ref().unwrap().success);
        assert_eq!(entry.outcome.as_ref().unwrap().files_changed.len(), 2);
        assert_eq!(entry.outcome.as_ref().unwrap().commit_refs, vec!["abc123".to_string()]);
        assert_eq!(entry.workflow_stage, Some(crate::ledger::WorkflowStage::DevComplete));

        let second = reconciler.reconcile("s1", false, |_| Some(snapshot())).unwrap();
        assert_eq!(second, ReconcileOutcome::Skipped { reason: "entry_exists" });
    }

    #[test]
    fn reconcile_records_abandoned_claims() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let writer = ForensicsWriter::new(tmp.path());
        let now = Utc::now();
        writer.append("s1", &ForensicEvent::TaskClaim { task_id: "proj-a-1".to_string(), timestamp: now }).unwrap();
        writer.append("s1", &ForensicEvent::TaskClaim { task_id: "proj-a-2".to_string(), timestamp: now }).unwrap();

        let reconciler = Reconciler::new(tmp.path());
        let outcome = reconciler.reconcile("s1", false, |_| Some(snapshot())).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created { task_id: "proj-a-2".to_string() });

        let reader = crate::ledger::LedgerReader::open(tmp.path()).unwrap();
        let entry = reader.get("proj-a-2").unwrap().unwrap();
        assert!(entry.state_history.iter().any(|h| h.stage == "claim_abandoned"));
    }
}
