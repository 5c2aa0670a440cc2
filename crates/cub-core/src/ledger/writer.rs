//! Ledger writer (spec §4.8).
//!
//! Mirrors [`crate::task::file_store::FileTaskBackend`]'s locking and
//! atomicity idiom -- one advisory exclusive lock (here covering the whole
//! ledger root, since writes touch both a task entry and the index
//! together) plus temp-file + rename per written file.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fs2::FileExt;

use super::index::{load_index, save_index};
use super::model::{
    Attempt, EpicAggregates, EpicEntry, EpicSnapshot, IndexRecord, LedgerEntry, Lineage, Outcome,
    StateHistoryEntry, TaskSnapshot, WorkflowStage,
};

/// Layout and mutation operations for `{project}/.cub/ledger`.
pub struct LedgerWriter {
    root: PathBuf,
}

impl LedgerWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(".writer.lock")
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("by-task").join(task_id)
    }

    fn task_entry_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("entry.json")
    }

    fn attempts_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("attempts")
    }

    fn epic_dir(&self, epic_id: &str) -> PathBuf {
        self.root.join("by-epic").join(epic_id)
    }

    fn epic_entry_path(&self, epic_id: &str) -> PathBuf {
        self.epic_dir(epic_id).join("entry.json")
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("by-run").join(run_id)
    }

    pub fn forensics_path(&self, session_id: &str) -> PathBuf {
        self.root.join("forensics").join(format!("{session_id}.jsonl"))
    }

    /// Acquire the whole-ledger exclusive lock for the duration of `f`.
    fn with_lock<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating ledger root {}", self.root.display()))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .context("opening ledger lock file")?;
        lock_file.lock_exclusive().context("acquiring ledger lock")?;
        let result = f();
        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn read_task_entry(&self, task_id: &str) -> Result<Option<LedgerEntry>> {
        let path = self.task_entry_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading ledger entry at {}", path.display()))?;
        let entry: LedgerEntry = serde_json::from_str(&contents)
            .with_context(|| format!("parsing ledger entry at {}", path.display()))?;
        Ok(Some(entry))
    }

    fn write_task_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let dir = self.task_dir(&entry.id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = self.task_entry_path(&entry.id);
        let tmp_path = dir.join("entry.json.tmp");
        let contents = serde_json::to_string_pretty(entry).context("serializing ledger entry")?;
        fs::write(&tmp_path, contents).with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    fn read_epic_entry(&self, epic_id: &str) -> Result<Option<EpicEntry>> {
        let path = self.epic_entry_path(epic_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading epic entry at {}", path.display()))?;
        Ok(Some(serde_json::from_str(&contents).with_context(|| {
            format!("parsing epic entry at {}", path.display())
        })?))
    }

    fn write_epic_entry(&self, entry: &EpicEntry) -> Result<()> {
        let dir = self.epic_dir(&entry.id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = self.epic_entry_path(&entry.id);
        let tmp_path = dir.join("entry.json.tmp");
        let contents = serde_json::to_string_pretty(entry).context("serializing epic entry")?;
        fs::write(&tmp_path, contents).with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    fn index_record_for_task(entry: &LedgerEntry) -> IndexRecord {
        let run_ids = entry.attempts.iter().map(|a| a.run_id.clone()).collect();
        IndexRecord {
            id: entry.id.clone(),
            parent_epic_id: entry.lineage.parent_epic_id.clone(),
            is_epic: false,
            workflow_stage: entry.workflow_stage,
            success: entry.outcome.as_ref().map(|o| o.success),
            updated_at: entry
                .attempts
                .last()
                .map(|a| a.completed_at.unwrap_or(a.started_at))
                .unwrap_or(entry.task.captured_at),
            run_ids,
        }
    }

    fn index_record_for_epic(entry: &EpicEntry) -> IndexRecord {
        IndexRecord {
            id: entry.id.clone(),
            parent_epic_id: entry.lineage.parent_epic_id.clone(),
            is_epic: true,
            workflow_stage: entry.workflow_stage,
            success: None,
            updated_at: Utc::now(),
            run_ids: BTreeSet::new(),
        }
    }

    fn upsert_index_record(&self, record: IndexRecord) -> Result<()> {
        let mut records = load_index(&self.root)?;
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            records.push(record);
        }
        save_index(&self.root, &records)
    }

    /// Create a new task entry, or return the existing one unchanged
    /// (idempotent -- calling this twice for the same task id is safe).
    pub fn create_task_entry(
        &self,
        task_id: &str,
        task: TaskSnapshot,
        lineage: Lineage,
        source: super::model::EntrySource,
    ) -> Result<LedgerEntry> {
        self.with_lock(|| {
            if let Some(existing) = self.read_task_entry(task_id)? {
                return Ok(existing);
            }
            let entry = LedgerEntry::new(task_id.to_string(), task, lineage, source);
            self.write_task_entry(&entry)?;
            self.upsert_index_record(Self::index_record_for_task(&entry))?;
            Ok(entry)
        })
    }

    /// Append one attempt, in order, to a task's entry.
    pub fn append_attempt(&self, task_id: &str, attempt: Attempt) -> Result<LedgerEntry> {
        self.with_lock(|| {
            let Some(mut entry) = self.read_task_entry(task_id)? else {
                bail!("no ledger entry for task {task_id}; call create_task_entry first");
            };
            entry.attempts.push(attempt);
            self.write_task_entry(&entry)?;
            self.upsert_index_record(Self::index_record_for_task(&entry))?;
            Ok(entry)
        })
    }

    /// Write an attempt's composed prompt as YAML-frontmatter markdown,
    /// `by-task/{id}/attempts/NNN-prompt.md`.
    pub fn write_prompt_file(
        &self,
        task_id: &str,
        attempt_number: u32,
        run_id: &str,
        system_prompt: &str,
        task_prompt: &str,
    ) -> Result<PathBuf> {
        #[derive(serde::Serialize)]
        struct Frontmatter<'a> {
            attempt_number: u32,
            run_id: &'a str,
        }
        let dir = self.attempts_dir(task_id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{attempt_number:03}-prompt.md"));
        let frontmatter = serde_yaml::to_string(&Frontmatter { attempt_number, run_id })
            .context("serializing prompt frontmatter")?;
        let contents = format!(
            "---\n{frontmatter}---\n\n# System prompt\n\n{system_prompt}\n\n# Task prompt\n\n{task_prompt}\n"
        );
        fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Write an attempt's raw harness transcript, `attempts/NNN-harness.log`.
    pub fn write_harness_log(&self, task_id: &str, attempt_number: u32, content: &str) -> Result<PathBuf> {
        let dir = self.attempts_dir(task_id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{attempt_number:03}-harness.log"));
        fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Record the task's final outcome, closing out its ledger entry.
    pub fn finalize_task_entry(&self, task_id: &str, outcome: Outcome) -> Result<LedgerEntry> {
        self.with_lock(|| {
            let Some(mut entry) = self.read_task_entry(task_id)? else {
                bail!("no ledger entry for task {task_id}; call create_task_entry first");
            };
            entry.outcome = Some(outcome);
            self.write_task_entry(&entry)?;
            self.upsert_index_record(Self::index_record_for_task(&entry))?;
            Ok(entry)
        })
    }

    /// Record drift between task snapshot and delivered outcome.
    pub fn record_drift(&self, task_id: &str, drift: super::model::Drift) -> Result<LedgerEntry> {
        self.with_lock(|| {
            let Some(mut entry) = self.read_task_entry(task_id)? else {
                bail!("no ledger entry for task {task_id}; call create_task_entry first");
            };
            entry.drift = drift;
            self.write_task_entry(&entry)?;
            Ok(entry)
        })
    }

    /// Record a verification run's result.
    pub fn record_verification(&self, task_id: &str, verification: super::model::Verification) -> Result<LedgerEntry> {
        self.with_lock(|| {
            let Some(mut entry) = self.read_task_entry(task_id)? else {
                bail!("no ledger entry for task {task_id}; call create_task_entry first");
            };
            entry.verification = verification;
            self.write_task_entry(&entry)?;
            Ok(entry)
        })
    }

    /// Advance a task's workflow stage. Forward transitions are always
    /// free; `released -> dev_complete` is refused unless `force` is set
    /// (spec §3.3: releases should not quietly regress).
    pub fn update_workflow_stage(
        &self,
        task_id: &str,
        new_stage: WorkflowStage,
        by: &str,
        reason: &str,
        force: bool,
    ) -> Result<LedgerEntry> {
        self.with_lock(|| {
            let Some(mut entry) = self.read_task_entry(task_id)? else {
                bail!("no ledger entry for task {task_id}; call create_task_entry first");
            };
            if entry.workflow_stage == Some(WorkflowStage::Released)
                && new_stage == WorkflowStage::DevComplete
                && !force
            {
                bail!("refusing to move task {task_id} from released back to dev_complete without force");
            }
            entry.workflow_stage = Some(new_stage);
            entry.state_history.push(StateHistoryEntry {
                stage: new_stage.to_string(),
                at: Utc::now(),
                by: by.to_string(),
                reason: reason.to_string(),
            });
            self.write_task_entry(&entry)?;
            self.upsert_index_record(Self::index_record_for_task(&entry))?;
            Ok(entry)
        })
    }

    /// Create or update an epic entry's static fields and task membership.
    pub fn upsert_epic(
        &self,
        epic_id: &str,
        snapshot: EpicSnapshot,
        lineage: Lineage,
        task_ids: BTreeSet<String>,
    ) -> Result<EpicEntry> {
        self.with_lock(|| {
            let mut entry = self.read_epic_entry(epic_id)?.unwrap_or_else(|| EpicEntry {
                id: epic_id.to_string(),
                lineage: lineage.clone(),
                epic: snapshot.clone(),
                task_ids: BTreeSet::new(),
                aggregates: EpicAggregates::default(),
                workflow_stage: None,
                state_history: Vec::new(),
            });
            entry.epic = snapshot;
            entry.lineage = lineage;
            entry.task_ids.extend(task_ids);
            self.write_epic_entry(&entry)?;
            self.upsert_index_record(Self::index_record_for_epic(&entry))?;
            Ok(entry)
        })
    }

    /// Recompute an epic's cost/token/completion aggregates from its
    /// member tasks' ledger entries. Aggregates are always derived, never
    /// hand-edited, so this is safe to call as often as needed.
    pub fn recompute_epic_aggregates(&self, epic_id: &str) -> Result<EpicEntry> {
        self.with_lock(|| {
            let Some(mut entry) = self.read_epic_entry(epic_id)? else {
                bail!("no epic entry for {epic_id}; call upsert_epic first");
            };
            let mut aggregates = EpicAggregates { total_tasks: entry.task_ids.len() as u64, ..Default::default() };
            let mut completed_cost = 0.0;
            for task_id in &entry.task_ids {
                let Some(task_entry) = self.read_task_entry(task_id)? else { continue };
                aggregates.total_attempts += task_entry.attempts.len() as u64;
                for attempt in &task_entry.attempts {
                    aggregates.total_cost_usd += attempt.cost_usd.unwrap_or(0.0);
                    aggregates.total_tokens_in += attempt.tokens.input.unwrap_or(0);
                    aggregates.total_tokens_out += attempt.tokens.output.unwrap_or(0);
                }
                match &task_entry.outcome {
                    Some(outcome) if outcome.success => {
                        aggregates.tasks_completed += 1;
                        completed_cost += task_entry.attempts.iter().map(|a| a.cost_usd.unwrap_or(0.0)).sum::<f64>();
                        if outcome.escalation_path.len() > 1 {
                            aggregates.escalation_rate += 1.0;
                        }
                    }
                    None => aggregates.tasks_in_progress += 1,
                    _ => {}
                }
            }
            if aggregates.tasks_completed > 0 {
                aggregates.avg_cost_per_task = completed_cost / aggregates.tasks_completed as f64;
                aggregates.escalation_rate /= aggregates.tasks_completed as f64;
            }
            entry.aggregates = aggregates;
            self.write_epic_entry(&entry)?;
            Ok(entry)
        })
    }

    /// Record that `run_id` touched `task_id`, for `by-run` lookups.
    pub fn record_run_touch(&self, run_id: &str, task_id: &str) -> Result<()> {
        self.with_lock(|| {
            let dir = self.run_dir(run_id);
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            let path = dir.join("tasks");
            let mut ids: BTreeSet<String> = if path.exists() {
                fs::read_to_string(&path)?.lines().map(str::to_string).collect()
            } else {
                BTreeSet::new()
            };
            ids.insert(task_id.to_string());
            let tmp_path = dir.join("tasks.tmp");
            fs::write(&tmp_path, ids.into_iter().collect::<Vec<_>>().join("\n"))?;
            fs::rename(&tmp_path, &path)?;
            Ok(())
        })
    }

    /// Rebuild the index from scratch by scanning `by-task`/`by-epic`.
    /// The index is a derived cache: this is always safe and is how a
    /// missing or corrupt index recovers (spec §4.9).
    pub fn rebuild_index(&self) -> Result<()> {
        self.with_lock(|| {
            let mut records = Vec::new();
            let by_task = self.root.join("by-task");
            if by_task.is_dir() {
                for entry in fs::read_dir(&by_task).context("scanning by-task")? {
                    let entry = entry.context("reading by-task entry")?;
                    if let Some(task_id) = entry.file_name().to_str() {
                        if let Some(ledger_entry) = self.read_task_entry(task_id)? {
                            records.push(Self::index_record_for_task(&ledger_entry));
                        }
                    }
                }
            }
            let by_epic = self.root.join("by-epic");
            if by_epic.is_dir() {
                for entry in fs::read_dir(&by_epic).context("scanning by-epic")? {
                    let entry = entry.context("reading by-epic entry")?;
                    if let Some(epic_id) = entry.file_name().to_str() {
                        if let Some(epic_entry) = self.read_epic_entry(epic_id)? {
                            records.push(Self::index_record_for_epic(&epic_entry));
                        }
                    }
                }
            }
            save_index(&self.root, &records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::model::{EntrySource, TokenUsage};
    use std::collections::BTreeSet as BTS;
    use tempfile::TempDir;

    fn snapshot() -> TaskSnapshot {
        let now = Utc::now();
        TaskSnapshot {
            title: "Add widget".to_string(),
            description: String::new(),
            task_type: crate::task::TaskType::Task,
            priority: 2,
            labels: BTS::new(),
            created_at: now,
            captured_at: now,
        }
    }

    fn attempt(n: u32, success: bool) -> Attempt {
        let now = Utc::now();
        Attempt {
            attempt_number: n,
            run_id: "run-1".to_string(),
            started_at: now,
            completed_at: Some(now),
            harness: "claude".to_string(),
            model: "claude-sonnet".to_string(),
            success,
            error_category: None,
            error_summary: None,
            tokens: TokenUsage { input: Some(100), output: Some(50), cache_read: None, cache_write: None },
            cost_usd: Some(0.5),
            duration_s: 3.0,
        }
    }

    #[test]
    fn create_task_entry_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        let a = writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        let b = writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.attempts.is_empty());
    }

    #[test]
    fn append_attempt_requires_existing_entry() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        assert!(writer.append_attempt("proj-a-1", attempt(1, true)).is_err());
    }

    #[test]
    fn append_attempt_accumulates_in_order() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        writer.append_attempt("proj-a-1", attempt(1, false)).unwrap();
        let entry = writer.append_attempt("proj-a-1", attempt(2, true)).unwrap();
        assert_eq!(entry.attempts.len(), 2);
        assert_eq!(entry.attempts[1].attempt_number, 2);
    }

    #[test]
    fn finalize_sets_outcome_and_updates_index() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        writer.append_attempt("proj-a-1", attempt(1, true)).unwrap();
        let outcome = Outcome {
            success: true,
            partial: false,
            completed_at: Utc::now(),
            total_cost_usd: 0.5,
            total_attempts: 1,
            total_duration_s: 3.0,
            final_model: "claude-sonnet".to_string(),
            escalation_path: vec!["claude-sonnet".to_string()],
            files_changed: vec![],
            commit_refs: vec![],
            approach: String::new(),
            key_decisions: vec![],
            lessons_learned: vec![],
        };
        writer.finalize_task_entry("proj-a-1", outcome).unwrap();

        let records = load_index(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].success, Some(true));
    }

    #[test]
    fn workflow_stage_refuses_released_regression_without_force() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        writer.update_workflow_stage("proj-a-1", WorkflowStage::Released, "tester", "shipped", false).unwrap();
        let err = writer.update_workflow_stage("proj-a-1", WorkflowStage::DevComplete, "tester", "oops", false);
        assert!(err.is_err());
        writer.update_workflow_stage("proj-a-1", WorkflowStage::DevComplete, "tester", "override", true).unwrap();
    }

    #[test]
    fn epic_aggregates_sum_member_tasks() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        writer.append_attempt("proj-a-1", attempt(1, true)).unwrap();
        writer
            .finalize_task_entry(
                "proj-a-1",
                Outcome {
                    success: true,
                    partial: false,
                    completed_at: Utc::now(),
                    total_cost_usd: 0.5,
                    total_attempts: 1,
                    total_duration_s: 3.0,
                    final_model: "claude-sonnet".to_string(),
                    escalation_path: vec!["claude-sonnet".to_string()],
                    files_changed: vec![],
                    commit_refs: vec![],
                    approach: String::new(),
                    key_decisions: vec![],
                    lessons_learned: vec![],
                },
            )
            .unwrap();

        let mut task_ids = BTS::new();
        task_ids.insert("proj-a-1".to_string());
        writer
            .upsert_epic(
                "proj-a-epic-1",
                EpicSnapshot { title: "Widgets".to_string(), description: String::new(), created_at: Utc::now() },
                Lineage::default(),
                task_ids,
            )
            .unwrap();
        let epic = writer.recompute_epic_aggregates("proj-a-epic-1").unwrap();
        assert_eq!(epic.aggregates.tasks_completed, 1);
        assert_eq!(epic.aggregates.total_cost_usd, 0.5);
        assert_eq!(epic.aggregates.total_tokens_in, 100);
    }

    #[test]
    fn rebuild_index_recovers_from_missing_index() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        fs::remove_file(super::super::index::index_path(tmp.path())).unwrap();
        writer.rebuild_index().unwrap();
        let records = load_index(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn write_prompt_file_embeds_frontmatter() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot(), Lineage::default(), EntrySource::Loop).unwrap();
        let path = writer.write_prompt_file("proj-a-1", 1, "run-1", "system", "task").unwrap();
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.starts_with("---\n"));
        assert!(contents.contains("run_id: run-1"));
        assert!(contents.contains("# System prompt\n\nsystem"));
    }
}
