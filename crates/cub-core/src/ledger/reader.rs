//! Ledger reader (spec §4.9).
//!
//! Read-only lookups go through the index when they scan many entries
//! (`search`, `by_epic`, `by_run`, `recent`) and straight to the per-task
//! file for single-entry fetches (`get`). The index is validated on open
//! and rebuilt automatically if missing or corrupt.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::index::{index_is_valid, load_index};
use super::model::{IndexRecord, LedgerEntry, WorkflowStage};
use super::writer::LedgerWriter;

pub struct LedgerReader {
    root: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub total_tasks: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_pending: u64,
    pub total_epics: u64,
    pub workflow_counts: std::collections::BTreeMap<String, u64>,
}

impl LedgerReader {
    /// Open the reader, validating (and if necessary rebuilding) the index.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = root.into();
        if !index_is_valid(&root) {
            LedgerWriter::new(&root).rebuild_index().context("rebuilding corrupt or missing index")?;
        }
        Ok(Self { root })
    }

    fn task_entry_path(&self, task_id: &str) -> PathBuf {
        self.root.join("by-task").join(task_id).join("entry.json")
    }

    pub fn get(&self, task_id: &str) -> Result<Option<LedgerEntry>> {
        let path = self.task_entry_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?))
    }

    fn index(&self) -> Result<Vec<IndexRecord>> {
        load_index(&self.root)
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let mut stats = LedgerStats::default();
        for record in self.index()? {
            if record.is_epic {
                stats.total_epics += 1;
                continue;
            }
            stats.total_tasks += 1;
            match record.success {
                Some(true) => stats.tasks_succeeded += 1,
                Some(false) => stats.tasks_failed += 1,
                None => stats.tasks_pending += 1,
            }
            if let Some(stage) = record.workflow_stage {
                *stats.workflow_counts.entry(stage.to_string()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    /// Full-text search over task id/title/description, via `by-task`
    /// entries (the index alone lacks title/description).
    pub fn search(&self, query: &str) -> Result<Vec<LedgerEntry>> {
        let needle = query.to_lowercase();
        let mut matches = Vec::new();
        for record in self.index()? {
            if record.is_epic {
                continue;
            }
            let Some(entry) = self.get(&record.id)? else { continue };
            if entry.id.to_lowercase().contains(&needle)
                || entry.task.title.to_lowercase().contains(&needle)
                || entry.task.description.to_lowercase().contains(&needle)
            {
                matches.push(entry);
            }
        }
        Ok(matches)
    }

    pub fn by_epic(&self, epic_id: &str) -> Result<Vec<LedgerEntry>> {
        let mut matches = Vec::new();
        for record in self.index()? {
            if record.is_epic || record.parent_epic_id.as_deref() != Some(epic_id) {
                continue;
            }
            if let Some(entry) = self.get(&record.id)? {
                matches.push(entry);
            }
        }
        Ok(matches)
    }

    pub fn by_run(&self, run_id: &str) -> Result<Vec<LedgerEntry>> {
        let mut matches = Vec::new();
        for record in self.index()? {
            if record.is_epic || !record.run_ids.contains(run_id) {
                continue;
            }
            if let Some(entry) = self.get(&record.id)? {
                matches.push(entry);
            }
        }
        Ok(matches)
    }

    /// Most recently updated task entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut records: Vec<IndexRecord> = self.index()?.into_iter().filter(|r| !r.is_epic).collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        let mut entries = Vec::new();
        for record in records {
            if let Some(entry) = self.get(&record.id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn by_workflow_stage(&self, stage: WorkflowStage) -> Result<Vec<LedgerEntry>> {
        let mut matches = Vec::new();
        for record in self.index()? {
            if record.is_epic || record.workflow_stage != Some(stage) {
                continue;
            }
            if let Some(entry) = self.get(&record.id)? {
                matches.push(entry);
            }
        }
        Ok(matches)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::model::{EntrySource, Lineage, TaskSnapshot};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn snapshot(title: &str) -> TaskSnapshot {
        let now = Utc::now();
        TaskSnapshot {
            title: title.to_string(),
            description: "widget spinning logic".to_string(),
            task_type: crate::task::TaskType::Task,
            priority: 2,
            labels: BTreeSet::new(),
            created_at: now,
            captured_at: now,
        }
    }

    #[test]
    fn open_rebuilds_missing_index() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot("Add widget"), Lineage::default(), EntrySource::Loop).unwrap();
        fs::remove_file(super::super::index::index_path(tmp.path())).unwrap();

        let reader = LedgerReader::open(tmp.path()).unwrap();
        assert!(reader.get("proj-a-1").unwrap().is_some());
    }

    #[test]
    fn search_matches_title_and_description() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot("Add widget"), Lineage::default(), EntrySource::Loop).unwrap();
        writer.create_task_entry("proj-a-2", snapshot("Fix bug"), Lineage::default(), EntrySource::Loop).unwrap();

        let reader = LedgerReader::open(tmp.path()).unwrap();
        let found = reader.search("widget").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "proj-a-1");
    }

    #[test]
    fn by_epic_filters_on_lineage() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        let lineage = Lineage { parent_epic_id: Some("proj-a-epic-1".to_string()), ..Default::default() };
        writer.create_task_entry("proj-a-1", snapshot("Add widget"), lineage, EntrySource::Loop).unwrap();
        writer.create_task_entry("proj-a-2", snapshot("Unrelated"), Lineage::default(), EntrySource::Loop).unwrap();

        let reader = LedgerReader::open(tmp.path()).unwrap();
        let found = reader.by_epic("proj-a-epic-1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "proj-a-1");
    }

    #[test]
    fn stats_counts_by_outcome() {
        let tmp = TempDir::new().unwrap();
        let writer = LedgerWriter::new(tmp.path());
        writer.create_task_entry("proj-a-1", snapshot("Add widget"), Lineage::default(), EntrySource::Loop).unwrap();

        let reader = LedgerReader::open(tmp.path()).unwrap();
        let stats = reader.stats().unwrap();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.tasks_pending, 1);
    }
}
