//! On-disk index: a single JSONL file summarizing every task/epic entry
//! for fast lookup without scanning the whole `by-task`/`by-epic` tree.
//!
//! Same atomicity contract as the task store (spec §3.7): load whole,
//! mutate, rewrite via temp-file + rename. The index is a derived cache —
//! always rebuildable from `by-task`/`by-epic` — so a missing or corrupt
//! index is recovered by rebuilding rather than treated as data loss.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::model::IndexRecord;

pub fn index_path(ledger_root: &Path) -> PathBuf {
    ledger_root.join("index")
}

pub fn load_index(ledger_root: &Path) -> Result<Vec<IndexRecord>> {
    let path = index_path(ledger_root);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(&path).with_context(|| format!("opening index at {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading index line {lineno}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: IndexRecord = serde_json::from_str(&line)
            .with_context(|| format!("corrupt index at line {lineno}"))?;
        records.push(record);
    }
    Ok(records)
}

pub fn save_index(ledger_root: &Path, records: &[IndexRecord]) -> Result<()> {
    fs::create_dir_all(ledger_root)
        .with_context(|| format!("creating ledger root {}", ledger_root.display()))?;
    let path = index_path(ledger_root);
    let tmp_path = ledger_root.join("index.tmp");
    {
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("creating temp index at {}", tmp_path.display()))?;
        for record in records {
            let line = serde_json::to_string(record).context("serializing index record")?;
            writeln!(tmp, "{line}").context("writing index line")?;
        }
        tmp.flush().context("flushing temp index")?;
    }
    fs::rename(&tmp_path, &path)
        .with_context(|| format!("renaming temp index into {}", path.display()))?;
    Ok(())
}

/// `true` if the index file is present and every line parses.
pub fn index_is_valid(ledger_root: &Path) -> bool {
    load_index(ledger_root).is_ok()
}
