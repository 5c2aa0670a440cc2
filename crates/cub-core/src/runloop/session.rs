//! Run-session file and `active-run` designator (spec §3.7, §3.8, §9).
//!
//! The on-disk layout calls the designator a "symlink to the current run
//! session file"; we use a plain pointer file holding the run id instead
//! of an OS symlink (the layout section is explicitly conceptual, not
//! prescriptive of file format) so ownership/orphan checks stay portable
//! across platforms without `std::os::unix::fs::symlink`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CubConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSessionFile {
    pub run_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub phase: String,
    pub reason: Option<String>,
    pub orphaned: bool,
}

/// Owns the run-session file and `active-run` designator for the
/// lifetime of one run loop invocation.
pub struct RunSession {
    run_sessions_dir: PathBuf,
    active_run_path: PathBuf,
    run_id: String,
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    true
}

impl RunSession {
    fn session_path(run_sessions_dir: &std::path::Path, run_id: &str) -> PathBuf {
        run_sessions_dir.join(format!("{run_id}.json"))
    }

    fn read(path: &std::path::Path) -> Result<RunSessionFile> {
        let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    fn write(path: &std::path::Path, file: &RunSessionFile) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(file)?)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    /// Claim the `active-run` designator for `run_id`. If a designator is
    /// present but its referenced process is dead, the stale session is
    /// marked `orphaned` and ownership passes to the new run.
    pub fn acquire(config: &CubConfig, run_id: String) -> Result<Self> {
        let run_sessions_dir = config.run_sessions_dir();
        let active_run_path = config.active_run_path();

        if let Ok(existing_id) = fs::read_to_string(&active_run_path) {
            let existing_id = existing_id.trim();
            if !existing_id.is_empty() {
                let existing_path = Self::session_path(&run_sessions_dir, existing_id);
                if let Ok(existing) = Self::read(&existing_path) {
                    if existing.ended_at.is_none() && process_is_alive(existing.pid) {
                        anyhow::bail!("a run loop is already active (run {existing_id}, pid {})", existing.pid);
                    }
                    if existing.ended_at.is_none() {
                        let mut orphaned = existing;
                        orphaned.orphaned = true;
                        orphaned.ended_at = Some(Utc::now());
                        orphaned.phase = "stopped".to_string();
                        orphaned.reason = Some("orphaned".to_string());
                        let _ = Self::write(&existing_path, &orphaned);
                    }
                }
            }
        }

        let session_file = RunSessionFile {
            run_id: run_id.clone(),
            pid: std::process::id(),
            started_at: Utc::now(),
            ended_at: None,
            phase: "init".to_string(),
            reason: None,
            orphaned: false,
        };
        Self::write(&Self::session_path(&run_sessions_dir, &run_id), &session_file)?;

        fs::create_dir_all(&config.cub_dir()).with_context(|| format!("creating {}", config.cub_dir().display()))?;
        let tmp_path = active_run_path.with_extension("tmp");
        fs::write(&tmp_path, &run_id).context("writing active-run pointer")?;
        fs::rename(&tmp_path, &active_run_path).context("installing active-run designator")?;

        Ok(Self { run_sessions_dir, active_run_path, run_id })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Update the recorded phase without ending the session.
    pub fn set_phase(&self, phase: &str) -> Result<()> {
        let path = Self::session_path(&self.run_sessions_dir, &self.run_id);
        let mut file = Self::read(&path)?;
        file.phase = phase.to_string();
        Self::write(&path, &file)
    }

    /// Record final phase/reason and clear the `active-run` designator if
    /// it still points to this run (a later run may already have taken
    /// over after an orphan detection).
    pub fn finalize(&self, phase: &str, reason: Option<&str>) -> Result<()> {
        let path = Self::session_path(&self.run_sessions_dir, &self.run_id);
        let mut file = Self::read(&path).unwrap_or(RunSessionFile {
            run_id: self.run_id.clone(),
            pid: std::process::id(),
            started_at: Utc::now(),
            ended_at: None,
            phase: "init".to_string(),
            reason: None,
            orphaned: false,
        });
        file.phase = phase.to_string();
        file.reason = reason.map(str::to_string);
        file.ended_at = Some(Utc::now());
        Self::write(&path, &file)?;

        if let Ok(pointed) = fs::read_to_string(&self.active_run_path) {
            if pointed.trim() == self.run_id {
                let _ = fs::remove_file(&self.active_run_path);
            }
        }
        Ok(())
    }
}
