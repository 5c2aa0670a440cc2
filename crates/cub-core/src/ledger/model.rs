//! Ledger data model (spec §3.3-§3.6).
//!
//! Plain serde structs, not `sqlx::FromRow` rows -- the ledger is a file
//! store, not a database, so the teacher's row-mapping derives have no
//! counterpart here. The enum Display/FromStr/ParseError idiom they used
//! for status columns is kept, generalized to the ledger's own enums.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{TaskStatus, TaskType};

// ---------------------------------------------------------------------------
// Lineage
// ---------------------------------------------------------------------------

/// Optional references recorded at first capture, tying a ledger entry
/// back to the artifacts that generated the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lineage {
    #[serde(default)]
    pub spec_file: Option<String>,
    #[serde(default)]
    pub plan_file: Option<String>,
    #[serde(default)]
    pub parent_epic_id: Option<String>,
}

/// Snapshot of a task's fields at first capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: u8,
    pub labels: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

/// A field that changed between first capture and final close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedField {
    pub field: String,
    pub before: String,
    pub after: String,
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// Token usage for one attempt, `None` fields mean "unknown" per spec §4.2.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub cache_read: Option<u64>,
    pub cache_write: Option<u64>,
}

/// One harness invocation for one task (spec §3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based per task.
    pub attempt_number: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub harness: String,
    pub model: String,
    pub success: bool,
    #[serde(default)]
    pub error_category: Option<String>,
    #[serde(default)]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    pub duration_s: f64,
}

// ---------------------------------------------------------------------------
// Outcome / Drift / Verification / Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default)]
    pub partial: bool,
    pub completed_at: DateTime<Utc>,
    pub total_cost_usd: f64,
    pub total_attempts: u32,
    pub total_duration_s: f64,
    pub final_model: String,
    #[serde(default)]
    pub escalation_path: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commit_refs: Vec<String>,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    #[serde(default)]
    pub lessons_learned: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    Minor,
    Significant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Drift {
    #[serde(default)]
    pub additions: Vec<String>,
    #[serde(default)]
    pub omissions: Vec<String>,
    pub severity: Option<DriftSeverity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Pass,
    Fail,
    Warn,
    Skip,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub status: VerificationStatus,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub typecheck_passed: Option<bool>,
    #[serde(default)]
    pub lint_passed: Option<bool>,
    #[serde(default)]
    pub notes: String,
}

impl Default for Verification {
    fn default() -> Self {
        Self {
            status: VerificationStatus::Pending,
            checked_at: None,
            tests_passed: None,
            typecheck_passed: None,
            lint_passed: None,
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    DevComplete,
    NeedsReview,
    Validated,
    Released,
}

#[derive(Debug, Error)]
#[error("invalid workflow stage: {0:?}")]
pub struct WorkflowStageParseError(String);

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStage::DevComplete => "dev_complete",
            WorkflowStage::NeedsReview => "needs_review",
            WorkflowStage::Validated => "validated",
            WorkflowStage::Released => "released",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkflowStage {
    type Err = WorkflowStageParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev_complete" => Ok(WorkflowStage::DevComplete),
            "needs_review" => Ok(WorkflowStage::NeedsReview),
            "validated" => Ok(WorkflowStage::Validated),
            "released" => Ok(WorkflowStage::Released),
            other => Err(WorkflowStageParseError(other.to_string())),
        }
    }
}

/// One transition recorded against a task's history. `stage` is usually a
/// [`WorkflowStage`]'s string form, but also carries non-workflow
/// lifecycle notes such as `claim_abandoned` from forensics reconciliation
/// (spec §3.6), so it is stored as plain text rather than the closed enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub stage: String,
    pub at: DateTime<Utc>,
    pub by: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Loop,
    DirectSession,
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// Current on-disk schema version for [`LedgerEntry`].
pub const LEDGER_ENTRY_VERSION: u32 = 1;

/// Append-mostly record of everything that happened to a task (spec §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub lineage: Lineage,
    pub task: TaskSnapshot,
    #[serde(default)]
    pub task_changed: Vec<ChangedField>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub drift: Drift,
    #[serde(default)]
    pub verification: Verification,
    pub workflow_stage: Option<WorkflowStage>,
    #[serde(default)]
    pub state_history: Vec<StateHistoryEntry>,
    pub source: EntrySource,
}

fn default_version() -> u32 {
    LEDGER_ENTRY_VERSION
}

impl LedgerEntry {
    pub fn new(id: String, task: TaskSnapshot, lineage: Lineage, source: EntrySource) -> Self {
        Self {
            id,
            version: LEDGER_ENTRY_VERSION,
            lineage,
            task,
            task_changed: Vec::new(),
            attempts: Vec::new(),
            outcome: None,
            drift: Drift::default(),
            verification: Verification::default(),
            workflow_stage: None,
            state_history: Vec::new(),
            source,
        }
    }

    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.last().map(|a| a.attempt_number + 1).unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// EpicEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicSnapshot {
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpicAggregates {
    pub total_tasks: u64,
    pub tasks_completed: u64,
    pub tasks_in_progress: u64,
    pub total_cost_usd: f64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_attempts: u64,
    pub escalation_rate: f64,
    pub avg_cost_per_task: f64,
}

/// Aggregation record for epic ids (spec §3.5). Aggregates are derived:
/// always rebuildable from per-task entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicEntry {
    pub id: String,
    #[serde(default)]
    pub lineage: Lineage,
    pub epic: EpicSnapshot,
    #[serde(default)]
    pub task_ids: BTreeSet<String>,
    #[serde(default)]
    pub aggregates: EpicAggregates,
    pub workflow_stage: Option<WorkflowStage>,
    #[serde(default)]
    pub state_history: Vec<StateHistoryEntry>,
}

// ---------------------------------------------------------------------------
// Forensic events (spec §3.6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ForensicEvent {
    SessionStart {
        timestamp: DateTime<Utc>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        agent_type: Option<String>,
    },
    FileWrite {
        file_path: String,
        tool: String,
        timestamp: DateTime<Utc>,
    },
    TaskClaim {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskClose {
        task_id: String,
        #[serde(default)]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    GitCommit {
        hash: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    SessionEnd {
        timestamp: DateTime<Utc>,
        #[serde(default)]
        reason: Option<String>,
    },
    PromptSubmit {
        prompt_excerpt: String,
        timestamp: DateTime<Utc>,
    },
}

impl ForensicEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ForensicEvent::SessionStart { timestamp, .. }
            | ForensicEvent::FileWrite { timestamp, .. }
            | ForensicEvent::TaskClaim { timestamp, .. }
            | ForensicEvent::TaskClose { timestamp, .. }
            | ForensicEvent::GitCommit { timestamp, .. }
            | ForensicEvent::SessionEnd { timestamp, .. }
            | ForensicEvent::PromptSubmit { timestamp, .. } => *timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Index record (spec §3.7)
// ---------------------------------------------------------------------------

/// One line of the ledger index: a fast-lookup summary of a [`LedgerEntry`]
/// or [`EpicEntry`], rebuildable from the full `by-task`/`by-epic` trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    #[serde(default)]
    pub parent_epic_id: Option<String>,
    #[serde(default)]
    pub is_epic: bool,
    pub workflow_stage: Option<WorkflowStage>,
    pub success: Option<bool>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub run_ids: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_stage_round_trips() {
        use std::str::FromStr;
        for stage in [WorkflowStage::DevComplete, WorkflowStage::NeedsReview, WorkflowStage::Validated, WorkflowStage::Released] {
            let s = stage.to_string();
            assert_eq!(WorkflowStage::from_str(&s).unwrap(), stage);
        }
    }

    #[test]
    fn new_entry_starts_with_attempt_number_one() {
        let now = Utc::now();
        let entry = LedgerEntry::new(
            "proj-a-1".to_string(),
            TaskSnapshot {
                title: "t".to_string(),
                description: String::new(),
                task_type: TaskType::Task,
                priority: 2,
                labels: BTreeSet::new(),
                created_at: now,
                captured_at: now,
            },
            Lineage::default(),
            EntrySource::Loop,
        );
        assert_eq!(entry.next_attempt_number(), 1);
    }

    #[test]
    fn next_attempt_number_increments() {
        let now = Utc::now();
        let mut entry = LedgerEntry::new(
            "proj-a-1".to_string(),
            TaskSnapshot {
                title: "t".to_string(),
                description: String::new(),
                task_type: TaskType::Task,
                priority: 2,
                labels: BTreeSet::new(),
                created_at: now,
                captured_at: now,
            },
            Lineage::default(),
            EntrySource::Loop,
        );
        entry.attempts.push(Attempt {
            attempt_number: 1,
            run_id: "run-1".to_string(),
            started_at: now,
            completed_at: Some(now),
            harness: "claude".to_string(),
            model: "claude-sonnet".to_string(),
            success: false,
            error_category: None,
            error_summary: None,
            tokens: TokenUsage::default(),
            cost_usd: None,
            duration_s: 1.0,
        });
        assert_eq!(entry.next_attempt_number(), 2);
    }

    #[test]
    fn forensic_event_serializes_with_type_tag() {
        let event = ForensicEvent::TaskClaim { task_id: "proj-a-1".to_string(), timestamp: Utc::now() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"task_claim\""));
    }
}
