//! Task backend abstraction (spec §3.1, §4.1).
//!
//! The loop sees a task backend through a small polymorphic capability
//! set. The shipped implementation ([`file_store::FileTaskBackend`]) is a
//! line-delimited JSON file store; the trait is kept capability-complete
//! so an alternative backend (e.g. an external dependency-graph CLI
//! wrapper) could be registered without touching the run loop.

pub mod file_store;
pub mod id;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Task,
    Feature,
    Bug,
    Epic,
    Gate,
}

#[derive(Debug, Error)]
#[error("invalid task type: {0:?}")]
pub struct TaskTypeParseError(String);

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Task => "task",
            TaskType::Feature => "feature",
            TaskType::Bug => "bug",
            TaskType::Epic => "epic",
            TaskType::Gate => "gate",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskType {
    type Err = TaskTypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(TaskType::Task),
            "feature" => Ok(TaskType::Feature),
            "bug" => Ok(TaskType::Bug),
            "epic" => Ok(TaskType::Epic),
            "gate" => Ok(TaskType::Gate),
            other => Err(TaskTypeParseError(other.to_string())),
        }
    }
}

/// Task status — exactly the three states spec.md §3.1 fixes as the
/// external contract. Richer per-attempt states (running/checking/
/// escalated/...) live on [`crate::ledger::model::Attempt`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
}

#[derive(Debug, Error)]
#[error("invalid task status: {0:?}")]
pub struct TaskStatusParseError(String);

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskStatusParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "in_progress" => Ok(TaskStatus::InProgress),
            "closed" => Ok(TaskStatus::Closed),
            other => Err(TaskStatusParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// 0 (highest) .. 4.
    pub priority: u8,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Session id recorded by [`TaskBackend::claim`]; cleared on close/reopen.
    #[serde(default)]
    pub claimed_by: Option<String>,
    /// `true` if a referenced parent/dependency id does not exist (spec
    /// invariant (c)).
    #[serde(default)]
    pub broken: bool,
}

impl Task {
    /// Well-known label prefix overriding the harness model for this task.
    pub fn model_override(&self) -> Option<&str> {
        self.labels.iter().find_map(|l| l.strip_prefix("model:"))
    }

    /// Whether this task carries the review-stage `pr` label.
    pub fn is_pr_stage(&self) -> bool {
        self.labels.contains("pr")
    }
}

/// Partial update for [`TaskBackend::update`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub assignee: Option<String>,
    pub notes: Option<String>,
}

/// Selection filters shared by `ready`/`list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub parent: Option<String>,
    pub label: Option<String>,
    pub task_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("claim lost the race for task {0}")]
    Race(String),
    #[error("invalid operation: {0}")]
    Invalid(String),
    #[error("task backend error: {0}")]
    BackendError(String),
}

// ---------------------------------------------------------------------------
// TaskBackend
// ---------------------------------------------------------------------------

/// Capability set the run loop (and the CLI's `task` subcommands) use to
/// observe and mutate the project's work items.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Ready tasks matching `filters`, ordered by priority ascending then
    /// `created_at` ascending. Excludes tasks blocked by an unapproved
    /// transitive gate.
    async fn ready(&self, filters: &TaskFilters) -> Result<Vec<Task>, BackendError>;

    async fn get(&self, id: &str) -> Result<Task, BackendError>;

    /// Atomic `open -> in_progress`, recording the owning session.
    async fn claim(&self, id: &str, session_id: &str) -> Result<(), BackendError>;

    /// Atomic transition to `closed`.
    async fn close(&self, id: &str, reason: &str) -> Result<(), BackendError>;

    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, BackendError>;

    async fn list(&self, filters: &TaskFilters) -> Result<Vec<Task>, BackendError>;

    async fn search(&self, query: &str) -> Result<Vec<Task>, BackendError>;

    async fn counts(&self) -> Result<TaskCounts, BackendError>;

    /// Open tasks that are not ready (blocked on a dependency or gate).
    async fn blocked(&self) -> Result<Vec<Task>, BackendError>;

    async fn create(&self, task: NewTask) -> Result<Task, BackendError>;

    async fn delete(&self, id: &str) -> Result<(), BackendError>;

    /// Returns a task to `open`, rewinding its status history.
    async fn reopen(&self, id: &str, reason: &str) -> Result<Task, BackendError>;

    async fn dep_add(&self, id: &str, depends_on: &str) -> Result<(), BackendError>;
    async fn dep_remove(&self, id: &str, depends_on: &str) -> Result<(), BackendError>;
    async fn dep_list(&self, id: &str) -> Result<Vec<String>, BackendError>;

    async fn label_add(&self, id: &str, label: &str) -> Result<(), BackendError>;
    async fn label_remove(&self, id: &str, label: &str) -> Result<(), BackendError>;
    async fn label_list(&self, id: &str) -> Result<Vec<String>, BackendError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCounts {
    pub open: usize,
    pub in_progress: usize,
    pub closed: usize,
}

/// Fields required to create a new task; id is assigned by the caller and
/// validated against the id-format contract.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: u8,
    pub parent: Option<String>,
    pub depends_on: BTreeSet<String>,
    pub labels: BTreeSet<String>,
}

const _: () = {
    fn _assert_object_safe(_: &dyn TaskBackend) {}
};
