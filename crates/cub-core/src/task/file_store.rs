//! Line-delimited JSON file-backed [`TaskBackend`].
//!
//! One physical file (`tasks.jsonl`, one `Task` per line) rewritten whole
//! on every mutation via temp-file + rename, the same atomicity contract
//! the ledger uses (spec §3.7). Mutating operations are serialized by an
//! advisory exclusive lock on a sibling `.lock` file so that external CLI
//! invocations racing the loop cannot interleave; read operations do not
//! take the lock, per spec §5.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;

use super::id::is_valid_task_id;
use super::{
    BackendError, NewTask, Task, TaskBackend, TaskCounts, TaskFilters, TaskPatch, TaskStatus,
    TaskType,
};

pub struct FileTaskBackend {
    data_path: PathBuf,
    lock_path: PathBuf,
}

impl FileTaskBackend {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        let data_path = data_path.into();
        let lock_path = data_path.with_extension("lock");
        Self { data_path, lock_path }
    }

    fn load_unlocked(&self) -> Result<Vec<Task>, BackendError> {
        if !self.data_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.data_path)
            .map_err(|e| BackendError::BackendError(format!("opening task store: {e}")))?;
        let reader = BufReader::new(file);
        let mut tasks = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                BackendError::BackendError(format!("reading task store line {lineno}: {e}"))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let task: Task = serde_json::from_str(&line).map_err(|e| {
                BackendError::BackendError(format!(
                    "corrupt task store at line {lineno}: {e}"
                ))
            })?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    fn save_unlocked(&self, tasks: &[Task]) -> Result<(), BackendError> {
        if let Some(parent) = self.data_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BackendError::BackendError(format!("creating task store dir: {e}")))?;
        }
        let tmp_path = self.data_path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| BackendError::BackendError(format!("creating temp file: {e}")))?;
            for task in tasks {
                let line = serde_json::to_string(task)
                    .map_err(|e| BackendError::BackendError(format!("serializing task: {e}")))?;
                writeln!(tmp, "{line}")
                    .map_err(|e| BackendError::BackendError(format!("writing temp file: {e}")))?;
            }
            tmp.flush()
                .map_err(|e| BackendError::BackendError(format!("flushing temp file: {e}")))?;
        }
        fs::rename(&tmp_path, &self.data_path)
            .map_err(|e| BackendError::BackendError(format!("renaming temp file: {e}")))?;
        Ok(())
    }

    /// Acquire the exclusive lock, run `f` over the loaded task set, persist
    /// the result, and release the lock.
    fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut Vec<Task>) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BackendError::BackendError(format!("creating lock dir: {e}")))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| BackendError::BackendError(format!("opening lock file: {e}")))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| BackendError::BackendError(format!("acquiring task lock: {e}")))?;

        let result = (|| {
            let mut tasks = self.load_unlocked()?;
            let r = f(&mut tasks)?;
            self.save_unlocked(&tasks)?;
            Ok(r)
        })();

        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn index_by_id(tasks: &[Task]) -> HashMap<&str, &Task> {
        tasks.iter().map(|t| (t.id.as_str(), t)).collect()
    }

    /// All transitive `depends_on` are closed (a gate dependency can only
    /// satisfy this if it too is closed/approved), and no ancestor in the
    /// `parent` chain is an unapproved (non-closed) gate.
    fn is_ready_within(task: &Task, by_id: &HashMap<&str, &Task>) -> bool {
        if task.status != TaskStatus::Open {
            return false;
        }
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<String> = task.depends_on.iter().cloned().collect();
        while let Some(dep_id) = stack.pop() {
            if !visited.insert(dep_id.clone()) {
                continue;
            }
            let Some(dep) = by_id.get(dep_id.as_str()) else {
                return false;
            };
            if dep.status != TaskStatus::Closed {
                return false;
            }
            stack.extend(dep.depends_on.iter().cloned());
        }

        let mut ancestor = task.parent.clone();
        let mut seen_ancestors: BTreeSet<String> = BTreeSet::new();
        while let Some(ancestor_id) = ancestor {
            if !seen_ancestors.insert(ancestor_id.clone()) {
                break;
            }
            let Some(parent_task) = by_id.get(ancestor_id.as_str()) else {
                break;
            };
            if parent_task.task_type == TaskType::Gate && parent_task.status != TaskStatus::Closed {
                return false;
            }
            ancestor = parent_task.parent.clone();
        }

        true
    }

    fn matches_filters(task: &Task, filters: &TaskFilters) -> bool {
        if let Some(ref id) = filters.task_id {
            if &task.id != id {
                return false;
            }
        }
        if let Some(ref parent) = filters.parent {
            if task.parent.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(ref label) = filters.label {
            if !task.labels.contains(label) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl TaskBackend for FileTaskBackend {
    async fn ready(&self, filters: &TaskFilters) -> Result<Vec<Task>, BackendError> {
        let tasks = self.load_unlocked()?;
        let by_id = Self::index_by_id(&tasks);
        let mut ready: Vec<Task> = tasks
            .iter()
            .filter(|t| Self::is_ready_within(t, &by_id) && Self::matches_filters(t, filters))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(ready)
    }

    async fn get(&self, id: &str) -> Result<Task, BackendError> {
        let tasks = self.load_unlocked()?;
        tasks
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn claim(&self, id: &str, session_id: &str) -> Result<(), BackendError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            match task.status {
                TaskStatus::Open => {
                    task.status = TaskStatus::InProgress;
                    task.claimed_by = Some(session_id.to_string());
                    task.updated_at = Utc::now();
                    Ok(())
                }
                TaskStatus::InProgress => Err(BackendError::Race(id.to_string())),
                TaskStatus::Closed => Err(BackendError::Invalid(format!(
                    "task {id} is already closed"
                ))),
            }
        })
    }

    async fn close(&self, id: &str, reason: &str) -> Result<(), BackendError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            task.status = TaskStatus::Closed;
            task.claimed_by = None;
            if !reason.is_empty() {
                if !task.notes.is_empty() {
                    task.notes.push('\n');
                }
                task.notes.push_str(&format!("closed: {reason}"));
            }
            task.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, BackendError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            if let Some(ref v) = patch.title {
                task.title = v.clone();
            }
            if let Some(ref v) = patch.description {
                task.description = v.clone();
            }
            if let Some(v) = patch.priority {
                task.priority = v;
            }
            if let Some(ref v) = patch.assignee {
                task.assignee = Some(v.clone());
            }
            if let Some(ref v) = patch.notes {
                task.notes = v.clone();
            }
            task.updated_at = Utc::now();
            Ok(task.clone())
        })
    }

    async fn list(&self, filters: &TaskFilters) -> Result<Vec<Task>, BackendError> {
        let tasks = self.load_unlocked()?;
        Ok(tasks
            .into_iter()
            .filter(|t| Self::matches_filters(t, filters))
            .collect())
    }

    async fn search(&self, query: &str) -> Result<Vec<Task>, BackendError> {
        let needle = query.to_lowercase();
        let tasks = self.load_unlocked()?;
        Ok(tasks
            .into_iter()
            .filter(|t| {
                t.id.to_lowercase().contains(&needle)
                    || t.title.to_lowercase().contains(&needle)
                    || t.description.to_lowercase().contains(&needle)
            })
            .collect())
    }

    async fn counts(&self) -> Result<TaskCounts, BackendError> {
        let tasks = self.load_unlocked()?;
        let mut counts = TaskCounts::default();
        for t in &tasks {
            match t.status {
                TaskStatus::Open => counts.open += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Closed => counts.closed += 1,
            }
        }
        Ok(counts)
    }

    async fn blocked(&self) -> Result<Vec<Task>, BackendError> {
        let tasks = self.load_unlocked()?;
        let by_id = Self::index_by_id(&tasks);
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Open && !Self::is_ready_within(t, &by_id))
            .cloned()
            .collect())
    }

    async fn create(&self, new_task: NewTask) -> Result<Task, BackendError> {
        if !is_valid_task_id(&new_task.id) {
            return Err(BackendError::Invalid(format!(
                "task id {:?} does not match the required format",
                new_task.id
            )));
        }
        self.with_lock(|tasks| {
            if tasks.iter().any(|t| t.id == new_task.id) {
                return Err(BackendError::Invalid(format!(
                    "task {} already exists",
                    new_task.id
                )));
            }
            let by_id = Self::index_by_id(tasks);
            let broken = new_task
                .parent
                .as_deref()
                .is_some_and(|p| !by_id.contains_key(p))
                || new_task.depends_on.iter().any(|d| !by_id.contains_key(d.as_str()));
            let now = Utc::now();
            let task = Task {
                id: new_task.id,
                title: new_task.title,
                description: new_task.description,
                task_type: new_task.task_type,
                status: TaskStatus::Open,
                priority: new_task.priority,
                parent: new_task.parent,
                depends_on: new_task.depends_on,
                labels: new_task.labels,
                assignee: None,
                notes: String::new(),
                created_at: now,
                updated_at: now,
                claimed_by: None,
                broken,
            };
            tasks.push(task.clone());
            Ok(task)
        })
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        self.with_lock(|tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.id != id);
            if tasks.len() == before {
                return Err(BackendError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    async fn reopen(&self, id: &str, reason: &str) -> Result<Task, BackendError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            task.status = TaskStatus::Open;
            task.claimed_by = None;
            if !reason.is_empty() {
                if !task.notes.is_empty() {
                    task.notes.push('\n');
                }
                task.notes.push_str(&format!("reopened: {reason}"));
            }
            task.updated_at = Utc::now();
            Ok(task.clone())
        })
    }

    async fn dep_add(&self, id: &str, depends_on: &str) -> Result<(), BackendError> {
        self.with_lock(|tasks| {
            if !tasks.iter().any(|t| t.id == depends_on) {
                return Err(BackendError::Invalid(format!(
                    "dependency {depends_on} does not exist"
                )));
            }
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            task.depends_on.insert(depends_on.to_string());
            task.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn dep_remove(&self, id: &str, depends_on: &str) -> Result<(), BackendError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            task.depends_on.remove(depends_on);
            task.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn dep_list(&self, id: &str) -> Result<Vec<String>, BackendError> {
        let task = self.get(id).await?;
        Ok(task.depends_on.into_iter().collect())
    }

    async fn label_add(&self, id: &str, label: &str) -> Result<(), BackendError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            task.labels.insert(label.to_string());
            task.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn label_remove(&self, id: &str, label: &str) -> Result<(), BackendError> {
        self.with_lock(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            task.labels.remove(label);
            task.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn label_list(&self, id: &str) -> Result<Vec<String>, BackendError> {
        let task = self.get(id).await?;
        Ok(task.labels.into_iter().collect())
    }
}

/// Convenience for tests and the CLI: ensure the parent directory exists
/// before constructing a store.
pub fn backend_at(path: &Path) -> FileTaskBackend {
    FileTaskBackend::new(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileTaskBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FileTaskBackend::new(dir.path().join("tasks.jsonl"));
        (dir, backend)
    }

    fn new_task(id: &str, depends_on: BTreeSet<String>) -> NewTask {
        NewTask {
            id: id.to_string(),
            title: "title".to_string(),
            description: String::new(),
            task_type: TaskType::Task,
            priority: 2,
            parent: None,
            depends_on,
            labels: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let (_dir, backend) = store();
        let created = backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        assert_eq!(created.status, TaskStatus::Open);
        let fetched = backend.get("proj-a-1").await.unwrap();
        assert_eq!(fetched.id, "proj-a-1");
    }

    #[tokio::test]
    async fn create_rejects_invalid_id() {
        let (_dir, backend) = store();
        let err = backend.create(new_task("BAD ID", BTreeSet::new())).await.unwrap_err();
        assert!(matches!(err, BackendError::Invalid(_)));
    }

    #[tokio::test]
    async fn create_flags_broken_on_missing_dependency() {
        let (_dir, backend) = store();
        let mut deps = BTreeSet::new();
        deps.insert("proj-a-0".to_string());
        let created = backend.create(new_task("proj-a-1", deps)).await.unwrap();
        assert!(created.broken);
    }

    #[tokio::test]
    async fn ready_excludes_blocked_tasks() {
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        let mut deps = BTreeSet::new();
        deps.insert("proj-a-1".to_string());
        backend.create(new_task("proj-a-2", deps)).await.unwrap();

        let ready = backend.ready(&TaskFilters::default()).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "proj-a-1");

        let blocked = backend.blocked().await.unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].id, "proj-a-2");
    }

    #[tokio::test]
    async fn ready_excludes_tasks_behind_an_unapproved_parent_gate() {
        let (_dir, backend) = store();
        backend
            .create(NewTask {
                id: "proj-g-1".to_string(),
                title: "gate".to_string(),
                description: String::new(),
                task_type: TaskType::Gate,
                priority: 2,
                parent: None,
                depends_on: BTreeSet::new(),
                labels: BTreeSet::new(),
            })
            .await
            .unwrap();
        backend
            .create(NewTask {
                id: "proj-a-2".to_string(),
                title: "behind the gate".to_string(),
                description: String::new(),
                task_type: TaskType::Task,
                priority: 2,
                parent: Some("proj-g-1".to_string()),
                depends_on: BTreeSet::new(),
                labels: BTreeSet::new(),
            })
            .await
            .unwrap();

        let ready = backend.ready(&TaskFilters::default()).await.unwrap();
        assert!(ready.iter().all(|t| t.id != "proj-a-2"));

        let blocked = backend.blocked().await.unwrap();
        assert!(blocked.iter().any(|t| t.id == "proj-a-2"));

        backend.claim("proj-g-1", "session-1").await.unwrap();
        backend.close("proj-g-1", "approved").await.unwrap();

        let ready = backend.ready(&TaskFilters::default()).await.unwrap();
        assert!(ready.iter().any(|t| t.id == "proj-a-2"));
    }

    #[tokio::test]
    async fn ready_unblocks_after_dependency_closes() {
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        let mut deps = BTreeSet::new();
        deps.insert("proj-a-1".to_string());
        backend.create(new_task("proj-a-2", deps)).await.unwrap();

        backend.claim("proj-a-1", "session-1").await.unwrap();
        backend.close("proj-a-1", "done").await.unwrap();

        let ready = backend.ready(&TaskFilters::default()).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "proj-a-2");
    }

    #[tokio::test]
    async fn claim_twice_yields_race() {
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        backend.claim("proj-a-1", "session-1").await.unwrap();
        let err = backend.claim("proj-a-1", "session-2").await.unwrap_err();
        assert!(matches!(err, BackendError::Race(_)));
    }

    #[tokio::test]
    async fn claim_closed_task_is_invalid() {
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        backend.claim("proj-a-1", "session-1").await.unwrap();
        backend.close("proj-a-1", "done").await.unwrap();
        let err = backend.claim("proj-a-1", "session-2").await.unwrap_err();
        assert!(matches!(err, BackendError::Invalid(_)));
    }

    #[tokio::test]
    async fn close_then_reopen_then_close_has_three_transitions() {
        // Exercises the round-trip law in spec §8.2.
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        backend.claim("proj-a-1", "s").await.unwrap();
        backend.close("proj-a-1", "r1").await.unwrap();
        backend.reopen("proj-a-1", "r2").await.unwrap();
        backend.claim("proj-a-1", "s").await.unwrap();
        backend.close("proj-a-1", "r3").await.unwrap();

        let task = backend.get("proj-a-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
        assert_eq!(task.notes.matches("closed:").count(), 2);
        assert_eq!(task.notes.matches("reopened:").count(), 1);
    }

    #[tokio::test]
    async fn update_patches_only_given_fields() {
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        let patch = TaskPatch {
            priority: Some(0),
            ..Default::default()
        };
        let updated = backend.update("proj-a-1", &patch).await.unwrap();
        assert_eq!(updated.priority, 0);
        assert_eq!(updated.title, "title");
    }

    #[tokio::test]
    async fn dep_add_rejects_missing_dependency() {
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        let err = backend.dep_add("proj-a-1", "proj-a-99").await.unwrap_err();
        assert!(matches!(err, BackendError::Invalid(_)));
    }

    #[tokio::test]
    async fn labels_and_counts() {
        let (_dir, backend) = store();
        backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        backend.label_add("proj-a-1", "pr").await.unwrap();
        assert_eq!(backend.label_list("proj-a-1").await.unwrap(), vec!["pr".to_string()]);

        let counts = backend.counts().await.unwrap();
        assert_eq!(counts.open, 1);
        assert_eq!(counts.in_progress, 0);
    }

    #[tokio::test]
    async fn delete_missing_task_is_not_found() {
        let (_dir, backend) = store();
        let err = backend.delete("proj-a-1").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn persists_across_backend_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.jsonl");
        {
            let backend = FileTaskBackend::new(&path);
            backend.create(new_task("proj-a-1", BTreeSet::new())).await.unwrap();
        }
        let backend = FileTaskBackend::new(&path);
        let task = backend.get("proj-a-1").await.unwrap();
        assert_eq!(task.id, "proj-a-1");
    }
}
