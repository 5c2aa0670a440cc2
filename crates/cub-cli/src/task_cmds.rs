//! `cub task ...`: thin clap wrapper over [`cub_core::task::TaskBackend`].
//!
//! `claim`/`close`/`reopen` keep the task id as the first positional
//! argument and any reason as trailing free-form words (not a `--reason`
//! flag) so that a captured Bash invocation like `cub task close proj-a-3
//! fixed the race` parses the same way under `forensics::classify_bash_command`
//! as it does here.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use cub_core::task::{NewTask, TaskFilters, TaskPatch, TaskType};

use crate::context::Context as CubContext;

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a new task.
    Create {
        id: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, value_enum, default_value = "task")]
        task_type: TaskTypeArg,
        #[arg(long, default_value_t = 2)]
        priority: u8,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        #[arg(long)]
        label: Vec<String>,
    },
    Show { id: String },
    List {
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },
    Claim {
        id: String,
        #[arg(long)]
        session: Option<String>,
    },
    Close {
        id: String,
        #[arg(trailing_var_arg = true)]
        reason: Vec<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Reopen {
        id: String,
        #[arg(trailing_var_arg = true)]
        reason: Vec<String>,
    },
    Delete { id: String },
    Search { query: String },
    Counts,
    Blocked,
    DepAdd { id: String, depends_on: String },
    DepRemove { id: String, depends_on: String },
    DepList { id: String },
    LabelAdd { id: String, label: String },
    LabelRemove { id: String, label: String },
    LabelList { id: String },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum TaskTypeArg {
    Task,
    Feature,
    Bug,
    Epic,
    Gate,
}

impl From<TaskTypeArg> for TaskType {
    fn from(value: TaskTypeArg) -> Self {
        match value {
            TaskTypeArg::Task => TaskType::Task,
            TaskTypeArg::Feature => TaskType::Feature,
            TaskTypeArg::Bug => TaskType::Bug,
            TaskTypeArg::Epic => TaskType::Epic,
            TaskTypeArg::Gate => TaskType::Gate,
        }
    }
}

pub async fn run(ctx: CubContext, command: TaskCommands) -> Result<()> {
    let backend = ctx.task_backend;
    match command {
        TaskCommands::Create { id, title, description, task_type, priority, parent, depends_on, label } => {
            if !cub_core::task::id::is_valid_task_id(&id) {
                bail!("invalid task id: {id:?}");
            }
            let task = backend
                .create(NewTask {
                    id,
                    title,
                    description,
                    task_type: task_type.into(),
                    priority,
                    parent,
                    depends_on: depends_on.into_iter().collect::<BTreeSet<_>>(),
                    labels: label.into_iter().collect::<BTreeSet<_>>(),
                })
                .await
                .context("creating task")?;
            print_task(&task);
        }
        TaskCommands::Show { id } => {
            let task = backend.get(&id).await.context("fetching task")?;
            print_task(&task);
        }
        TaskCommands::List { parent, label } => {
            let filters = TaskFilters { parent, label, task_id: None };
            for task in backend.list(&filters).await.context("listing tasks")? {
                print_task_line(&task);
            }
        }
        TaskCommands::Claim { id, session } => {
            let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
            backend.claim(&id, &session_id).await.context("claiming task")?;
            println!("claimed {id} (session {session_id})");
        }
        TaskCommands::Close { id, reason } => {
            let reason = reason.join(" ");
            backend.close(&id, &reason).await.context("closing task")?;
            println!("closed {id}");
        }
        TaskCommands::Update { id, title, description, priority, assignee, notes } => {
            let patch = TaskPatch { title, description, priority, assignee, notes };
            let task = backend.update(&id, &patch).await.context("updating task")?;
            print_task(&task);
        }
        TaskCommands::Reopen { id, reason } => {
            let reason = reason.join(" ");
            let task = backend.reopen(&id, &reason).await.context("reopening task")?;
            print_task(&task);
        }
        TaskCommands::Delete { id } => {
            backend.delete(&id).await.context("deleting task")?;
            println!("deleted {id}");
        }
        TaskCommands::Search { query } => {
            for task in backend.search(&query).await.context("searching tasks")? {
                print_task_line(&task);
            }
        }
        TaskCommands::Counts => {
            let counts = backend.counts().await.context("counting tasks")?;
            println!("open={} in_progress={} closed={}", counts.open, counts.in_progress, counts.closed);
        }
        TaskCommands::Blocked => {
            for task in backend.blocked().await.context("listing blocked tasks")? {
                print_task_line(&task);
            }
        }
        TaskCommands::DepAdd { id, depends_on } => {
            backend.dep_add(&id, &depends_on).await.context("adding dependency")?;
        }
        TaskCommands::DepRemove { id, depends_on } => {
            backend.dep_remove(&id, &depends_on).await.context("removing dependency")?;
        }
        TaskCommands::DepList { id } => {
            for dep in backend.dep_list(&id).await.context("listing dependencies")? {
                println!("{dep}");
            }
        }
        TaskCommands::LabelAdd { id, label } => {
            backend.label_add(&id, &label).await.context("adding label")?;
        }
        TaskCommands::LabelRemove { id, label } => {
            backend.label_remove(&id, &label).await.context("removing label")?;
        }
        TaskCommands::LabelList { id } => {
            for label in backend.label_list(&id).await.context("listing labels")? {
                println!("{label}");
            }
        }
    }
    Ok(())
}

fn print_task(task: &cub_core::task::Task) {
    println!("{}", serde_json::to_string_pretty(task).unwrap_or_else(|_| format!("{task:?}")));
}

fn print_task_line(task: &cub_core::task::Task) {
    println!("{}\t{}\t{}\t{}", task.id, task.status, task.priority, task.title);
}
