//! Process-wide configuration.
//!
//! Resolution chain, narrowest-wins: CLI flag > environment variable >
//! project config file > built-in default. Mirrors the shape of a
//! connection-string resolver, applied here to project paths and run
//! defaults instead of a database URL.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Overrides project-root autodetection.
pub const PROJECT_DIR_ENV: &str = "CUB_PROJECT_DIR";
/// Enables verbose diagnostic logging.
pub const DEBUG_ENV: &str = "CUB_DEBUG";
/// Explicit path to the project config file, overriding the default lookup.
pub const CONFIG_PATH_ENV: &str = "CUB_CONFIG";
/// Set by the loop during harness invocation; absence means a direct session.
pub const RUN_ACTIVE_ENV: &str = "CUB_RUN_ACTIVE";

/// On-disk project configuration, `{project}/.cub/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub harness: HarnessSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub gate: GateSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessSection {
    /// Default harness name (`claude`, `codex`, ...). Empty means "ask the registry default".
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetSection {
    pub max_cost_usd: Option<f64>,
    pub max_tokens: Option<u64>,
    pub max_tasks: Option<u64>,
    pub max_iterations: Option<u64>,
    /// Fraction of any limit at which a single warning event fires.
    pub warn_at: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSection {
    pub require_clean: Option<bool>,
    pub test_command: Option<Vec<String>>,
    pub typecheck_command: Option<Vec<String>>,
    pub lint_command: Option<Vec<String>>,
    pub command_timeout_secs: Option<u64>,
}

/// Fully resolved, process-wide configuration.
#[derive(Debug, Clone)]
pub struct CubConfig {
    pub project_dir: PathBuf,
    pub debug: bool,
    pub file: ConfigFile,
}

impl CubConfig {
    /// Resolve the project root.
    ///
    /// `CUB_PROJECT_DIR` wins if set; otherwise walk up from the current
    /// directory looking for a `.cub` or `.git` marker, falling back to the
    /// current directory itself.
    pub fn resolve_project_dir(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(p) = explicit {
            return Ok(p.to_path_buf());
        }
        if let Ok(p) = std::env::var(PROJECT_DIR_ENV) {
            return Ok(PathBuf::from(p));
        }
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        let mut dir = cwd.as_path();
        loop {
            if dir.join(".cub").is_dir() || dir.join(".git").exists() {
                return Ok(dir.to_path_buf());
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return Ok(cwd),
            }
        }
    }

    /// Full resolution: project dir, debug flag, and config file (if any).
    pub fn resolve(explicit_project_dir: Option<&Path>) -> Result<Self> {
        let project_dir = Self::resolve_project_dir(explicit_project_dir)?;
        let debug = std::env::var(DEBUG_ENV).map(|v| v != "0" && !v.is_empty()).unwrap_or(false);

        let config_path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_dir.join(".cub").join("config.toml"));

        let file = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config file at {}", config_path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file at {}", config_path.display()))?
        } else {
            ConfigFile::default()
        };

        Ok(Self { project_dir, debug, file })
    }

    /// `{project}/.cub`
    pub fn cub_dir(&self) -> PathBuf {
        self.project_dir.join(".cub")
    }

    /// `{project}/.cub/active-run`
    pub fn active_run_path(&self) -> PathBuf {
        self.cub_dir().join("active-run")
    }

    /// `{project}/.cub/run-sessions`
    pub fn run_sessions_dir(&self) -> PathBuf {
        self.cub_dir().join("run-sessions")
    }

    /// `{project}/.cub/tasks.jsonl`
    pub fn tasks_path(&self) -> PathBuf {
        self.cub_dir().join("tasks.jsonl")
    }

    /// `{project}/.cub/ledger`
    pub fn ledger_root(&self) -> PathBuf {
        self.cub_dir().join("ledger")
    }
}

/// Write a config file, creating parent directories as needed.
pub fn save_config(project_dir: &Path, config: &ConfigFile) -> Result<PathBuf> {
    let dir = project_dir.join(".cub");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join("config.toml");
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(path)
}
