use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskweaveError};

/// Top-level Taskweave configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            aggregator: AggregatorConfig::default(),
            merge: MergeConfig::default(),
            log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How many times a failed task may be reopened.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    /// Broadcast buffer for engine events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Complete start/end placeholder nodes as soon as they are ready.
    #[serde(default = "default_auto_complete_placeholders")]
    pub auto_complete_placeholders: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_task_retries: default_max_task_retries(),
            event_capacity: default_event_capacity(),
            auto_complete_placeholders: default_auto_complete_placeholders(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Default: <workspace>/taskweave.db
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Deepest subdivision level walked when building a tree.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Joins the replaced node key and the child node key when renaming.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Mark the source version superseded after a merge.
    #[serde(default)]
    pub supersede_original: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            supersede_original: false,
        }
    }
}

/// JSONL event journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable the journal (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for journal files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = instance lifecycle, 2 = + node transitions, 3 = + task detail (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_workspace() -> String { "~/.taskweave".to_string() }
fn default_max_task_retries() -> u32 { 3 }
fn default_event_capacity() -> usize { 256 }
fn default_auto_complete_placeholders() -> bool { true }
fn default_max_depth() -> usize { 8 }
fn default_separator() -> String { ".".to_string() }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TaskweaveError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TaskweaveError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.event_capacity == 0 {
            return Err(TaskweaveError::Config(
                "engine.event_capacity must be positive".into(),
            ));
        }
        if self.merge.separator.is_empty() {
            return Err(TaskweaveError::Config("merge.separator is empty".into()));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(TaskweaveError::Config(format!(
                    "log.level must be 1-3, got {}",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    /// Database path, defaulting into the workspace.
    pub fn store_path(&self) -> PathBuf {
        match &self.store.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("taskweave.db"),
        }
    }

    /// Journal directory, if the journal is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
