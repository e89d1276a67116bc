/// Engine configuration.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workspace root. Task docs, the subtask ledgers, and prompt template
    /// overrides all live under this directory.
    pub workspace_path: PathBuf,

    /// SQLite database file, relative paths resolved against the workspace.
    pub db_path: PathBuf,

    /// Agent CLI command (e.g. "claude").
    pub agent_command: String,

    /// Base arguments prepended before the step prompt.
    pub agent_args: Vec<String>,

    /// Extra environment variables for the agent process.
    pub agent_env: std::collections::HashMap<String, String>,

    /// Maximum execute-loop iterations before soft success.
    pub max_iterations: u32,

    /// Per-invocation timeout in seconds.
    pub step_timeout_secs: u64,

    /// Grace window between SIGTERM and SIGKILL in seconds.
    pub kill_grace_secs: u64,

    /// Queue scheduler poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Global concurrency ceiling across all tasks.
    pub max_concurrent_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_path: PathBuf::from("."),
            db_path: PathBuf::from(".formic/formic.db"),
            agent_command: "claude".to_string(),
            agent_args: Vec::new(),
            agent_env: std::collections::HashMap::new(),
            max_iterations: 5,
            step_timeout_secs: 600,
            kill_grace_secs: 5,
            poll_interval_ms: 5000,
            max_concurrent_tasks: 1,
        }
    }
}

impl EngineConfig {
    /// Resolve the database path against the workspace root.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            self.workspace_path.join(&self.db_path)
        }
    }

    /// Resolve a task's docs path against the workspace root.
    pub fn resolved_docs_path(&self, docs_path: &str) -> PathBuf {
        self.workspace_path.join(docs_path)
    }

    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.step_timeout_secs, 600);
        assert_eq!(config.kill_grace_secs, 5);
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.agent_command, "claude");
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig =
            toml::from_str("agent_command = \"opencode\"\nmax_iterations = 3\n").unwrap();
        assert_eq!(config.agent_command, "opencode");
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.max_concurrent_tasks, 1);
    }

    #[test]
    fn test_db_path_resolution() {
        let mut config = EngineConfig::default();
        config.workspace_path = PathBuf::from("/work");
        assert_eq!(
            config.resolved_db_path(),
            PathBuf::from("/work/.formic/formic.db")
        );
        config.db_path = PathBuf::from("/elsewhere/formic.db");
        assert_eq!(config.resolved_db_path(), PathBuf::from("/elsewhere/formic.db"));
    }
}
