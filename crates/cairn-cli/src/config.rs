//! Configuration file support

use cairn_agent::guard::AutoApprovalSettings;
use cairn_agent::{HookSettings, TaskConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for cairn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where task history and per-task files live
    pub data_dir: Option<String>,
    /// Custom system prompt file path
    pub system_prompt_file: Option<String>,
    /// Consecutive mistakes before asking for guidance (0 = unlimited)
    pub mistake_limit: Option<u32>,
    /// Minimum seconds between API requests
    pub rate_limit_seconds: Option<f64>,
    /// Seconds an ask may wait for an answer
    pub ask_timeout_seconds: Option<u64>,
    pub max_reparse_bytes: Option<usize>,
    pub auto_approval: AutoApprovalSettings,
    pub hooks: HooksConfig,
}

/// Hook section of the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub enabled: Option<bool>,
    /// Extra hook directories, searched after the workspace and global ones
    pub dirs: Vec<String>,
    pub timeout_seconds: Option<f64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cairn")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CAIRN_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Create the example config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Directory holding `taskHistory.json` and `tasks/`
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => expand_home(dir),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cairn"),
        }
    }

    /// Hook directories: the workspace's `.cairn/hooks`, the global one, then
    /// any configured extras
    pub fn hook_dirs(&self, cwd: &Path) -> Vec<PathBuf> {
        let mut dirs = vec![cwd.join(".cairn").join("hooks"), Self::config_dir().join("hooks")];
        dirs.extend(self.hooks.dirs.iter().map(|d| expand_home(d)));
        dirs
    }

    /// Build the task configuration for a run in `cwd`
    pub fn task_config(&self, cwd: &Path) -> anyhow::Result<TaskConfig> {
        let defaults = TaskConfig::default();
        let system_prompt = match &self.system_prompt_file {
            Some(file) => fs::read_to_string(expand_home(file))?,
            None => default_system_prompt(cwd),
        };

        let mut hooks = HookSettings {
            enabled: self.hooks.enabled.unwrap_or(false),
            dirs: self.hook_dirs(cwd),
            ..HookSettings::default()
        };
        if let Some(secs) = self.hooks.timeout_seconds {
            hooks.timeout = Duration::try_from_secs_f64(secs)?;
        }

        Ok(TaskConfig {
            cwd: cwd.to_path_buf(),
            system_prompt,
            hooks,
            mistake_limit: self.mistake_limit.unwrap_or(defaults.mistake_limit),
            auto_approval: self.auto_approval.clone(),
            rate_limit_seconds: self.rate_limit_seconds.unwrap_or(defaults.rate_limit_seconds),
            max_reparse_bytes: self.max_reparse_bytes.unwrap_or(defaults.max_reparse_bytes),
            ask_timeout: self.ask_timeout_seconds.map(Duration::from_secs),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn default_system_prompt(cwd: &Path) -> String {
    format!(
        "You are cairn, an AI coding assistant. Use exactly one tool per message and \
         place it at the end of the message. When the task is done, present the result \
         with attempt_completion.\n\nWorking directory: {}",
        cwd.display()
    )
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# cairn configuration file
# Place at ~/.config/cairn/config.toml (Linux) or set CAIRN_CONFIG_PATH

# Where task history lives (defaults to the platform data directory)
# data_dir = "~/.local/share/cairn"

# Custom system prompt file (optional)
# system_prompt_file = "~/.config/cairn/system_prompt.txt"

# Consecutive mistakes before asking for guidance (0 = unlimited)
mistake_limit = 3

# Minimum seconds between API requests, shared by a task and its sub-tasks
rate_limit_seconds = 0.0

# Seconds an ask waits for an answer before giving up (optional)
# ask_timeout_seconds = 600

[auto_approval]
enabled = false
readOnly = true
edit = false
command = false
other = false
# API requests allowed before asking again (0 = unlimited)
maxRequests = 20
# maxCost = 1.50

[hooks]
enabled = false
# Searched after <workspace>/.cairn/hooks and ~/.config/cairn/hooks
dirs = []
timeout_seconds = 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.mistake_limit, Some(3));
        assert!(!config.auto_approval.enabled);
        assert_eq!(config.auto_approval.max_requests, 20);
        assert_eq!(config.hooks.timeout_seconds, Some(30.0));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml"));
        assert!(config.data_dir.is_none());
        assert!(config.hooks.enabled.is_none());
    }

    #[test]
    fn test_task_config_maps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(
            r#"
            mistake_limit = 0
            rate_limit_seconds = 2.5
            ask_timeout_seconds = 10
            [auto_approval]
            enabled = true
            command = true
            [hooks]
            enabled = true
            dirs = ["/opt/hooks"]
            timeout_seconds = 5
            "#,
        )
        .unwrap();

        let task = config.task_config(dir.path()).unwrap();
        assert_eq!(task.mistake_limit, 0);
        assert_eq!(task.rate_limit_interval(), Duration::from_millis(2500));
        assert_eq!(task.ask_timeout, Some(Duration::from_secs(10)));
        assert!(task.auto_approval.enabled && task.auto_approval.command);
        assert!(task.hooks.enabled);
        assert_eq!(task.hooks.timeout, Duration::from_secs(5));
        assert_eq!(task.hooks.dirs[0], dir.path().join(".cairn").join("hooks"));
        assert_eq!(task.hooks.dirs.last().unwrap(), &PathBuf::from("/opt/hooks"));
        assert!(task.system_prompt.contains("attempt_completion"));
    }

    #[test]
    fn test_bad_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.hooks.timeout_seconds = Some(-1.0);
        assert!(config.task_config(dir.path()).is_err());
    }
}
