//! Task configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::guard::AutoApprovalSettings;

/// Default time a hook script may run before it is killed
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default cap on the unfrozen tail re-parsed per text chunk
pub const DEFAULT_MAX_REPARSE_BYTES: usize = 256 * 1024;

/// Lifecycle hook settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSettings {
    pub enabled: bool,
    /// Directories searched, in order, for a script named after each event
    pub dirs: Vec<PathBuf>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dirs: Vec::new(),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }
}

/// Everything a task needs to know that does not come from the provider
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Working directory tools operate in
    pub cwd: PathBuf,
    pub system_prompt: String,
    pub hooks: HookSettings,
    /// Consecutive mistakes before the user is asked for guidance (0 = unlimited)
    pub mistake_limit: u32,
    pub auto_approval: AutoApprovalSettings,
    /// Minimum spacing between API requests across tasks sharing a limiter
    pub rate_limit_seconds: f64,
    pub max_reparse_bytes: usize,
    /// How long an ask may wait for the user (`None` = forever)
    pub ask_timeout: Option<Duration>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            system_prompt: String::new(),
            hooks: HookSettings::default(),
            mistake_limit: 3,
            auto_approval: AutoApprovalSettings::default(),
            rate_limit_seconds: 0.0,
            max_reparse_bytes: DEFAULT_MAX_REPARSE_BYTES,
            ask_timeout: None,
        }
    }
}

impl TaskConfig {
    pub fn rate_limit_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.rate_limit_seconds).unwrap_or_default()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_interval_ignores_invalid_values() {
        let mut config = TaskConfig::default();
        assert_eq!(config.rate_limit_interval(), Duration::ZERO);
        config.rate_limit_seconds = 1.5;
        assert_eq!(config.rate_limit_interval(), Duration::from_millis(1500));
        config.rate_limit_seconds = -2.0;
        assert_eq!(config.rate_limit_interval(), Duration::ZERO);
    }

    #[test]
    fn test_hook_settings_timeout_in_seconds() {
        let settings: HookSettings =
            serde_json::from_value(serde_json::json!({"enabled": true, "timeout": 5})).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert!(settings.dirs.is_empty());
    }
}
