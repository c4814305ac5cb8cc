//! Configuration management for Fanpost

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::{AdaptationRules, ContentAdapter};
use crate::error::{ConfigError, Result};
use crate::types::Platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Adaptation rule overrides keyed by platform identifier
    #[serde(default)]
    pub platforms: HashMap<String, AdaptationRules>,
    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/fanpost/posts.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Posts dispatched concurrently across the whole process
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Maximum publish attempts per destination
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            retry_ceiling: default_retry_ceiling(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Endpoints of the platform agents and the analytics sink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Base URL per platform identifier, e.g. `facebook = "http://localhost:8002"`
    #[serde(default)]
    pub publish: HashMap<String, String>,
    pub analytics_url: Option<String>,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_in_flight() -> usize {
    16
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

fn default_publish_timeout_ms() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(invalid("scheduler.tick_interval_ms", "must be greater than 0").into());
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(invalid("dispatch.max_in_flight", "must be greater than 0").into());
        }
        if self.dispatch.retry_ceiling == 0 {
            return Err(invalid("dispatch.retry_ceiling", "must be at least 1").into());
        }
        if self.dispatch.max_delay_ms < self.dispatch.base_delay_ms {
            return Err(invalid(
                "dispatch.max_delay_ms",
                "must not be smaller than dispatch.base_delay_ms",
            )
            .into());
        }
        if self.dispatch.publish_timeout_ms == 0 {
            return Err(invalid("dispatch.publish_timeout_ms", "must be greater than 0").into());
        }
        for name in self.platforms.keys().chain(self.agents.publish.keys()) {
            name.parse::<Platform>()
                .map_err(|reason| invalid(&format!("platforms.{}", name), &reason))?;
        }
        Ok(())
    }

    /// Build the content adapter with any configured rule overrides applied
    pub fn content_adapter(&self) -> Result<ContentAdapter> {
        let mut adapter = ContentAdapter::new();
        for (name, rules) in &self.platforms {
            let platform = name
                .parse::<Platform>()
                .map_err(|reason| invalid(&format!("platforms.{}", name), &reason))?;
            adapter = adapter.with_rules(platform, rules.clone());
        }
        Ok(adapter)
    }

    /// Expanded database path
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanpost").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.dispatch.retry_ceiling, 3);
        assert_eq!(config.dispatch.max_in_flight, 16);
        assert!(config.dispatch.jitter);
        assert_eq!(config.database.path, "~/.local/share/fanpost/posts.db");
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config = Config::from_toml(
            r#"
[dispatch]
retry_ceiling = 5
jitter = false
"#,
        )
        .unwrap();
        assert_eq!(config.dispatch.retry_ceiling, 5);
        assert!(!config.dispatch.jitter);
        assert_eq!(config.dispatch.base_delay_ms, 1000);
    }

    #[test]
    fn test_zero_retry_ceiling_rejected() {
        let err = Config::from_toml("[dispatch]\nretry_ceiling = 0\n").unwrap_err();
        assert!(err.to_string().contains("dispatch.retry_ceiling"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_zero_tick_rejected() {
        let err = Config::from_toml("[scheduler]\ntick_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("tick_interval_ms"));
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let err = Config::from_toml(
            r#"
[platforms.myspace]
max_text_length = 100
max_media = 1
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("platforms.myspace"));
    }

    #[test]
    fn test_platform_rules_override_adapter() {
        let config = Config::from_toml(
            r#"
[platforms.twitter]
max_text_length = 500
max_media = 2
"#,
        )
        .unwrap();

        let adapter = config.content_adapter().unwrap();
        let rules = adapter.rules(Platform::Twitter);
        assert_eq!(rules.max_text_length, 500);
        assert_eq!(rules.max_media, 2);
        assert_eq!(rules.hashtag_format, "#{}");
        assert_eq!(adapter.rules(Platform::Facebook).max_text_length, 5000);
    }

    #[test]
    fn test_agents_section() {
        let config = Config::from_toml(
            r#"
[agents]
analytics_url = "http://localhost:8005"

[agents.publish]
facebook = "http://localhost:8002"
"#,
        )
        .unwrap();
        assert_eq!(
            config.agents.publish.get("facebook").map(String::as_str),
            Some("http://localhost:8002")
        );
        assert_eq!(
            config.agents.analytics_url.as_deref(),
            Some("http://localhost:8005")
        );
    }

    #[test]
    fn test_load_from_missing_path() {
        let err = Config::load_from_path(Path::new("/nonexistent/fanpost.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_from_env() {
        std::env::set_var("FANPOST_CONFIG", "/tmp/fanpost-test/config.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("FANPOST_CONFIG");
        assert_eq!(path, PathBuf::from("/tmp/fanpost-test/config.toml"));
    }
}
