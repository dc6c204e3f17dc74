use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikistats/0.1";
pub const DEFAULT_TIMESLICE_DURATION: i64 = 86_400;
pub const DEFAULT_ADMISSION_THRESHOLD_SECS: i64 = 600;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RATE_LIMIT_READ_MS: u64 = 300;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StatsConfig {
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TrackerSection {
    pub default_timeslice_duration: Option<i64>,
    pub privileged: Option<bool>,
    pub admission_threshold_secs: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_read_ms: Option<u64>,
}

/// Effective settings after applying env > config > default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub default_timeslice_duration: i64,
    pub privileged: bool,
    pub admission_threshold_secs: i64,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
}

impl StatsConfig {
    pub fn settings(&self) -> Settings {
        self.settings_with_lookup(|key| env::var(key).ok())
    }

    pub fn settings_with_lookup<F>(&self, lookup_env: F) -> Settings
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let user_agent = read("WIKISTATS_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let timeout_ms = read("WIKISTATS_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse().ok())
            .or(self.http.timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS);
        let rate_limit_read_ms = read("WIKISTATS_RATE_LIMIT_READ")
            .and_then(|value| value.parse().ok())
            .or(self.http.rate_limit_read_ms)
            .unwrap_or(DEFAULT_RATE_LIMIT_READ_MS);
        let privileged = read("WIKISTATS_PRIVILEGED")
            .and_then(|value| parse_bool(&value))
            .or(self.tracker.privileged)
            .unwrap_or(false);

        Settings {
            default_timeslice_duration: self
                .tracker
                .default_timeslice_duration
                .unwrap_or(DEFAULT_TIMESLICE_DURATION),
            privileged,
            admission_threshold_secs: self
                .tracker
                .admission_threshold_secs
                .unwrap_or(DEFAULT_ADMISSION_THRESHOLD_SECS),
            user_agent,
            timeout_ms,
            rate_limit_read_ms,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        StatsConfig::default().settings_with_lookup(|_| None)
    }
}

/// Load and parse a StatsConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<StatsConfig> {
    if !config_path.exists() {
        return Ok(StatsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: StatsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.default_timeslice_duration, 86_400);
        assert_eq!(settings.admission_threshold_secs, 600);
        assert!(!settings.privileged);
        assert_eq!(settings.user_agent, "wikistats/0.1");
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, StatsConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[tracker]
default_timeslice_duration = 43200
privileged = true

[http]
user_agent = "course-dashboard/2.0"
rate_limit_read_ms = 0
"#,
        )
        .expect("write config");

        let settings = load_config(&config_path)
            .expect("load config")
            .settings_with_lookup(|_| None);
        assert_eq!(settings.default_timeslice_duration, 43_200);
        assert!(settings.privileged);
        assert_eq!(settings.admission_threshold_secs, 600);
        assert_eq!(settings.user_agent, "course-dashboard/2.0");
        assert_eq!(settings.rate_limit_read_ms, 0);
        assert_eq!(settings.timeout_ms, DEFAULT_HTTP_TIMEOUT_MS);
    }

    #[test]
    fn env_overrides_config() {
        let config = StatsConfig {
            http: HttpSection {
                user_agent: Some("from-config".to_string()),
                timeout_ms: Some(1_000),
                rate_limit_read_ms: None,
            },
            tracker: TrackerSection {
                privileged: Some(true),
                ..TrackerSection::default()
            },
        };
        let env = HashMap::from([
            ("WIKISTATS_USER_AGENT", "from-env"),
            ("WIKISTATS_HTTP_TIMEOUT_MS", "not-a-number"),
            ("WIKISTATS_PRIVILEGED", "off"),
        ]);
        let settings =
            config.settings_with_lookup(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(settings.user_agent, "from-env");
        assert_eq!(settings.timeout_ms, 1_000);
        assert!(!settings.privileged);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[tracker\nprivileged = true").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
