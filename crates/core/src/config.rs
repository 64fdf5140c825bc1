//! Application configuration loaded from a TOML file.
//!
//! Every field has a documented default so a missing or partial file still
//! yields a runnable configuration. Malformed duration strings fall back to
//! their defaults with an error log rather than failing startup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::error;

use crate::errors::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Hand tasks out to requesting nodes.
    #[serde(default = "default_true")]
    pub assign_tasks_enabled: bool,
    /// Create new tasks from filter queries.
    #[serde(default = "default_true")]
    pub create_tasks_enabled: bool,
    /// Reclaim previously created but unowned tasks into the queues.
    #[serde(default = "default_true")]
    pub fill_task_queue_enabled: bool,
    /// Cap on the summed size of all in-memory filter queues.
    #[serde(default = "default_total_queue_size")]
    pub total_queue_size: usize,
    /// Minimum time between create cycles, e.g. "10s".
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Age beyond which completed/failed tasks are physically deleted, e.g. "1d".
    #[serde(default = "default_delete_age")]
    pub delete_age: String,
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_database_url() -> String {
    "postgres://localhost/procq".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_total_queue_size() -> usize {
    1000
}

fn default_poll_interval() -> String {
    "10s".to_string()
}

fn default_delete_age() -> String {
    "1d".to_string()
}

fn default_delete_batch_size() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assign_tasks_enabled: true,
            create_tasks_enabled: true,
            fill_task_queue_enabled: true,
            total_queue_size: default_total_queue_size(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            delete_age: default_delete_age(),
            delete_batch_size: default_delete_batch_size(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> SchedulerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| SchedulerError::Configuration(format!("invalid config: {e}")))
    }
}

impl SchedulerConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        duration_or_default(&self.poll_interval, &default_poll_interval())
    }
}

impl RetentionConfig {
    pub fn delete_age_duration(&self) -> Duration {
        duration_or_default(&self.delete_age, &default_delete_age())
    }
}

/// Parse a duration string such as "500ms", "10s", "5m", "2h" or "1d".
pub fn parse_duration(value: &str) -> SchedulerResult<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SchedulerError::Configuration(format!("missing unit in '{value}'")))?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| SchedulerError::Configuration(format!("invalid duration '{value}'")))?;
    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        "d" => Duration::from_secs(amount * 86_400),
        other => {
            return Err(SchedulerError::Configuration(format!(
                "unknown duration unit '{other}' in '{value}'"
            )))
        }
    };
    Ok(duration)
}

fn duration_or_default(value: &str, default: &str) -> Duration {
    match parse_duration(value) {
        Ok(d) => d,
        Err(e) => {
            error!("{e}, falling back to default '{default}'");
            parse_duration(default).unwrap_or(Duration::from_secs(10))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10y").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn malformed_delete_age_falls_back_to_default() {
        let retention = RetentionConfig {
            delete_age: "soon".to_string(),
            delete_batch_size: 1000,
        };
        assert_eq!(retention.delete_age_duration(), Duration::from_secs(86_400));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.scheduler.assign_tasks_enabled);
        assert_eq!(config.scheduler.total_queue_size, 1000);
        assert_eq!(config.retention.delete_batch_size, 1000);
        assert_eq!(
            config.scheduler.poll_interval_duration(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [scheduler]
            total_queue_size = 50
            assign_tasks_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.total_queue_size, 50);
        assert!(!config.scheduler.assign_tasks_enabled);
        assert!(config.scheduler.create_tasks_enabled);
    }
}
