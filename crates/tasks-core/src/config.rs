//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Durations are written with a unit suffix: `"250ms"`, `"20s"`, `"5m"`, `"24h"`.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub runners_count: usize,
    pub stalking_runners_count: usize,

    #[serde(deserialize_with = "de_duration")]
    pub poll_for_task_updates_period: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub poll_for_tasks_period_min: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub poll_for_tasks_period_max: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub poll_for_stalling_tasks_period_min: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub poll_for_stalling_tasks_period_max: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub task_ping_period: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub task_stalling_timeout: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub task_waiting_timeout: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub schedule_regular_tasks_period_min: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub schedule_regular_tasks_period_max: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub ended_task_expiration_timeout: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub clear_ended_tasks_task_schedule_interval: Duration,
    pub clear_ended_tasks_limit: usize,

    pub max_retriable_error_count: u64,

    #[serde(deserialize_with = "de_duration")]
    pub hanging_task_timeout: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub hanging_task_check_period: Duration,
    pub except_hanging_task_types: Vec<String>,

    /// Per task type cap on concurrent executions on one host.
    pub inflight_task_per_node_limits: HashMap<String, u64>,

    /// Zones served by this process. Empty serves every zone.
    pub zone_ids: Vec<String>,

    #[serde(deserialize_with = "de_duration")]
    pub heartbeat_period: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub node_liveness_timeout: Duration,

    pub tasks_to_list_limit: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            runners_count: 4,
            stalking_runners_count: 2,
            poll_for_task_updates_period: Duration::from_secs(1),
            poll_for_tasks_period_min: Duration::from_secs(1),
            poll_for_tasks_period_max: Duration::from_secs(5),
            poll_for_stalling_tasks_period_min: Duration::from_secs(1),
            poll_for_stalling_tasks_period_max: Duration::from_secs(20),
            task_ping_period: Duration::from_secs(2),
            task_stalling_timeout: Duration::from_secs(20),
            task_waiting_timeout: Duration::from_secs(10),
            schedule_regular_tasks_period_min: Duration::from_secs(2),
            schedule_regular_tasks_period_max: Duration::from_secs(4),
            ended_task_expiration_timeout: Duration::from_secs(24 * 60 * 60),
            clear_ended_tasks_task_schedule_interval: Duration::from_secs(60),
            clear_ended_tasks_limit: 1000,
            max_retriable_error_count: 100,
            hanging_task_timeout: Duration::from_secs(60 * 60),
            hanging_task_check_period: Duration::from_secs(15),
            except_hanging_task_types: Vec::new(),
            inflight_task_per_node_limits: HashMap::new(),
            zone_ids: Vec::new(),
            heartbeat_period: Duration::from_secs(10),
            node_liveness_timeout: Duration::from_secs(30),
            tasks_to_list_limit: 100,
        }
    }
}

impl TasksConfig {
    /// Parse config from a TOML string, then apply `TASKS_*` overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Convention: `TASKS_<FIELD>` overrides `<field>`.
    /// - `TASKS_RUNNERS_COUNT`, `TASKS_STALKING_RUNNERS_COUNT`
    /// - `TASKS_TASK_PING_PERIOD`, `TASKS_TASK_STALLING_TIMEOUT`
    /// - `TASKS_MAX_RETRIABLE_ERROR_COUNT`
    /// - `TASKS_ZONE_IDS` (comma separated)
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("TASKS_RUNNERS_COUNT") {
            self.runners_count = parse_number("runners_count", &v)?;
        }
        if let Some(v) = lookup("TASKS_STALKING_RUNNERS_COUNT") {
            self.stalking_runners_count = parse_number("stalking_runners_count", &v)?;
        }
        if let Some(v) = lookup("TASKS_TASK_PING_PERIOD") {
            self.task_ping_period = parse_duration(&v)?;
        }
        if let Some(v) = lookup("TASKS_TASK_STALLING_TIMEOUT") {
            self.task_stalling_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("TASKS_TASK_WAITING_TIMEOUT") {
            self.task_waiting_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("TASKS_MAX_RETRIABLE_ERROR_COUNT") {
            self.max_retriable_error_count = parse_number("max_retriable_error_count", &v)?;
        }
        if let Some(v) = lookup("TASKS_HANGING_TASK_TIMEOUT") {
            self.hanging_task_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("TASKS_ZONE_IDS") {
            self.zone_ids = v
                .split(',')
                .map(str::trim)
                .filter(|z| !z.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ranges = [
            (
                "poll_for_tasks_period",
                self.poll_for_tasks_period_min,
                self.poll_for_tasks_period_max,
            ),
            (
                "poll_for_stalling_tasks_period",
                self.poll_for_stalling_tasks_period_min,
                self.poll_for_stalling_tasks_period_max,
            ),
            (
                "schedule_regular_tasks_period",
                self.schedule_regular_tasks_period_min,
                self.schedule_regular_tasks_period_max,
            ),
        ];
        for (field, min, max) in ranges {
            if min > max {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("min {min:?} is greater than max {max:?}"),
                });
            }
        }

        let periods = [
            ("poll_for_task_updates_period", self.poll_for_task_updates_period),
            ("poll_for_tasks_period_max", self.poll_for_tasks_period_max),
            (
                "poll_for_stalling_tasks_period_max",
                self.poll_for_stalling_tasks_period_max,
            ),
            ("task_ping_period", self.task_ping_period),
            ("hanging_task_check_period", self.hanging_task_check_period),
            ("heartbeat_period", self.heartbeat_period),
        ];
        for (field, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be positive".into(),
                });
            }
        }

        if self.tasks_to_list_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "tasks_to_list_limit",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Concurrency cap for `task_type` on this host, if any.
    pub fn inflight_limit(&self, task_type: &str) -> Option<u64> {
        self.inflight_task_per_node_limits.get(task_type).copied()
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("{raw:?} is not a number"),
    })
}

/// `"150ms"`, `"2s"`, `"5m"`, `"1h"`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string()))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(invalid()),
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}
