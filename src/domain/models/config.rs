//! Configuration model. Every field has a serde default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration structure for crown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Tick loop and assignment settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Heartbeat thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Retry backoff policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Supervisory loop settings
    #[serde(default)]
    pub crown: CrownConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker process launch settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Notification sink settings
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Tick scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Seconds between ticks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Global spawning switch; when false no task is dispatched
    #[serde(default = "default_true")]
    pub spawning_enabled: bool,

    /// Run the approved-plan ingestion phase
    #[serde(default = "default_true")]
    pub planning_enabled: bool,

    /// Run the QA cycle phase
    #[serde(default = "default_true")]
    pub qa_enabled: bool,

    /// QA cycle runs every N ticks
    #[serde(default = "default_qa_every_n_ticks")]
    pub qa_every_n_ticks: u64,

    /// Retry-queue sweep runs every N ticks
    #[serde(default = "default_retry_sweep_every_n_ticks")]
    pub retry_sweep_every_n_ticks: u64,

    /// Running sessions younger than this are left alone by reconciliation
    #[serde(default = "default_session_grace_secs")]
    pub session_grace_secs: u64,

    /// Task categories never scheduled by the tick loop
    #[serde(default)]
    pub excluded_categories: Vec<String>,

    /// Display-id prefixes never scheduled by the tick loop
    #[serde(default)]
    pub excluded_display_id_prefixes: Vec<String>,

    /// Agent types that take work from the tick loop
    #[serde(default = "default_assignable_agent_types")]
    pub assignable_agent_types: Vec<String>,

    /// Preferred agent type per task category
    #[serde(default = "default_agent_type_preferences")]
    pub agent_type_preferences: BTreeMap<String, String>,

    /// Agent type tried when the preferred one is unavailable
    #[serde(default = "default_fallback_agent_type")]
    pub fallback_agent_type: String,
}

const fn default_tick_interval_secs() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

const fn default_qa_every_n_ticks() -> u64 {
    10
}

const fn default_retry_sweep_every_n_ticks() -> u64 {
    2
}

const fn default_session_grace_secs() -> u64 {
    90
}

fn default_assignable_agent_types() -> Vec<String> {
    ["build", "frontend", "backend", "test", "docs"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_agent_type_preferences() -> BTreeMap<String, String> {
    [
        ("frontend", "frontend"),
        ("ui", "frontend"),
        ("backend", "backend"),
        ("api", "backend"),
        ("test", "test"),
        ("docs", "docs"),
    ]
    .into_iter()
    .map(|(category, agent_type)| (category.to_string(), agent_type.to_string()))
    .collect()
}

fn default_fallback_agent_type() -> String {
    "build".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            spawning_enabled: true,
            planning_enabled: true,
            qa_enabled: true,
            qa_every_n_ticks: default_qa_every_n_ticks(),
            retry_sweep_every_n_ticks: default_retry_sweep_every_n_ticks(),
            session_grace_secs: default_session_grace_secs(),
            excluded_categories: vec![],
            excluded_display_id_prefixes: vec![],
            assignable_agent_types: default_assignable_agent_types(),
            agent_type_preferences: default_agent_type_preferences(),
            fallback_agent_type: default_fallback_agent_type(),
        }
    }
}

/// Heartbeat-based health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Working agent silent this long is marked stuck
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    /// Agent stuck this long is cleaned up
    #[serde(default = "default_dead_threshold_secs")]
    pub dead_threshold_secs: u64,

    /// Idle agent heartbeat older than this is cleared
    #[serde(default = "default_idle_heartbeat_clear_secs")]
    pub idle_heartbeat_clear_secs: u64,

    /// Agent types that never heartbeat (pure orchestration roles)
    #[serde(default = "default_heartbeat_exempt_types")]
    pub heartbeat_exempt_types: Vec<String>,
}

const fn default_stuck_threshold_secs() -> u64 {
    15 * 60
}

const fn default_dead_threshold_secs() -> u64 {
    30 * 60
}

const fn default_idle_heartbeat_clear_secs() -> u64 {
    60 * 60
}

fn default_heartbeat_exempt_types() -> Vec<String> {
    vec!["orchestrator".to_string()]
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_secs: default_stuck_threshold_secs(),
            dead_threshold_secs: default_dead_threshold_secs(),
            idle_heartbeat_clear_secs: default_idle_heartbeat_clear_secs(),
            heartbeat_exempt_types: default_heartbeat_exempt_types(),
        }
    }
}

/// Retry backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Cooldown after the first failure
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    /// Growth factor per retry
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Upper bound on any cooldown
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

const fn default_base_ms() -> u64 {
    60_000
}

const fn default_multiplier() -> u32 {
    2
}

const fn default_cap_ms() -> u64 {
    600_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            multiplier: default_multiplier(),
            cap_ms: default_cap_ms(),
        }
    }
}

/// Supervisory loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CrownConfig {
    /// Seconds between passes
    #[serde(default = "default_crown_interval_secs")]
    pub interval_secs: u64,

    /// Trailing window for per-agent failure statistics
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// Consecutive failures that trigger an agent reset
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    /// Window for reassignment loop detection
    #[serde(default = "default_loop_window_secs")]
    pub loop_window_secs: u64,

    /// Sessions per task inside the window that count as a loop
    #[serde(default = "default_loop_session_threshold")]
    pub loop_session_threshold: usize,

    /// A session started this recently keeps a silent agent from being reset
    #[serde(default = "default_recent_session_grace_secs")]
    pub recent_session_grace_secs: u64,

    /// In-progress tasks updated this recently are not treated as orphans
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,

    /// Dispatch a diagnostic worker after interventions
    #[serde(default = "default_true")]
    pub diagnosis_enabled: bool,

    /// Model label handed to the diagnostic worker
    #[serde(default = "default_diagnosis_model")]
    pub diagnosis_model: String,

    /// Seconds to wait for the diagnostic worker
    #[serde(default = "default_diagnosis_timeout_secs")]
    pub diagnosis_timeout_secs: u64,
}

const fn default_crown_interval_secs() -> u64 {
    10 * 60
}

const fn default_failure_window_secs() -> u64 {
    60 * 60
}

const fn default_consecutive_failure_threshold() -> u32 {
    3
}

const fn default_loop_window_secs() -> u64 {
    10 * 60
}

const fn default_loop_session_threshold() -> usize {
    3
}

const fn default_recent_session_grace_secs() -> u64 {
    5 * 60
}

const fn default_orphan_grace_secs() -> u64 {
    2 * 60
}

fn default_diagnosis_model() -> String {
    "default".to_string()
}

const fn default_diagnosis_timeout_secs() -> u64 {
    15 * 60
}

impl Default for CrownConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_crown_interval_secs(),
            failure_window_secs: default_failure_window_secs(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            loop_window_secs: default_loop_window_secs(),
            loop_session_threshold: default_loop_session_threshold(),
            recent_session_grace_secs: default_recent_session_grace_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
            diagnosis_enabled: true,
            diagnosis_model: default_diagnosis_model(),
            diagnosis_timeout_secs: default_diagnosis_timeout_secs(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".crown/crown.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling JSON log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Worker process launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatchConfig {
    /// Executable launched per task
    #[serde(default = "default_dispatch_command")]
    pub command: String,

    /// Extra arguments passed before the task id
    #[serde(default)]
    pub args: Vec<String>,

    /// Hard limit on a single worker run
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Bytes of worker output kept for diagnosis
    #[serde(default = "default_output_tail_bytes")]
    pub output_tail_bytes: usize,
}

fn default_dispatch_command() -> String {
    "crown-worker".to_string()
}

const fn default_task_timeout_secs() -> u64 {
    60 * 60
}

const fn default_output_tail_bytes() -> usize {
    4_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command: default_dispatch_command(),
            args: vec![],
            task_timeout_secs: default_task_timeout_secs(),
            output_tail_bytes: default_output_tail_bytes(),
        }
    }
}

/// Notification sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotificationConfig {
    /// Webhook receiving alerts; alerts are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Upper bound on webhook posts per minute
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
}

const fn default_max_per_minute() -> u32 {
    20
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            max_per_minute: default_max_per_minute(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.scheduler.tick_interval_secs, 30);
        assert_eq!(config.health.stuck_threshold_secs, 900);
        assert_eq!(config.health.dead_threshold_secs, 1800);
        assert_eq!(config.retry.base_ms, 60_000);
        assert_eq!(config.retry.multiplier, 2);
        assert_eq!(config.retry.cap_ms, 600_000);
        assert_eq!(config.crown.interval_secs, 600);
        assert_eq!(config.crown.loop_session_threshold, 3);
        assert_eq!(config.scheduler.fallback_agent_type, "build");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r"
scheduler:
  tick_interval_secs: 15
  excluded_categories: [research]
health:
  stuck_threshold_secs: 600
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.scheduler.tick_interval_secs, 15);
        assert_eq!(config.scheduler.excluded_categories, vec!["research"]);
        assert!(config.scheduler.spawning_enabled);
        assert_eq!(config.health.stuck_threshold_secs, 600);
        assert_eq!(config.health.dead_threshold_secs, 1800);
        assert_eq!(
            config.scheduler.agent_type_preferences.get("frontend"),
            Some(&"frontend".to_string())
        );
    }
}
