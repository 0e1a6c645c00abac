//! Hierarchical configuration loading with figment.
//!
//! Defaults, then `.crown/config.yaml`, then `.crown/local.yaml`, then
//! `CROWN_*` environment variables. Later sources win.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Tick interval of zero
    #[error("Invalid tick_interval_secs: {0}. Must be at least 1")]
    InvalidTickInterval(u64),

    /// Session grace shorter than two ticks
    #[error("Invalid session_grace_secs: {grace}. Must cover at least two ticks ({min})")]
    SessionGraceTooShort {
        /// Configured grace
        grace: u64,
        /// Two tick intervals
        min: u64,
    },

    /// Dead threshold not above the stuck threshold
    #[error("Invalid health thresholds: dead ({dead}s) must be positive and exceed stuck ({stuck}s)")]
    InvalidHealthThresholds {
        /// Stuck threshold
        stuck: u64,
        /// Dead threshold
        dead: u64,
    },

    /// Base cooldown above the cap
    #[error("Invalid backoff configuration: base_ms ({0}) must not exceed cap_ms ({1})")]
    InvalidBackoff(u64, u64),

    /// Backoff multiplier of zero
    #[error("Invalid backoff multiplier: {0}. Must be at least 1")]
    InvalidMultiplier(u32),

    /// A crown interval, window or threshold of zero
    #[error("Invalid crown setting {0}: must be positive")]
    ZeroCrownSetting(&'static str),

    /// Unknown log level
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Unknown log format
    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    /// Unknown rotation policy
    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    /// Empty database path
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    /// Pool size of zero
    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    /// Empty worker command
    #[error("Dispatch command cannot be empty")]
    EmptyDispatchCommand,
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .crown/config.yaml (project config)
    /// 3. .crown/local.yaml (local overrides, optional)
    /// 4. Environment variables (CROWN_* prefix, `__` between levels)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment(Path::new(".crown/config.yaml"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Like [`ConfigLoader::load`] with `path` in place of `.crown/config.yaml`.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = Self::figment(path)
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(project_file: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(project_file))
            .merge(Yaml::file(".crown/local.yaml"))
            .merge(Env::prefixed("CROWN_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let scheduler = &config.scheduler;
        if scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidTickInterval(0));
        }
        let min_grace = scheduler.tick_interval_secs.saturating_mul(2);
        if scheduler.session_grace_secs < min_grace {
            return Err(ConfigError::SessionGraceTooShort {
                grace: scheduler.session_grace_secs,
                min: min_grace,
            });
        }

        let health = &config.health;
        if health.dead_threshold_secs == 0 || health.dead_threshold_secs <= health.stuck_threshold_secs {
            return Err(ConfigError::InvalidHealthThresholds {
                stuck: health.stuck_threshold_secs,
                dead: health.dead_threshold_secs,
            });
        }

        if config.retry.base_ms > config.retry.cap_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.base_ms,
                config.retry.cap_ms,
            ));
        }
        if config.retry.multiplier < 1 {
            return Err(ConfigError::InvalidMultiplier(config.retry.multiplier));
        }

        let crown = &config.crown;
        let crown_settings = [
            ("interval_secs", crown.interval_secs),
            ("failure_window_secs", crown.failure_window_secs),
            (
                "consecutive_failure_threshold",
                u64::from(crown.consecutive_failure_threshold),
            ),
            ("loop_window_secs", crown.loop_window_secs),
            ("loop_session_threshold", crown.loop_session_threshold as u64),
        ];
        if let Some(&(name, _)) = crown_settings.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroCrownSetting(name));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(0));
        }

        if config.dispatch.command.trim().is_empty() {
            return Err(ConfigError::EmptyDispatchCommand);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.scheduler.tick_interval_secs, 30);
        assert_eq!(config.database.path, ".crown/crown.db");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
scheduler:
  tick_interval_secs: 15
  session_grace_secs: 45
  excluded_categories: [research]
health:
  stuck_threshold_secs: 600
retry:
  cap_ms: 300000
logging:
  level: debug
  format: json
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.scheduler.tick_interval_secs, 15);
        assert_eq!(config.scheduler.excluded_categories, vec!["research"]);
        assert_eq!(config.health.stuck_threshold_secs, 600);
        assert_eq!(config.health.dead_threshold_secs, 1800);
        assert_eq!(config.retry.cap_ms, 300_000);
        assert_eq!(config.retry.base_ms, 60_000);
        assert_eq!(config.logging.format, "json");
        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_tick_interval() {
        let mut config = Config::default();
        config.scheduler.tick_interval_secs = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidTickInterval(0))
        ));
    }

    #[test]
    fn test_validate_session_grace_shorter_than_two_ticks() {
        let mut config = Config::default();
        config.scheduler.session_grace_secs = 45;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::SessionGraceTooShort { grace: 45, min: 60 })
        ));
    }

    #[test]
    fn test_validate_dead_not_after_stuck() {
        let mut config = Config::default();
        config.health.dead_threshold_secs = config.health.stuck_threshold_secs;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidHealthThresholds { .. })
        ));
    }

    #[test]
    fn test_validate_backoff() {
        let mut config = Config::default();
        config.retry.base_ms = 700_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(700_000, 600_000))
        ));

        let mut config = Config::default();
        config.retry.multiplier = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMultiplier(0))
        ));
    }

    #[test]
    fn test_validate_zero_crown_threshold() {
        let mut config = Config::default();
        config.crown.loop_session_threshold = 0;
        match ConfigLoader::validate(&config) {
            Err(ConfigError::ZeroCrownSetting(name)) => assert_eq!(name, "loop_session_threshold"),
            other => panic!("Expected ZeroCrownSetting, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_logging() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(_))
        ));

        let mut config = Config::default();
        config.logging.rotation = "weekly".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogRotation(_))
        ));
    }

    #[test]
    fn test_validate_empty_database_path() {
        let mut config = Config::default();
        config.database.path = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyDatabasePath)
        ));
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "scheduler:\n  tick_interval_secs: 20\n  session_grace_secs: 60\nlogging:\n  level: warn"
        )
        .unwrap();
        file.flush().unwrap();

        temp_env::with_vars(
            [
                ("CROWN_LOGGING__LEVEL", Some("debug")),
                ("CROWN_CROWN__INTERVAL_SECS", Some("120")),
            ],
            || {
                let config = ConfigLoader::load_from_file(file.path()).unwrap();
                assert_eq!(config.scheduler.tick_interval_secs, 20);
                assert_eq!(config.logging.level, "debug", "env wins over file");
                assert_eq!(config.crown.interval_secs, 120);
                assert_eq!(config.health.stuck_threshold_secs, 900);
            },
        );
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "retry:\n  multiplier: 0").unwrap();
        file.flush().unwrap();

        temp_env::with_vars_unset(["CROWN_RETRY__MULTIPLIER"], || {
            assert!(ConfigLoader::load_from_file(file.path()).is_err());
        });
    }

    #[test]
    fn test_hierarchical_merging() {
        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "scheduler:\n  tick_interval_secs: 10\nlogging:\n  level: info\n  format: json"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "scheduler:\n  tick_interval_secs: 5\nlogging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.scheduler.tick_interval_secs, 5, "Override should win");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }
}
